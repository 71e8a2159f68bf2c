// Copyright 2025 Lablup Inc. and Jeongkyu Shin
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Who may log in and where their channels go.
//!
//! The login name picks a target; the presented public key picks the
//! identity. Both lookups happen during authentication so that a client
//! without a reachable target never gets a session.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use anyhow::{Context, Result};
use russh::keys::ssh_key;
use russh::keys::PublicKey;

use crate::config::HopgateConfig;
use crate::hop::HopChain;
use crate::shared::session::AuthenticatedIdentity;

/// Maps a presented key to an identity.
pub trait IdentityProvider: Send + Sync {
    fn identify(&self, key: &PublicKey) -> Option<AuthenticatedIdentity>;
}

/// Maps an identity and a target name to a hop chain.
pub trait ChainResolver: Send + Sync {
    fn resolve(&self, identity: &AuthenticatedIdentity, target: &str) -> Option<HopChain>;
}

/// Parse one `authorized_keys` style line (`algorithm base64 [comment]`).
pub fn parse_authorized_key(line: &str) -> Result<PublicKey, ssh_key::Error> {
    PublicKey::from_openssh(line.trim())
}

#[derive(Debug)]
struct DirectoryUser {
    identity: AuthenticatedIdentity,
    keys: Vec<PublicKey>,
    allowed_targets: Option<HashSet<String>>,
}

/// Users and targets from the configuration file.
#[derive(Debug, Default)]
pub struct ConfigDirectory {
    users: Vec<DirectoryUser>,
    targets: HashMap<String, HopChain>,
}

impl ConfigDirectory {
    pub fn from_config(config: &HopgateConfig) -> Result<Self> {
        let mut users = Vec::with_capacity(config.users.len());
        for user in &config.users {
            let keys = user
                .authorized_keys
                .iter()
                .map(|line| parse_authorized_key(line))
                .collect::<Result<Vec<_>, _>>()
                .with_context(|| format!("invalid authorized key for user {}", user.name))?;
            users.push(DirectoryUser {
                identity: AuthenticatedIdentity::new(user.name.clone()),
                keys,
                allowed_targets: user
                    .allowed_targets
                    .as_ref()
                    .map(|targets| targets.iter().cloned().collect()),
            });
        }

        let logs_dir: &Path = &config.recording.logs_dir;
        let mut targets = HashMap::with_capacity(config.targets.len());
        for (name, target) in &config.targets {
            let chain = target
                .to_chain(logs_dir)
                .with_context(|| format!("invalid target {name}"))?;
            targets.insert(name.clone(), chain);
        }

        Ok(Self { users, targets })
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    pub fn target_count(&self) -> usize {
        self.targets.len()
    }
}

impl IdentityProvider for ConfigDirectory {
    fn identify(&self, key: &PublicKey) -> Option<AuthenticatedIdentity> {
        self.users
            .iter()
            .find(|user| user.keys.iter().any(|k| k.key_data() == key.key_data()))
            .map(|user| user.identity.clone())
    }
}

impl ChainResolver for ConfigDirectory {
    fn resolve(&self, identity: &AuthenticatedIdentity, target: &str) -> Option<HopChain> {
        let user = self.users.iter().find(|u| u.identity == *identity)?;
        if let Some(allowed) = &user.allowed_targets {
            if !allowed.contains(target) {
                return None;
            }
        }
        self.targets.get(target).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALICE_KEY: &str =
        "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIEhLfbRHwEyWJ9Z0fD7bKx2XGvUi5fDmJ7KX0vCq8+mT alice@laptop";

    fn directory(allowed: Option<Vec<&str>>) -> ConfigDirectory {
        let yaml = r#"
recording:
  logs_dir: /var/log/hopgate
users:
  - name: alice
    authorized_keys:
      - "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIEhLfbRHwEyWJ9Z0fD7bKx2XGvUi5fDmJ7KX0vCq8+mT alice@laptop"
targets:
  db1:
    hops:
      - address: jump:22
        user: bastion
        auth: { password: pw }
        host_key: insecure-accept-any
  web:
    logs_dir: /srv/web
    hops:
      - address: web:22
        user: deploy
        auth: { password: pw }
        host_key: insecure-accept-any
"#;
        let mut config: HopgateConfig = serde_yaml::from_str(yaml).unwrap();
        config.users[0].allowed_targets =
            allowed.map(|targets| targets.into_iter().map(String::from).collect());
        ConfigDirectory::from_config(&config).unwrap()
    }

    #[test]
    fn test_identify_by_key() {
        let directory = directory(None);
        assert_eq!(directory.user_count(), 1);
        assert_eq!(directory.target_count(), 2);

        let key = parse_authorized_key(ALICE_KEY).unwrap();
        let identity = directory.identify(&key).unwrap();
        assert_eq!(identity.name, "alice");
    }

    #[test]
    fn test_unknown_key() {
        let directory = directory(None);
        let other = parse_authorized_key(
            "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIAECAwQFBgcICQoLDA0ODxAREhMUFRYXGBkaGxwdHh8g",
        )
        .unwrap();
        assert!(directory.identify(&other).is_none());
    }

    #[test]
    fn test_resolve_targets() {
        let directory = directory(None);
        let alice = AuthenticatedIdentity::new("alice");
        let web = directory.resolve(&alice, "web").unwrap();
        assert_eq!(web.recording_location(), Path::new("/srv/web"));
        let db1 = directory.resolve(&alice, "db1").unwrap();
        assert_eq!(db1.recording_location(), Path::new("/var/log/hopgate"));
        assert!(directory.resolve(&alice, "missing").is_none());
        assert!(directory
            .resolve(&AuthenticatedIdentity::new("mallory"), "db1")
            .is_none());
    }

    #[test]
    fn test_allowed_targets() {
        let directory = directory(Some(vec!["web"]));
        let alice = AuthenticatedIdentity::new("alice");
        assert!(directory.resolve(&alice, "web").is_some());
        assert!(directory.resolve(&alice, "db1").is_none());
    }

    #[test]
    fn test_invalid_authorized_key() {
        assert!(parse_authorized_key("ssh-ed25519 not-base64").is_err());
    }
}
