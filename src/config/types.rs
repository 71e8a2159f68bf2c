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

//! Configuration schema for the YAML file.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::hop::{HopChain, HopDescriptor, HopError};
use crate::ssh::auth::{AuthMethod, HopAuth, ServerCheckMethod};

/// Root of `hopgate.yaml`.
///
/// ```yaml
/// server:
///   port: 2222
///   host_keys: [/etc/hopgate/ssh_host_ed25519_key]
/// recording:
///   logs_dir: /var/log/hopgate
/// users:
///   - name: alice
///     authorized_keys: ["ssh-ed25519 AAAA... alice@laptop"]
/// targets:
///   db1:
///     hops:
///       - address: jump.example.com:22
///         user: bastion
///         auth: { key_file: /etc/hopgate/id_ed25519 }
///         host_key: { known_hosts: /etc/hopgate/known_hosts }
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct HopgateConfig {
    pub server: ServerSettings,
    pub recording: RecordingSettings,
    /// Identities allowed to log in.
    pub users: Vec<UserEntry>,
    /// Hop chains, keyed by the login name that selects them.
    pub targets: BTreeMap<String, TargetEntry>,
}

/// Listener settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Default: "0.0.0.0"
    pub bind_address: String,

    /// Default: 2222
    pub port: u16,

    /// Paths to SSH host private keys.
    pub host_keys: Vec<PathBuf>,

    /// Authentication attempts allowed per connection.
    ///
    /// Default: 6
    pub max_auth_attempts: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 2222,
            host_keys: Vec::new(),
            max_auth_attempts: 6,
        }
    }
}

impl ServerSettings {
    pub fn listen_address(&self) -> String {
        if self.bind_address.contains(':') {
            format!("[{}]:{}", self.bind_address, self.port)
        } else {
            format!("{}:{}", self.bind_address, self.port)
        }
    }
}

/// Where recordings go and what happens when one cannot be opened.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RecordingSettings {
    /// Default: /var/log/hopgate
    pub logs_dir: PathBuf,

    pub on_open_failure: RecordingFailurePolicy,
}

impl Default for RecordingSettings {
    fn default() -> Self {
        Self {
            logs_dir: PathBuf::from("/var/log/hopgate"),
            on_open_failure: RecordingFailurePolicy::default(),
        }
    }
}

/// Reaction to a recording that cannot be opened.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RecordingFailurePolicy {
    /// Close the affected channel and keep serving.
    #[default]
    CloseSession,
    /// Stop the whole server.
    Terminate,
}

/// One identity and its public keys.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UserEntry {
    pub name: String,

    /// Keys in `authorized_keys` line format.
    #[serde(default)]
    pub authorized_keys: Vec<String>,

    /// Targets this user may reach. All targets when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_targets: Option<Vec<String>>,
}

/// A named hop chain.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TargetEntry {
    /// Overrides `recording.logs_dir` for this target.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logs_dir: Option<PathBuf>,

    pub hops: Vec<HopEntry>,

    /// Seconds allowed per hop to connect and authenticate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connect_timeout: Option<u64>,
}

impl TargetEntry {
    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout.map(Duration::from_secs)
    }

    /// Build the hop chain, recording into `logs_dir` unless overridden.
    pub fn to_chain(&self, logs_dir: &Path) -> Result<HopChain, HopError> {
        let log_location = self.logs_dir.as_deref().unwrap_or(logs_dir);
        let hops = self
            .hops
            .iter()
            .map(|hop| hop.to_descriptor(log_location))
            .collect();
        Ok(HopChain::new(hops)?.with_connect_timeout(self.connect_timeout()))
    }
}

/// One backend SSH server.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HopEntry {
    /// `host:port`
    pub address: String,
    pub user: String,
    pub auth: HopAuthEntry,
    #[serde(default)]
    pub host_key: HostKeyEntry,
}

impl HopEntry {
    pub fn to_descriptor(&self, log_location: &Path) -> HopDescriptor {
        HopDescriptor {
            address: self.address.clone(),
            auth: HopAuth::new(
                self.user.clone(),
                self.auth.to_method(),
                self.host_key.to_server_check(),
            ),
            log_location: log_location.to_path_buf(),
        }
    }
}

/// Credentials for a hop.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum HopAuthEntry {
    Password { password: String },

    KeyFile {
        key_file: PathBuf,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        passphrase: Option<String>,
    },

    /// Inline OpenSSH private key.
    Key {
        key: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        passphrase: Option<String>,
    },
}

impl HopAuthEntry {
    pub fn to_method(&self) -> AuthMethod {
        match self {
            Self::Password { password } => AuthMethod::with_password(password),
            Self::KeyFile {
                key_file,
                passphrase,
            } => AuthMethod::with_key_file(key_file, passphrase.as_deref()),
            Self::Key { key, passphrase } => AuthMethod::with_key(key, passphrase.as_deref()),
        }
    }
}

/// Host key verification for a hop.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum HostKeyEntry {
    Mode(HostKeyMode),

    KnownHosts { known_hosts: PathBuf },

    /// Base64 key blob, optionally preceded by the algorithm name.
    PublicKey { public_key: String },
}

impl Default for HostKeyEntry {
    fn default() -> Self {
        let known_hosts = dirs::home_dir()
            .map(|home| home.join(".ssh").join("known_hosts"))
            .unwrap_or_else(|| PathBuf::from("/etc/ssh/ssh_known_hosts"));
        Self::KnownHosts { known_hosts }
    }
}

impl HostKeyEntry {
    pub fn to_server_check(&self) -> ServerCheckMethod {
        match self {
            Self::Mode(HostKeyMode::InsecureAcceptAny) => ServerCheckMethod::NoCheck,
            Self::KnownHosts { known_hosts } => {
                ServerCheckMethod::KnownHostsFile(known_hosts.clone())
            }
            Self::PublicKey { public_key } => {
                // "ssh-ed25519 AAAA..." or the bare blob
                let mut fields = public_key.split_whitespace();
                let first = fields.next().unwrap_or_default();
                let blob = fields.next().unwrap_or(first);
                ServerCheckMethod::PublicKey(blob.to_string())
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum HostKeyMode {
    #[serde(rename = "insecure-accept-any")]
    InsecureAcceptAny,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = HopgateConfig::default();
        assert_eq!(config.server.port, 2222);
        assert_eq!(config.server.max_auth_attempts, 6);
        assert_eq!(
            config.recording.on_open_failure,
            RecordingFailurePolicy::CloseSession
        );
        assert!(config.targets.is_empty());
    }

    #[test]
    fn test_listen_address() {
        let mut server = ServerSettings::default();
        assert_eq!(server.listen_address(), "0.0.0.0:2222");
        server.bind_address = "::1".to_string();
        assert_eq!(server.listen_address(), "[::1]:2222");
    }

    #[test]
    fn test_hop_entry_variants() {
        let yaml = r#"
- address: jump.example.com:22
  user: bastion
  auth: { key_file: /etc/hopgate/id_ed25519 }
  host_key: { known_hosts: /etc/hopgate/known_hosts }
- address: 10.0.0.5:22
  user: root
  auth: { password: secret }
  host_key: insecure-accept-any
- address: 10.0.0.6:22
  user: root
  auth: { key_file: /k, passphrase: pw }
  host_key: { public_key: AAAAC3NzaC1lZDI1NTE5AAAAIEhLfbRHwEyWJ9Z0fD7bKx2XGvUi5fDmJ7KX0vCq8+mT }
"#;
        let hops: Vec<HopEntry> = serde_yaml::from_str(yaml).unwrap();
        assert!(matches!(hops[0].auth, HopAuthEntry::KeyFile { passphrase: None, .. }));
        assert_eq!(
            hops[0].host_key,
            HostKeyEntry::KnownHosts {
                known_hosts: PathBuf::from("/etc/hopgate/known_hosts")
            }
        );
        assert!(matches!(hops[1].auth, HopAuthEntry::Password { .. }));
        assert_eq!(
            hops[1].host_key,
            HostKeyEntry::Mode(HostKeyMode::InsecureAcceptAny)
        );
        assert!(matches!(
            hops[2].auth,
            HopAuthEntry::KeyFile { passphrase: Some(_), .. }
        ));
        assert!(matches!(hops[2].host_key, HostKeyEntry::PublicKey { .. }));
    }

    #[test]
    fn test_target_to_chain() {
        let yaml = r#"
logs_dir: /srv/rec/db1
connect_timeout: 5
hops:
  - address: jump:22
    user: bastion
    auth: { password: pw }
    host_key: insecure-accept-any
  - address: db1:22
    user: root
    auth: { key_file: /k }
    host_key: { public_key: "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIEhLfbRHwEyWJ9Z0fD7bKx2XGvUi5fDmJ7KX0vCq8+mT" }
"#;
        let target: TargetEntry = serde_yaml::from_str(yaml).unwrap();
        let chain = target.to_chain(Path::new("/var/log/hopgate")).unwrap();
        assert_eq!(chain.len(), 2);
        assert_eq!(chain.recording_location(), Path::new("/srv/rec/db1"));
        assert_eq!(chain.connect_timeout(), Some(Duration::from_secs(5)));
        assert_eq!(chain.hops()[0].auth.server_check, ServerCheckMethod::NoCheck);
        assert_eq!(
            chain.last().auth.server_check,
            ServerCheckMethod::PublicKey(
                "AAAAC3NzaC1lZDI1NTE5AAAAIEhLfbRHwEyWJ9Z0fD7bKx2XGvUi5fDmJ7KX0vCq8+mT".to_string()
            )
        );
    }

    #[test]
    fn test_target_without_hops() {
        let target = TargetEntry {
            logs_dir: None,
            hops: Vec::new(),
            connect_timeout: None,
        };
        assert!(matches!(
            target.to_chain(Path::new("/tmp")),
            Err(HopError::EmptyChain)
        ));
    }

    #[test]
    fn test_policy_names() {
        let policy: RecordingFailurePolicy = serde_yaml::from_str("terminate").unwrap();
        assert_eq!(policy, RecordingFailurePolicy::Terminate);
        let policy: RecordingFailurePolicy = serde_yaml::from_str("close-session").unwrap();
        assert_eq!(policy, RecordingFailurePolicy::CloseSession);
    }

    #[test]
    fn test_unknown_host_key_mode_is_rejected() {
        assert!(serde_yaml::from_str::<HostKeyEntry>("accept-everything").is_err());
    }
}
