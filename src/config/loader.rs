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

//! Configuration loading.
//!
//! Precedence, highest first:
//! 1. CLI arguments (applied by the binary)
//! 2. Environment variables (`HOPGATE_*`)
//! 3. Configuration file (YAML)
//! 4. Default values

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use super::types::{
    HopAuthEntry, HopEntry, HopgateConfig, HostKeyEntry, HostKeyMode, TargetEntry, UserEntry,
};
use crate::ssh::client::split_address;

/// Load, override from the environment and validate.
///
/// Without `config_path` the first existing file among
/// [`default_config_paths`] is used; if none exists the defaults apply.
///
/// # Environment Variables
///
/// - `HOPGATE_BIND_ADDRESS` - listen address
/// - `HOPGATE_PORT` - listen port
/// - `HOPGATE_HOST_KEY` - comma-separated host key paths
/// - `HOPGATE_LOGS_DIR` - default recording directory
pub fn load_config(config_path: Option<&Path>) -> Result<HopgateConfig> {
    let mut config = HopgateConfig::default();

    if let Some(path) = config_path {
        config = load_config_file(path).context("Failed to load configuration file")?;
        tracing::info!(path = %path.display(), "Loaded configuration from file");
    } else if let Some(path) = default_config_paths().into_iter().find(|p| p.exists()) {
        config = load_config_file(&path).context("Failed to load configuration file")?;
        tracing::info!(path = %path.display(), "Loaded configuration from file");
    }

    config = apply_env_overrides(config)?;
    validate_config(&config)?;

    Ok(config)
}

/// Render an annotated example configuration.
pub fn generate_config_template() -> String {
    let mut yaml = String::new();

    yaml.push_str("# hopgate configuration file\n");
    yaml.push_str("#\n");
    yaml.push_str("# Clients log in as the name of a target; the channel is proxied\n");
    yaml.push_str("# through that target's hops, last hop last, and recorded under\n");
    yaml.push_str("# the target's logs_dir (recording.logs_dir when unset).\n");
    yaml.push_str("#\n");
    yaml.push_str("# Precedence: CLI arguments, HOPGATE_* environment variables,\n");
    yaml.push_str("# this file, built-in defaults.\n\n");

    let template = template_config();
    match serde_yaml::to_string(&template) {
        Ok(body) => yaml.push_str(&body),
        Err(error) => {
            tracing::warn!(%error, "failed to render configuration template");
        }
    }

    yaml
}

fn template_config() -> HopgateConfig {
    let mut config = HopgateConfig::default();
    config.server.host_keys = vec![PathBuf::from("/etc/hopgate/ssh_host_ed25519_key")];
    config.users = vec![UserEntry {
        name: "alice".to_string(),
        authorized_keys: vec![
            "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIEhLfbRHwEyWJ9Z0fD7bKx2XGvUi5fDmJ7KX0vCq8+mT alice@laptop"
                .to_string(),
        ],
        allowed_targets: None,
    }];

    let mut targets = BTreeMap::new();
    targets.insert(
        "db1".to_string(),
        TargetEntry {
            logs_dir: None,
            hops: vec![
                HopEntry {
                    address: "jump.example.com:22".to_string(),
                    user: "bastion".to_string(),
                    auth: HopAuthEntry::KeyFile {
                        key_file: PathBuf::from("/etc/hopgate/id_ed25519"),
                        passphrase: None,
                    },
                    host_key: HostKeyEntry::KnownHosts {
                        known_hosts: PathBuf::from("/etc/hopgate/known_hosts"),
                    },
                },
                HopEntry {
                    address: "10.0.0.5:22".to_string(),
                    user: "root".to_string(),
                    auth: HopAuthEntry::KeyFile {
                        key_file: PathBuf::from("/etc/hopgate/id_ed25519"),
                        passphrase: None,
                    },
                    host_key: HostKeyEntry::Mode(HostKeyMode::InsecureAcceptAny),
                },
            ],
            connect_timeout: Some(10),
        },
    );
    config.targets = targets;
    config
}

/// Load configuration from a YAML file.
pub fn load_config_file(path: &Path) -> Result<HopgateConfig> {
    let content =
        std::fs::read_to_string(path).context(format!("Failed to read {}", path.display()))?;

    serde_yaml::from_str(&content).context(format!("Failed to parse {}", path.display()))
}

/// Files searched when no path is given, in order.
pub fn default_config_paths() -> Vec<PathBuf> {
    let mut paths = vec![
        PathBuf::from("./hopgate.yaml"),
        PathBuf::from("/etc/hopgate/hopgate.yaml"),
    ];

    if let Some(config_dir) = dirs::config_dir() {
        paths.push(config_dir.join("hopgate/hopgate.yaml"));
    }

    paths
}

fn apply_env_overrides(mut config: HopgateConfig) -> Result<HopgateConfig> {
    if let Ok(addr) = std::env::var("HOPGATE_BIND_ADDRESS") {
        config.server.bind_address = addr.clone();
        tracing::debug!(address = %addr, "Applied HOPGATE_BIND_ADDRESS override");
    }

    if let Ok(port_str) = std::env::var("HOPGATE_PORT") {
        config.server.port = port_str
            .parse()
            .context(format!("Invalid HOPGATE_PORT value: {port_str}"))?;
        tracing::debug!(port = config.server.port, "Applied HOPGATE_PORT override");
    }

    if let Ok(keys) = std::env::var("HOPGATE_HOST_KEY") {
        config.server.host_keys = keys
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(PathBuf::from)
            .collect();
        tracing::debug!(
            key_count = config.server.host_keys.len(),
            "Applied HOPGATE_HOST_KEY override"
        );
    }

    if let Ok(dir) = std::env::var("HOPGATE_LOGS_DIR") {
        config.recording.logs_dir = PathBuf::from(&dir);
        tracing::debug!(dir = %dir, "Applied HOPGATE_LOGS_DIR override");
    }

    Ok(config)
}

/// Check the configuration for errors that would only surface per session.
pub fn validate_config(config: &HopgateConfig) -> Result<()> {
    if config.server.port == 0 {
        anyhow::bail!("Server port cannot be 0");
    }

    if config.server.host_keys.is_empty() {
        anyhow::bail!(
            "At least one host key must be configured (server.host_keys or HOPGATE_HOST_KEY)"
        );
    }
    for key_path in &config.server.host_keys {
        if !key_path.exists() {
            anyhow::bail!("Host key file not found: {}", key_path.display());
        }
    }

    if config.server.max_auth_attempts == 0 {
        anyhow::bail!("max_auth_attempts must be greater than 0");
    }

    for (name, target) in &config.targets {
        if target.hops.is_empty() {
            anyhow::bail!("Target {name} has no hops");
        }
        for (index, hop) in target.hops.iter().enumerate() {
            split_address(&hop.address).with_context(|| {
                format!("Target {name}, hop {}: invalid address", index + 1)
            })?;
        }
    }

    for user in &config.users {
        if user.authorized_keys.is_empty() {
            anyhow::bail!("User {} has no authorized keys", user.name);
        }
        for line in &user.authorized_keys {
            crate::server::identity::parse_authorized_key(line)
                .with_context(|| format!("User {}: invalid authorized key", user.name))?;
        }
        if let Some(allowed) = &user.allowed_targets {
            if let Some(unknown) = allowed.iter().find(|t| !config.targets.contains_key(*t)) {
                anyhow::bail!("User {} is allowed unknown target {unknown}", user.name);
            }
        }
    }

    tracing::info!("Configuration validation passed");
    Ok(())
}
