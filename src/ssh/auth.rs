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

//! Client credentials and host key policy for outbound hops.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use russh::client::{Handle, Handler};
use russh::keys::PublicKey;
use thiserror::Error;
use tracing::warn;
use zeroize::Zeroizing;

/// Errors raised while connecting to or authenticating with a hop.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Ssh(#[from] russh::Error),

    #[error("invalid private key: {0}")]
    KeyInvalid(#[source] russh::keys::Error),

    #[error("password rejected for user {0}")]
    PasswordRejected(String),

    #[error("public key rejected for user {0}")]
    KeyRejected(String),

    #[error("host key verification failed for {0}")]
    ServerCheckFailed(String),

    #[error("invalid hop address {0:?}: expected host:port")]
    InvalidAddress(String),
}

/// How to authenticate to a hop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthMethod {
    Password(Zeroizing<String>),
    PrivateKey {
        /// Entire contents of an OpenSSH private key.
        key_data: Zeroizing<String>,
        key_pass: Option<Zeroizing<String>>,
    },
    PrivateKeyFile {
        key_file_path: PathBuf,
        key_pass: Option<Zeroizing<String>>,
    },
}

impl AuthMethod {
    pub fn with_password(password: &str) -> Self {
        Self::Password(Zeroizing::new(password.to_string()))
    }

    pub fn with_key(key: &str, passphrase: Option<&str>) -> Self {
        Self::PrivateKey {
            key_data: Zeroizing::new(key.to_string()),
            key_pass: passphrase.map(|p| Zeroizing::new(p.to_string())),
        }
    }

    pub fn with_key_file<T: AsRef<Path>>(key_file_path: T, passphrase: Option<&str>) -> Self {
        Self::PrivateKeyFile {
            key_file_path: key_file_path.as_ref().to_path_buf(),
            key_pass: passphrase.map(|p| Zeroizing::new(p.to_string())),
        }
    }
}

/// Host key verification policy.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ServerCheckMethod {
    /// Accept any host key. Only for lab setups.
    NoCheck,
    /// Expect exactly this base64-encoded public key.
    PublicKey(String),
    /// Look the host up in a known_hosts file.
    KnownHostsFile(PathBuf),
}

/// Everything needed to log in to one hop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HopAuth {
    pub user: String,
    pub method: AuthMethod,
    pub server_check: ServerCheckMethod,
}

impl HopAuth {
    pub fn new(
        user: impl Into<String>,
        method: AuthMethod,
        server_check: ServerCheckMethod,
    ) -> Self {
        Self {
            user: user.into(),
            method,
            server_check,
        }
    }
}

/// Check a presented host key against the policy.
pub(crate) fn verify_server_key(
    check: &ServerCheckMethod,
    host: &str,
    port: u16,
    server_key: &PublicKey,
) -> Result<bool, ClientError> {
    match check {
        ServerCheckMethod::NoCheck => Ok(true),
        ServerCheckMethod::PublicKey(expected) => {
            let expected = russh::keys::parse_public_key_base64(expected)
                .map_err(|_| ClientError::ServerCheckFailed(host.to_string()))?;
            Ok(expected.key_data() == server_key.key_data())
        }
        ServerCheckMethod::KnownHostsFile(path) => {
            match russh::keys::check_known_hosts_path(host, port, server_key, path) {
                Ok(known) => Ok(known),
                Err(error) => {
                    warn!(%host, port, %error, "known_hosts check failed");
                    Ok(false)
                }
            }
        }
    }
}

/// Authenticate an established SSH transport.
pub(crate) async fn authenticate<H>(
    handle: &mut Handle<H>,
    user: &str,
    method: &AuthMethod,
) -> Result<(), ClientError>
where
    H: Handler,
{
    let key = match method {
        AuthMethod::Password(password) => {
            let result = handle.authenticate_password(user, password.as_str()).await?;
            if !result.success() {
                return Err(ClientError::PasswordRejected(user.to_string()));
            }
            return Ok(());
        }
        AuthMethod::PrivateKey { key_data, key_pass } => {
            russh::keys::decode_secret_key(key_data, key_pass.as_ref().map(|p| p.as_str()))
                .map_err(ClientError::KeyInvalid)?
        }
        AuthMethod::PrivateKeyFile {
            key_file_path,
            key_pass,
        } => russh::keys::load_secret_key(key_file_path, key_pass.as_ref().map(|p| p.as_str()))
            .map_err(ClientError::KeyInvalid)?,
    };

    let hash = handle.best_supported_rsa_hash().await?.flatten();
    let result = handle
        .authenticate_publickey(
            user,
            russh::keys::PrivateKeyWithHashAlg::new(Arc::new(key), hash),
        )
        .await?;
    if !result.success() {
        return Err(ClientError::KeyRejected(user.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const ED25519_KEY: &str =
        "AAAAC3NzaC1lZDI1NTE5AAAAIEhLfbRHwEyWJ9Z0fD7bKx2XGvUi5fDmJ7KX0vCq8+mT";

    #[test]
    fn test_constructors() {
        assert_eq!(
            AuthMethod::with_password("pw"),
            AuthMethod::Password(Zeroizing::new("pw".to_string()))
        );
        match AuthMethod::with_key_file("/keys/id_ed25519", Some("phrase")) {
            AuthMethod::PrivateKeyFile {
                key_file_path,
                key_pass,
            } => {
                assert_eq!(key_file_path, PathBuf::from("/keys/id_ed25519"));
                assert_eq!(key_pass.as_deref().map(String::as_str), Some("phrase"));
            }
            other => panic!("unexpected method: {other:?}"),
        }
    }

    #[test]
    fn test_pinned_key_check() {
        let key = russh::keys::parse_public_key_base64(ED25519_KEY).unwrap();
        let pinned = ServerCheckMethod::PublicKey(ED25519_KEY.to_string());
        assert!(verify_server_key(&pinned, "db", 22, &key).unwrap());
        assert!(verify_server_key(&ServerCheckMethod::NoCheck, "db", 22, &key).unwrap());
    }

    #[test]
    fn test_invalid_pinned_key() {
        let key = russh::keys::parse_public_key_base64(ED25519_KEY).unwrap();
        let pinned = ServerCheckMethod::PublicKey("not-a-key".to_string());
        assert!(matches!(
            verify_server_key(&pinned, "db", 22, &key),
            Err(ClientError::ServerCheckFailed(_))
        ));
    }

    #[test]
    fn test_unknown_host_in_known_hosts() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("known_hosts");
        std::fs::write(&path, "").unwrap();

        let key = russh::keys::parse_public_key_base64(ED25519_KEY).unwrap();
        let check = ServerCheckMethod::KnownHostsFile(path);
        assert!(!verify_server_key(&check, "db", 22, &key).unwrap());
    }
}
