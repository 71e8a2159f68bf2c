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

//! Inbound SSH server.
//!
//! [`BastionServer`] accepts client connections with russh and hands every
//! proxied channel to the dispatcher. Each connection gets an
//! [`SshHandler`]; users and targets come from [`identity`].

pub mod handler;
pub mod identity;

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use russh::server::Server;
use russh::{MethodKind, MethodSet};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::config::HopgateConfig;
use crate::dispatch::Dispatcher;
use crate::ssh::RusshConnector;

pub use self::handler::{ServerContext, SshHandler};
pub use self::identity::{ChainResolver, ConfigDirectory, IdentityProvider};

/// The bastion's SSH listener.
pub struct BastionServer {
    config: Arc<HopgateConfig>,
    context: Arc<ServerContext>,
}

impl BastionServer {
    /// Build a server whose users and targets come from `config`.
    pub fn new(config: HopgateConfig) -> Result<Self> {
        let directory = Arc::new(ConfigDirectory::from_config(&config)?);
        tracing::info!(
            users = directory.user_count(),
            targets = directory.target_count(),
            "Loaded user directory"
        );
        let context = ServerContext {
            dispatcher: Dispatcher::new(RusshConnector::new()),
            identities: directory.clone(),
            chains: directory,
            on_recording_failure: config.recording.on_open_failure,
            shutdown: CancellationToken::new(),
        };
        Ok(Self::with_context(config, context))
    }

    pub fn with_context(config: HopgateConfig, context: ServerContext) -> Self {
        Self {
            config: Arc::new(config),
            context: Arc::new(context),
        }
    }

    pub fn config(&self) -> &HopgateConfig {
        &self.config
    }

    /// Token that stops [`BastionServer::run`] when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.context.shutdown.clone()
    }

    /// Listen on the configured address until the shutdown token fires.
    pub async fn run(&self) -> Result<()> {
        let addr = self.config.server.listen_address();
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind to {addr}"))?;
        self.run_on_listener(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn run_on_listener(&self, listener: TcpListener) -> Result<()> {
        let russh_config = Arc::new(self.build_russh_config()?);
        tracing::info!(local_addr = ?listener.local_addr(), "SSH server listening");

        let mut runner = BastionServerRunner {
            context: Arc::clone(&self.context),
        };
        let shutdown = self.context.shutdown.clone();

        tokio::select! {
            result = runner.run_on_socket(russh_config, &listener) => {
                result.map_err(|e| anyhow::anyhow!("Server error: {e}"))
            }
            _ = shutdown.cancelled() => {
                tracing::info!("Server shutdown requested");
                Ok(())
            }
        }
    }

    fn build_russh_config(&self) -> Result<russh::server::Config> {
        if self.config.server.host_keys.is_empty() {
            anyhow::bail!("No host keys configured. At least one host key is required.");
        }

        let keys = self
            .config
            .server
            .host_keys
            .iter()
            .map(load_host_key)
            .collect::<Result<Vec<_>>>()?;
        tracing::info!(key_count = keys.len(), "Loaded host keys");

        let mut methods = MethodSet::empty();
        methods.push(MethodKind::PublicKey);

        Ok(russh::server::Config {
            keys,
            methods,
            auth_rejection_time: Duration::from_secs(3),
            auth_rejection_time_initial: Some(Duration::from_secs(0)),
            max_auth_attempts: self.config.server.max_auth_attempts,
            ..Default::default()
        })
    }
}

/// Implements `russh::server::Server`, which requires `Clone`.
#[derive(Clone)]
struct BastionServerRunner {
    context: Arc<ServerContext>,
}

impl russh::server::Server for BastionServerRunner {
    type Handler = SshHandler;

    fn new_client(&mut self, peer_addr: Option<SocketAddr>) -> Self::Handler {
        let handler = SshHandler::new(peer_addr, Arc::clone(&self.context));
        tracing::info!(
            peer = ?peer_addr,
            session_id = %handler.session_id(),
            "New client connection"
        );
        handler
    }

    fn handle_session_error(&mut self, error: <Self::Handler as russh::server::Handler>::Error) {
        tracing::error!(error = %error, "Session error");
    }
}

fn load_host_key(path: impl AsRef<Path>) -> Result<russh::keys::PrivateKey> {
    let path = path.as_ref();
    tracing::debug!(path = %path.display(), "Loading host key");

    russh::keys::PrivateKey::read_openssh_file(path)
        .with_context(|| format!("Failed to load host key from {}", path.display()))
}
