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

//! russh-backed hop connector.
//!
//! Hop 1 is reached over TCP. Every later hop is reached by opening a
//! `direct-tcpip` channel on the previous hop, turning it into a stream and
//! running a fresh SSH client over it.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use russh::client::{self, Handle, Handler};
use tokio::net::TcpStream;
use tracing::debug;

use super::auth::{authenticate, verify_server_key, ClientError, ServerCheckMethod};
use super::driver::spawn_client_channel;
use crate::channel::{ChannelEnd, ChannelKind};
use crate::hop::{HopConnection, HopConnector, HopDescriptor, HopFailure};
use crate::shared::error::ChannelError;

/// Originator reported for tunnels between hops.
const TUNNEL_ORIGINATOR: (&str, u32) = ("127.0.0.1", 0);

/// Client-side handler verifying the hop's host key.
pub struct ClientHandler {
    host: String,
    port: u16,
    server_check: ServerCheckMethod,
}

impl ClientHandler {
    pub fn new(host: impl Into<String>, port: u16, server_check: ServerCheckMethod) -> Self {
        Self {
            host: host.into(),
            port,
            server_check,
        }
    }
}

impl Handler for ClientHandler {
    type Error = ClientError;

    async fn check_server_key(
        &mut self,
        server_public_key: &russh::keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        let trusted =
            verify_server_key(&self.server_check, &self.host, self.port, server_public_key)?;
        if !trusted {
            return Err(ClientError::ServerCheckFailed(format!(
                "{}:{}",
                self.host, self.port
            )));
        }
        Ok(true)
    }
}

/// Split `host:port`, accepting bracketed IPv6 literals.
pub fn split_address(address: &str) -> Result<(String, u16), ClientError> {
    let invalid = || ClientError::InvalidAddress(address.to_string());
    let (host, port) = address.rsplit_once(':').ok_or_else(invalid)?;
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    if host.is_empty() {
        return Err(invalid());
    }
    let port = port.parse::<u16>().map_err(|_| invalid())?;
    Ok((host.to_string(), port))
}

/// Dials hops with russh.
#[derive(Clone)]
pub struct RusshConnector {
    config: Arc<client::Config>,
}

impl RusshConnector {
    pub fn new() -> Self {
        Self::with_config(client::Config::default())
    }

    pub fn with_config(config: client::Config) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    async fn login(
        handle: &mut Handle<ClientHandler>,
        hop: &HopDescriptor,
    ) -> Result<(), HopFailure> {
        authenticate(handle, &hop.auth.user, &hop.auth.method)
            .await
            .map_err(|e| HopFailure::Auth(e.into()))
    }
}

impl Default for RusshConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HopConnector for RusshConnector {
    type Connection = RusshHop;

    async fn connect(&self, hop: &HopDescriptor) -> Result<RusshHop, HopFailure> {
        let (host, port) = split_address(&hop.address).map_err(|e| HopFailure::Connect(e.into()))?;
        let stream = TcpStream::connect((host.as_str(), port))
            .await
            .map_err(|e| HopFailure::Connect(e.into()))?;

        let handler = ClientHandler::new(host, port, hop.auth.server_check.clone());
        let mut handle = client::connect_stream(Arc::clone(&self.config), stream, handler)
            .await
            .map_err(|e| HopFailure::Handshake(e.into()))?;
        Self::login(&mut handle, hop).await?;

        debug!(address = %hop.address, user = %hop.auth.user, "hop connected");
        Ok(RusshHop {
            handle,
            address: hop.address.clone(),
        })
    }

    async fn connect_via(
        &self,
        via: &RusshHop,
        hop: &HopDescriptor,
    ) -> Result<RusshHop, HopFailure> {
        let (host, port) = split_address(&hop.address).map_err(|e| HopFailure::Connect(e.into()))?;
        let tunnel = via
            .handle
            .channel_open_direct_tcpip(
                host.clone(),
                u32::from(port),
                TUNNEL_ORIGINATOR.0,
                TUNNEL_ORIGINATOR.1,
            )
            .await
            .map_err(|e| HopFailure::Tunnel(e.into()))?;

        let handler = ClientHandler::new(host, port, hop.auth.server_check.clone());
        let mut handle =
            client::connect_stream(Arc::clone(&self.config), tunnel.into_stream(), handler)
                .await
                .map_err(|e| HopFailure::Handshake(e.into()))?;
        Self::login(&mut handle, hop).await?;

        debug!(
            address = %hop.address,
            via = %via.address,
            user = %hop.auth.user,
            "hop connected through tunnel"
        );
        Ok(RusshHop {
            handle,
            address: hop.address.clone(),
        })
    }
}

/// Authenticated russh connection to one hop.
pub struct RusshHop {
    handle: Handle<ClientHandler>,
    address: String,
}

impl RusshHop {
    pub fn address(&self) -> &str {
        &self.address
    }
}

#[async_trait]
impl HopConnection for RusshHop {
    async fn open_channel(
        &self,
        channel_type: &str,
        extra_data: &Bytes,
    ) -> Result<ChannelEnd, ChannelError> {
        // russh re-encodes the endpoints; decoding is strict, so the bytes
        // on the wire equal `extra_data`.
        let kind = ChannelKind::classify(channel_type, extra_data)
            .map_err(|e| ChannelError::Ssh(format!("malformed {channel_type} payload: {e}")))?;

        let channel = match kind {
            ChannelKind::Session => self.handle.channel_open_session().await,
            ChannelKind::DirectTcpip(endpoints) => {
                self.handle
                    .channel_open_direct_tcpip(
                        endpoints.destination_host,
                        endpoints.destination_port,
                        endpoints.source_host,
                        endpoints.source_port,
                    )
                    .await
            }
            ChannelKind::Other(other) => {
                return Err(ChannelError::Rejected {
                    reason: crate::channel::OPEN_UNKNOWN_CHANNEL_TYPE,
                    message: format!("unsupported channel type {other}"),
                })
            }
        }
        .map_err(ChannelError::ssh)?;

        Ok(spawn_client_channel(channel))
    }

    async fn close(&self) -> Result<(), ChannelError> {
        self.handle
            .disconnect(russh::Disconnect::ByApplication, "", "")
            .await
            .map_err(ChannelError::ssh)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_address() {
        assert_eq!(
            split_address("jump.example.com:22").unwrap(),
            ("jump.example.com".to_string(), 22)
        );
        assert_eq!(
            split_address("[fd00::5]:2222").unwrap(),
            ("fd00::5".to_string(), 2222)
        );
    }

    #[test]
    fn test_split_address_rejects_garbage() {
        for address in ["no-port", ":22", "host:", "host:99999", "host:ssh"] {
            assert!(
                matches!(split_address(address), Err(ClientError::InvalidAddress(_))),
                "{address} should be rejected"
            );
        }
    }
}
