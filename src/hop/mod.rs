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

//! Hop chain dialing.
//!
//! A [`HopChain`] lists the backend SSH servers a channel must traverse. The
//! first hop is dialed directly; every following hop is reached through a
//! `direct-tcpip` tunnel opened on the previous hop's connection, which stays
//! open because it carries the next hop's transport. Only the last hop opens
//! the proxied channel.
//!
//! The algorithm lives in [`dial`]; transports plug in through
//! [`HopConnector`] and [`HopConnection`] (see `crate::ssh::client` for the
//! russh implementation).

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::channel::ChannelEnd;
use crate::shared::error::{BoxError, ChannelError};
use crate::ssh::auth::HopAuth;

/// One backend SSH server in a chain.
#[derive(Debug, Clone)]
pub struct HopDescriptor {
    /// `host:port` of the server.
    pub address: String,
    /// Client credentials and host key policy for this hop.
    pub auth: HopAuth,
    /// Directory for recordings of channels that end at this hop.
    pub log_location: PathBuf,
}

/// Ordered, non-empty list of hops for one target.
#[derive(Debug, Clone)]
pub struct HopChain {
    hops: Vec<HopDescriptor>,
    connect_timeout: Option<Duration>,
}

impl HopChain {
    pub fn new(hops: Vec<HopDescriptor>) -> Result<Self, HopError> {
        if hops.is_empty() {
            return Err(HopError::EmptyChain);
        }
        Ok(Self {
            hops,
            connect_timeout: None,
        })
    }

    /// Bound each hop's connect, handshake and authentication.
    #[must_use]
    pub fn with_connect_timeout(mut self, connect_timeout: Option<Duration>) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    pub fn hops(&self) -> &[HopDescriptor] {
        &self.hops
    }

    pub fn len(&self) -> usize {
        self.hops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hops.is_empty()
    }

    /// The hop that opens the proxied channel.
    pub fn last(&self) -> &HopDescriptor {
        // Non-empty by construction.
        &self.hops[self.hops.len() - 1]
    }

    /// Where recordings of this chain's channels go.
    pub fn recording_location(&self) -> &Path {
        &self.last().log_location
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout
    }
}

/// Failure of a single hop, as reported by a [`HopConnector`].
#[derive(Debug)]
pub enum HopFailure {
    /// The transport to the hop could not be established.
    Connect(BoxError),
    /// The previous hop refused or failed the `direct-tcpip` tunnel.
    Tunnel(BoxError),
    /// SSH key exchange or host key verification failed.
    Handshake(BoxError),
    /// The hop rejected our credentials.
    Auth(BoxError),
}

impl HopFailure {
    fn at(self, hop: usize, address: &str) -> HopError {
        let address = address.to_string();
        match self {
            Self::Connect(source) => HopError::Connect {
                hop,
                address,
                source,
            },
            Self::Tunnel(source) => HopError::Tunnel {
                hop,
                address,
                source,
            },
            Self::Handshake(source) => HopError::Handshake {
                hop,
                address,
                source,
            },
            Self::Auth(source) => HopError::Auth {
                hop,
                address,
                source,
            },
        }
    }
}

/// Why a hop chain could not be established. Hops are numbered from 1.
#[derive(Debug, Error)]
pub enum HopError {
    #[error("hop chain is empty")]
    EmptyChain,

    #[error("hop {hop} ({address}): connection failed: {source}")]
    Connect {
        hop: usize,
        address: String,
        #[source]
        source: BoxError,
    },

    #[error("hop {hop} ({address}): tunnel through previous hop failed: {source}")]
    Tunnel {
        hop: usize,
        address: String,
        #[source]
        source: BoxError,
    },

    #[error("hop {hop} ({address}): ssh handshake failed: {source}")]
    Handshake {
        hop: usize,
        address: String,
        #[source]
        source: BoxError,
    },

    #[error("hop {hop} ({address}): authentication failed: {source}")]
    Auth {
        hop: usize,
        address: String,
        #[source]
        source: BoxError,
    },

    #[error("hop {hop} ({address}): timed out after {}s", after.as_secs())]
    Timeout {
        hop: usize,
        address: String,
        after: Duration,
    },
}

impl HopError {
    /// 1-based index of the failing hop, if any.
    pub fn hop(&self) -> Option<usize> {
        match self {
            Self::EmptyChain => None,
            Self::Connect { hop, .. }
            | Self::Tunnel { hop, .. }
            | Self::Handshake { hop, .. }
            | Self::Auth { hop, .. }
            | Self::Timeout { hop, .. } => Some(*hop),
        }
    }
}

/// An authenticated connection to one hop.
#[async_trait]
pub trait HopConnection: Send + Sync + 'static {
    /// Open a channel of `channel_type` with the given channel-open extra data.
    async fn open_channel(
        &self,
        channel_type: &str,
        extra_data: &Bytes,
    ) -> Result<ChannelEnd, ChannelError>;

    /// Disconnect from the hop.
    async fn close(&self) -> Result<(), ChannelError>;
}

/// Establishes hop connections.
#[async_trait]
pub trait HopConnector: Send + Sync + 'static {
    type Connection: HopConnection;

    /// Dial `hop` directly.
    async fn connect(&self, hop: &HopDescriptor) -> Result<Self::Connection, HopFailure>;

    /// Dial `hop` through a tunnel opened on `via`.
    async fn connect_via(
        &self,
        via: &Self::Connection,
        hop: &HopDescriptor,
    ) -> Result<Self::Connection, HopFailure>;
}

/// Every connection of an established chain, first hop first.
///
/// The last connection opens the proxied channel. [`OutboundChain::close`]
/// disconnects the hops last to first; dropping the chain releases the
/// connections without waiting.
pub struct OutboundChain<T: HopConnection> {
    connections: Vec<T>,
    addresses: Vec<String>,
}

impl<T: HopConnection> OutboundChain<T> {
    /// Connection to the last hop.
    pub fn target(&self) -> &T {
        // Only built from a non-empty chain.
        &self.connections[self.connections.len() - 1]
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Disconnect every hop, last hop first. Failures are logged.
    pub async fn close(self) {
        close_connections(self.connections, &self.addresses).await;
    }
}

impl<T: HopConnection> std::fmt::Debug for OutboundChain<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboundChain")
            .field("hops", &self.addresses)
            .finish()
    }
}

async fn close_connections<T: HopConnection>(connections: Vec<T>, addresses: &[String]) {
    for (index, connection) in connections.iter().enumerate().rev() {
        if let Err(error) = connection.close().await {
            warn!(
                hop = index + 1,
                address = %addresses[index],
                %error,
                "failed to close hop connection"
            );
        }
    }
}

/// Dial every hop of `chain` in order.
///
/// On failure the hops already established are closed and the error names
/// the failing hop.
pub async fn dial<C: HopConnector>(
    connector: &C,
    chain: &HopChain,
) -> Result<OutboundChain<C::Connection>, HopError> {
    let mut connections: Vec<C::Connection> = Vec::with_capacity(chain.len());
    let mut addresses = Vec::with_capacity(chain.len());

    for (index, hop) in chain.hops().iter().enumerate() {
        let number = index + 1;
        debug!(hop = number, address = %hop.address, "dialing hop");

        let attempt = async {
            match connections.last() {
                None => connector.connect(hop).await,
                Some(previous) => connector.connect_via(previous, hop).await,
            }
        };
        let outcome = match chain.connect_timeout() {
            Some(after) => match timeout(after, attempt).await {
                Ok(outcome) => outcome.map_err(|failure| failure.at(number, &hop.address)),
                Err(_) => Err(HopError::Timeout {
                    hop: number,
                    address: hop.address.clone(),
                    after,
                }),
            },
            None => attempt
                .await
                .map_err(|failure| failure.at(number, &hop.address)),
        };

        match outcome {
            Ok(connection) => {
                connections.push(connection);
                addresses.push(hop.address.clone());
            }
            Err(error) => {
                warn!(hop = number, address = %hop.address, %error, "hop chain aborted");
                close_connections(connections, &addresses).await;
                return Err(error);
            }
        }
    }

    if connections.is_empty() {
        return Err(HopError::EmptyChain);
    }
    Ok(OutboundChain {
        connections,
        addresses,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::auth::{AuthMethod, ServerCheckMethod};

    fn hop(address: &str, logs: &str) -> HopDescriptor {
        HopDescriptor {
            address: address.to_string(),
            auth: HopAuth::new("root", AuthMethod::with_password("pw"), ServerCheckMethod::NoCheck),
            log_location: PathBuf::from(logs),
        }
    }

    #[test]
    fn test_empty_chain_is_rejected() {
        assert!(matches!(HopChain::new(Vec::new()), Err(HopError::EmptyChain)));
    }

    #[test]
    fn test_last_hop_owns_recordings() {
        let chain = HopChain::new(vec![
            hop("jump:22", "/var/log/jump"),
            hop("db:22", "/var/log/db"),
        ])
        .unwrap();
        assert_eq!(chain.len(), 2);
        assert_eq!(chain.last().address, "db:22");
        assert_eq!(chain.recording_location(), Path::new("/var/log/db"));
        assert_eq!(chain.connect_timeout(), None);
    }

    #[test]
    fn test_failure_names_hop() {
        let error = HopFailure::Auth("denied".into()).at(3, "db:22");
        assert_eq!(error.hop(), Some(3));
        assert_eq!(
            error.to_string(),
            "hop 3 (db:22): authentication failed: denied"
        );
        assert_eq!(HopError::EmptyChain.hop(), None);
    }

    #[test]
    fn test_timeout_message() {
        let error = HopError::Timeout {
            hop: 1,
            address: "jump:22".to_string(),
            after: Duration::from_secs(10),
        };
        assert_eq!(error.to_string(), "hop 1 (jump:22): timed out after 10s");
    }
}
