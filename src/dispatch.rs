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

//! Per-channel dispatch.
//!
//! A [`Dispatcher`] takes one inbound channel-open event, decides what kind
//! of channel it is, dials the hop chain, opens the same kind of channel on
//! the last hop and pipes the two together until the pipe finishes.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::channel::{
    ChannelEnd, ChannelKind, ChannelPair, OPEN_CONNECT_FAILED, OPEN_UNKNOWN_CHANNEL_TYPE,
};
use crate::hop::{self, HopChain, HopConnection, HopConnector};
use crate::pipe::{self, PipeContext};
use crate::shared::error::{BastionError, ChannelError};
use crate::shared::session::{AuthenticatedIdentity, SessionId};

/// Reason text sent when a channel type cannot be proxied.
pub const UNSUPPORTED_CHANNEL_TYPE: &str = "unsupported channel type";

/// An inbound channel-open event that has not been answered yet.
#[async_trait]
pub trait NewChannel: Send {
    fn channel_type(&self) -> &str;

    /// Channel-open extra data, exactly as received.
    fn extra_data(&self) -> &Bytes;

    /// Confirm the open and take ownership of the channel.
    async fn accept(self) -> Result<ChannelEnd, ChannelError>;

    /// Refuse the open with an SSH reason code and message.
    async fn reject(self, reason: u32, message: &str) -> Result<(), ChannelError>;
}

/// A channel the transport already confirmed before dispatch.
///
/// russh confirms channels from its open callbacks, so rejecting one here
/// closes it instead.
#[derive(Debug)]
pub struct AcceptedChannel {
    channel_type: String,
    extra_data: Bytes,
    end: ChannelEnd,
}

impl AcceptedChannel {
    pub fn new(channel_type: impl Into<String>, extra_data: Bytes, end: ChannelEnd) -> Self {
        Self {
            channel_type: channel_type.into(),
            extra_data,
            end,
        }
    }
}

#[async_trait]
impl NewChannel for AcceptedChannel {
    fn channel_type(&self) -> &str {
        &self.channel_type
    }

    fn extra_data(&self) -> &Bytes {
        &self.extra_data
    }

    async fn accept(self) -> Result<ChannelEnd, ChannelError> {
        Ok(self.end)
    }

    async fn reject(self, reason: u32, message: &str) -> Result<(), ChannelError> {
        debug!(reason, message, "closing channel refused after confirmation");
        self.end.handle.close().await
    }
}

/// Everything the dispatcher needs to know about the inbound connection.
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    pub identity: AuthenticatedIdentity,
    /// Login name used on the inbound connection.
    pub caller_user: String,
    pub session_id: SessionId,
    pub chain: HopChain,
}

/// Connects inbound channels to their hop chain.
pub struct Dispatcher<C: HopConnector> {
    connector: Arc<C>,
}

impl<C: HopConnector> Clone for Dispatcher<C> {
    fn clone(&self) -> Self {
        Self {
            connector: Arc::clone(&self.connector),
        }
    }
}

impl<C: HopConnector> Dispatcher<C> {
    pub fn new(connector: C) -> Self {
        Self::with_shared(Arc::new(connector))
    }

    pub fn with_shared(connector: Arc<C>) -> Self {
        Self { connector }
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    /// Handle one channel-open event until its pipe finishes.
    ///
    /// Unsupported channel types are refused and yield `Ok(())`. A failed
    /// accept drops the event. Every other failure closes the inbound
    /// channel and is returned.
    pub async fn dispatch<N: NewChannel>(
        &self,
        new_channel: N,
        request: DispatchRequest,
    ) -> Result<(), BastionError> {
        let channel_type = new_channel.channel_type().to_string();
        let extra_data = new_channel.extra_data().clone();

        let kind = match ChannelKind::classify(&channel_type, &extra_data) {
            Ok(ChannelKind::Other(_)) => {
                info!(
                    session_id = %request.session_id,
                    channel_type = %channel_type,
                    "refusing channel"
                );
                if let Err(error) = new_channel
                    .reject(OPEN_UNKNOWN_CHANNEL_TYPE, UNSUPPORTED_CHANNEL_TYPE)
                    .await
                {
                    warn!(%error, channel_type = %channel_type, "failed to send channel rejection");
                }
                return Ok(());
            }
            Ok(kind) => kind,
            Err(source) => {
                if let Err(error) = new_channel
                    .reject(OPEN_CONNECT_FAILED, "malformed channel open payload")
                    .await
                {
                    warn!(%error, channel_type = %channel_type, "failed to send channel rejection");
                }
                return Err(BastionError::Decode {
                    channel_type,
                    source,
                });
            }
        };

        let local = match new_channel.accept().await {
            Ok(local) => local,
            Err(error) => {
                warn!(
                    session_id = %request.session_id,
                    channel_type = %kind,
                    %error,
                    "failed to accept channel"
                );
                return Ok(());
            }
        };

        let outbound = match hop::dial(self.connector.as_ref(), &request.chain).await {
            Ok(outbound) => outbound,
            Err(error) => {
                pipe::close_channel(&local.handle, "local").await;
                return Err(error.into());
            }
        };

        let remote = match outbound
            .target()
            .open_channel(&channel_type, &extra_data)
            .await
        {
            Ok(remote) => remote,
            Err(source) => {
                pipe::close_channel(&local.handle, "local").await;
                outbound.close().await;
                return Err(BastionError::OpenChannel {
                    channel_type,
                    source,
                });
            }
        };

        debug!(
            session_id = %request.session_id,
            channel_type = %kind,
            hops = outbound.len(),
            "channel open on last hop"
        );

        let context = PipeContext {
            recording_location: request.chain.recording_location().to_path_buf(),
            caller_user: request.caller_user,
            username: request.identity.name,
            session_id: request.session_id,
            kind,
        };
        let result = pipe::run(ChannelPair { local, remote }, &context).await;
        outbound.close().await;
        result
    }
}
