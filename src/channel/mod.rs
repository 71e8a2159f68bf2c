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

//! Transport-neutral view of one SSH channel.
//!
//! A [`ChannelEnd`] is what the pipe engine works with: a stream of inbound
//! [`Frame`]s, a stream of inbound [`IncomingRequest`]s and a cloneable
//! [`ChannelHandle`] for writing. Concrete channels are produced by a driver
//! task that owns the real channel and talks to the handle through a command
//! queue (see `crate::ssh::driver` for russh and [`memory`] for tests and
//! embedding).
//!
//! Closing is the only cancellation primitive: once a channel is closed its
//! streams end and writes fail with [`ChannelError::Closed`]. Dropping every
//! handle of a channel closes it.

pub mod memory;
pub mod request;
pub mod wire;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};

use crate::shared::error::{ChannelError, WireError};

pub use self::request::{ChannelRequest, PtyRequest, RequestBody, WindowSize};
pub use self::wire::TunnelEndpoints;

/// Capacity of frame and request queues between a driver and its consumers.
pub const CHANNEL_QUEUE_DEPTH: usize = 64;

/// SSH_OPEN_UNKNOWN_CHANNEL_TYPE (RFC 4254 section 5.1).
pub const OPEN_UNKNOWN_CHANNEL_TYPE: u32 = 3;

/// SSH_OPEN_CONNECT_FAILED (RFC 4254 section 5.1).
pub const OPEN_CONNECT_FAILED: u32 = 2;

/// Channel type, decided once when the channel is opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelKind {
    Session,
    DirectTcpip(TunnelEndpoints),
    Other(String),
}

impl ChannelKind {
    /// Classify a channel-open by type and extra data.
    ///
    /// Only `direct-tcpip` inspects the payload. Unknown types are returned as
    /// [`ChannelKind::Other`] so the caller decides how to reject them.
    pub fn classify(channel_type: &str, extra_data: &[u8]) -> Result<Self, WireError> {
        match channel_type {
            "session" => Ok(Self::Session),
            "direct-tcpip" => TunnelEndpoints::decode(extra_data).map(Self::DirectTcpip),
            other => Ok(Self::Other(other.to_string())),
        }
    }

    /// The SSH channel type string.
    pub fn type_name(&self) -> &str {
        match self {
            Self::Session => "session",
            Self::DirectTcpip(_) => "direct-tcpip",
            Self::Other(name) => name,
        }
    }
}

impl std::fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.type_name())
    }
}

/// Unit of channel payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Data(Bytes),
    /// Extended data with its type code (1 is stderr).
    Extended(u32, Bytes),
}

impl Frame {
    pub fn payload(&self) -> &Bytes {
        match self {
            Self::Data(data) | Self::Extended(_, data) => data,
        }
    }
}

/// Instruction sent from a [`ChannelHandle`] to the channel's driver.
#[derive(Debug)]
pub enum Command {
    Frame(Frame),
    Request {
        request: ChannelRequest,
        reply: oneshot::Sender<Result<bool, ChannelError>>,
    },
    Eof,
    Close,
}

/// Write side of a channel. Cheap to clone; the channel closes when the last
/// clone is dropped.
#[derive(Debug, Clone)]
pub struct ChannelHandle {
    commands: mpsc::Sender<Command>,
}

impl ChannelHandle {
    pub fn new(commands: mpsc::Sender<Command>) -> Self {
        Self { commands }
    }

    pub async fn data(&self, data: Bytes) -> Result<(), ChannelError> {
        self.send_frame(Frame::Data(data)).await
    }

    pub async fn extended_data(&self, code: u32, data: Bytes) -> Result<(), ChannelError> {
        self.send_frame(Frame::Extended(code, data)).await
    }

    pub async fn send_frame(&self, frame: Frame) -> Result<(), ChannelError> {
        self.commands
            .send(Command::Frame(frame))
            .await
            .map_err(|_| ChannelError::Closed)
    }

    /// Send a request and wait for the peer's answer.
    ///
    /// Requests sent without `want_reply` resolve to `Ok(false)` once queued.
    pub async fn send_request(&self, request: ChannelRequest) -> Result<bool, ChannelError> {
        let (reply, answer) = oneshot::channel();
        self.commands
            .send(Command::Request { request, reply })
            .await
            .map_err(|_| ChannelError::Closed)?;
        answer.await.map_err(|_| ChannelError::Closed)?
    }

    /// Half-close: signal that no more data will be written.
    pub async fn close_write(&self) -> Result<(), ChannelError> {
        self.commands
            .send(Command::Eof)
            .await
            .map_err(|_| ChannelError::Closed)
    }

    /// Fully close the channel. Closing an already closed channel succeeds.
    pub async fn close(&self) -> Result<(), ChannelError> {
        let _ = self.commands.send(Command::Close).await;
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }
}

/// A request received from the peer, answered through [`Responder`].
#[derive(Debug)]
pub struct IncomingRequest {
    request: ChannelRequest,
    responder: Responder,
}

impl IncomingRequest {
    /// `reply` is `None` when the peer did not ask for an answer.
    pub fn new(request: ChannelRequest, reply: Option<oneshot::Sender<bool>>) -> Self {
        Self {
            request,
            responder: Responder(reply),
        }
    }

    pub fn request(&self) -> &ChannelRequest {
        &self.request
    }

    pub fn into_parts(self) -> (ChannelRequest, Responder) {
        (self.request, self.responder)
    }
}

/// Answers one [`IncomingRequest`].
#[derive(Debug)]
pub struct Responder(Option<oneshot::Sender<bool>>);

impl Responder {
    /// Send the answer. A no-op when no answer was requested.
    pub fn reply(self, ok: bool) -> Result<(), ChannelError> {
        match self.0 {
            Some(reply) => reply.send(ok).map_err(|_| ChannelError::Closed),
            None => Ok(()),
        }
    }
}

/// One end of an open channel.
#[derive(Debug)]
pub struct ChannelEnd {
    pub frames: mpsc::Receiver<Frame>,
    pub requests: mpsc::Receiver<IncomingRequest>,
    pub handle: ChannelHandle,
}

/// The inbound (`local`) and outbound (`remote`) ends of a proxied channel.
#[derive(Debug)]
pub struct ChannelPair {
    pub local: ChannelEnd,
    pub remote: ChannelEnd,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_session() {
        assert_eq!(
            ChannelKind::classify("session", &[]).unwrap(),
            ChannelKind::Session
        );
    }

    #[test]
    fn test_classify_direct_tcpip() {
        let endpoints = TunnelEndpoints {
            destination_host: "10.0.0.8".to_string(),
            destination_port: 80,
            source_host: "192.168.1.4".to_string(),
            source_port: 51000,
        };
        let kind = ChannelKind::classify("direct-tcpip", &endpoints.encode()).unwrap();
        assert_eq!(kind, ChannelKind::DirectTcpip(endpoints));
        assert_eq!(kind.type_name(), "direct-tcpip");
    }

    #[test]
    fn test_classify_malformed_direct_tcpip() {
        assert!(ChannelKind::classify("direct-tcpip", &[0, 0, 0, 9, b'x']).is_err());
    }

    #[test]
    fn test_classify_unknown_ignores_payload() {
        let kind = ChannelKind::classify("shell-exec", &[0xff]).unwrap();
        assert_eq!(kind, ChannelKind::Other("shell-exec".to_string()));
        assert_eq!(kind.to_string(), "shell-exec");
    }

    #[test]
    fn test_responder_without_reply_is_noop() {
        let (_, responder) =
            IncomingRequest::new(ChannelRequest::signal("INT"), None).into_parts();
        assert!(responder.reply(true).is_ok());
    }

    #[tokio::test]
    async fn test_closed_handle() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let handle = ChannelHandle::new(tx);
        assert!(handle.is_closed());
        assert_eq!(
            handle.data(Bytes::from_static(b"x")).await,
            Err(ChannelError::Closed)
        );
        assert_eq!(handle.close_write().await, Err(ChannelError::Closed));
        assert_eq!(handle.close().await, Ok(()));
    }
}
