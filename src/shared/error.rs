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

//! Error types shared by the channel layer, the dispatcher and the pipe engine.
//!
//! # Error Categories
//!
//! - [`WireError`]: malformed SSH wire encodings (channel-open payloads, request payloads)
//! - [`ChannelError`]: failures of a single channel end
//! - [`BastionError`]: failures of one proxied channel, surfaced to the connection handler
//!
//! Dial failures are described by [`crate::hop::HopError`] and wrapped into
//! [`BastionError::Dial`].

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::hop::HopError;

/// Boxed error used at collaborator seams (connectors, transports).
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Error produced while decoding SSH wire-format fields.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    /// The buffer ended before the named field was complete.
    #[error("truncated {field}: need {needed} bytes, {available} available")]
    Truncated {
        field: &'static str,
        needed: usize,
        available: usize,
    },

    /// A field that must be text was not valid UTF-8.
    #[error("{field} is not valid UTF-8")]
    InvalidUtf8 { field: &'static str },

    /// Bytes were left over after the last expected field.
    #[error("{0} unexpected trailing bytes")]
    TrailingBytes(usize),
}

/// Error produced by one end of a proxied channel.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    /// The channel has been closed; nothing more can be written to it.
    #[error("channel closed")]
    Closed,

    /// The peer refused to open the channel.
    #[error("channel open rejected (reason {reason}): {message}")]
    Rejected { reason: u32, message: String },

    /// The SSH transport reported an error.
    #[error("ssh error: {0}")]
    Ssh(String),
}

impl ChannelError {
    /// Wrap a transport error, keeping only its rendered message.
    pub fn ssh(err: impl std::fmt::Display) -> Self {
        Self::Ssh(err.to_string())
    }
}

/// Error surfaced for one inbound channel-open event.
#[derive(Debug, Error)]
pub enum BastionError {
    /// The channel-open payload could not be decoded.
    #[error("malformed {channel_type} open payload: {source}")]
    Decode {
        channel_type: String,
        #[source]
        source: WireError,
    },

    /// The hop chain could not be established.
    #[error("failed to dial hop chain: {0}")]
    Dial(#[from] HopError),

    /// The final hop refused or failed to open the matching channel.
    #[error("failed to open {channel_type} channel on the last hop: {source}")]
    OpenChannel {
        channel_type: String,
        #[source]
        source: ChannelError,
    },

    /// Forwarding a request or reply between the two ends failed.
    #[error("failed to forward {what}: {source}")]
    Forward {
        what: String,
        #[source]
        source: ChannelError,
    },

    /// The recording destination could not be opened.
    #[error("failed to open recording {}: {source}", path.display())]
    Recording {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A worker stopped without reporting completion.
    #[error("pipe worker stopped unexpectedly")]
    WorkerLost,
}

impl BastionError {
    /// Whether this error comes from the recording sink.
    pub fn is_recording_failure(&self) -> bool {
        matches!(self, Self::Recording { .. })
    }
}
