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

//! Session recording.
//!
//! Every proxied channel gets one recording destination named after the
//! connection that opened it. The pipe engine writes to it through
//! [`RecordingTap`]s placed on the write path of a channel end, so what is
//! recorded is exactly what was delivered.
//!
//! # Modules
//!
//! - [`file`]: file-backed [`RecordingSink`]
//! - [`ttyrec`]: the on-disk frame format

pub mod file;
pub mod ttyrec;

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, TimeZone};

use crate::shared::session::SessionId;

pub use self::file::FileRecorder;

/// Destination for recorded bytes.
///
/// Implementations must accept concurrent callers: a tunnel records both
/// directions into the same sink.
#[async_trait]
pub trait RecordingSink: Send + Sync {
    /// Persist one chunk. `label` names the host the bytes were delivered to
    /// when the recording interleaves several streams.
    async fn record(&self, label: Option<&str>, data: &[u8]) -> io::Result<()>;
}

/// Build the recording path for one channel.
///
/// The file name is `{caller_user}-{username}-{channel_type}-{session_id}-{started_at}`
/// with the timestamp in RFC 3339 form.
pub fn recording_path<Tz>(
    location: &Path,
    caller_user: &str,
    username: &str,
    channel_type: &str,
    session_id: SessionId,
    started_at: &DateTime<Tz>,
) -> PathBuf
where
    Tz: TimeZone,
    Tz::Offset: std::fmt::Display,
{
    location.join(format!(
        "{caller_user}-{username}-{channel_type}-{session_id}-{}",
        started_at.to_rfc3339_opts(SecondsFormat::Micros, false)
    ))
}

/// Pass-through tap that copies one stream into a sink.
#[derive(Clone)]
pub struct RecordingTap {
    sink: Arc<dyn RecordingSink>,
    label: Option<Arc<str>>,
}

impl RecordingTap {
    pub fn new(sink: Arc<dyn RecordingSink>, label: Option<&str>) -> Self {
        Self {
            sink,
            label: label.map(Arc::from),
        }
    }

    pub async fn record(&self, data: &[u8]) -> io::Result<()> {
        self.sink.record(self.label.as_deref(), data).await
    }
}

impl std::fmt::Debug for RecordingTap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordingTap")
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{FixedOffset, Utc};

    #[test]
    fn test_recording_path_layout() {
        let started_at = FixedOffset::east_opt(9 * 3600)
            .unwrap()
            .with_ymd_and_hms(2024, 3, 1, 12, 30, 5)
            .unwrap();
        let path = recording_path(
            Path::new("/var/log/hopgate"),
            "alice",
            "db1",
            "session",
            SessionId::from_raw(7),
            &started_at,
        );
        assert_eq!(
            path,
            PathBuf::from("/var/log/hopgate/alice-db1-session-7-2024-03-01T12:30:05.000000+09:00")
        );
    }

    #[test]
    fn test_recording_path_distinct_per_start_time() {
        let first = Utc::now();
        let second = first + chrono::Duration::microseconds(1);
        let id = SessionId::from_raw(3);
        let dir = Path::new("/tmp");

        let a = recording_path(dir, "bob", "web", "direct-tcpip", id, &first);
        let b = recording_path(dir, "bob", "web", "direct-tcpip", id, &second);
        assert_ne!(a, b);
    }
}
