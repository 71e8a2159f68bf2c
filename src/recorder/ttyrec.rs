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

//! ttyrec frame format.
//!
//! Each frame is a 12-byte little-endian header `{sec: i32, usec: i32, len: i32}`
//! followed by `len` payload bytes. Labelled frames carry `"{label}: "` in
//! front of the payload.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};

pub const HEADER_LEN: usize = 12;

/// One decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TtyrecFrame {
    pub sec: i32,
    pub usec: i32,
    pub payload: Bytes,
}

/// Encode one frame stamped with `at`.
pub fn encode_frame(at: DateTime<Utc>, label: Option<&str>, data: &[u8]) -> Bytes {
    let prefix_len = label.map_or(0, |label| label.len() + 2);
    let len = prefix_len + data.len();

    let mut frame = BytesMut::with_capacity(HEADER_LEN + len);
    // ttyrec stores 32-bit seconds; wrap like every other ttyrec writer.
    frame.put_i32_le(at.timestamp() as i32);
    frame.put_i32_le(at.timestamp_subsec_micros() as i32);
    frame.put_i32_le(len as i32);
    if let Some(label) = label {
        frame.put_slice(label.as_bytes());
        frame.put_slice(b": ");
    }
    frame.put_slice(data);
    frame.freeze()
}

/// Split a recording into frames. A truncated trailing frame is ignored.
pub fn decode_frames(mut buf: &[u8]) -> Vec<TtyrecFrame> {
    let mut frames = Vec::new();
    while buf.len() >= HEADER_LEN {
        let sec = buf.get_i32_le();
        let usec = buf.get_i32_le();
        let len = buf.get_i32_le().max(0) as usize;
        if buf.len() < len {
            break;
        }
        frames.push(TtyrecFrame {
            sec,
            usec,
            payload: Bytes::copy_from_slice(&buf[..len]),
        });
        buf.advance(len);
    }
    frames
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_header_layout() {
        let at = Utc.timestamp_opt(1_700_000_000, 250_000_000).unwrap();
        let frame = encode_frame(at, None, b"hello");
        assert_eq!(&frame[0..4], &1_700_000_000i32.to_le_bytes());
        assert_eq!(&frame[4..8], &250_000i32.to_le_bytes());
        assert_eq!(&frame[8..12], &5i32.to_le_bytes());
        assert_eq!(&frame[12..], b"hello");
    }

    #[test]
    fn test_label_prefix_counts_in_length() {
        let at = Utc.timestamp_opt(0, 0).unwrap();
        let frame = encode_frame(at, Some("10.0.0.5"), b"GET /");
        let frames = decode_frames(&frame);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload.as_ref(), b"10.0.0.5: GET /");
    }

    #[test]
    fn test_decode_ignores_partial_tail() {
        let at = Utc.timestamp_opt(10, 0).unwrap();
        let mut buf = encode_frame(at, None, b"one").to_vec();
        buf.extend_from_slice(&encode_frame(at, None, b"two")[..14]);
        let frames = decode_frames(&buf);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].sec, 10);
    }
}
