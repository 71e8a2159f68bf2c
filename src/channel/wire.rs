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

//! SSH connection-protocol field encoding (RFC 4251 section 5).
//!
//! Only the primitive types that appear in channel-open payloads and
//! channel-request payloads are supported: `boolean`, `uint32` and `string`.

use bytes::{BufMut, Bytes, BytesMut};

use crate::shared::error::WireError;

/// Cursor over an SSH-encoded buffer.
#[derive(Debug, Clone)]
pub struct WireReader<'a> {
    buf: &'a [u8],
}

impl<'a> WireReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn take(&mut self, field: &'static str, needed: usize) -> Result<&'a [u8], WireError> {
        if self.buf.len() < needed {
            return Err(WireError::Truncated {
                field,
                needed,
                available: self.buf.len(),
            });
        }
        let (head, tail) = self.buf.split_at(needed);
        self.buf = tail;
        Ok(head)
    }

    pub fn read_bool(&mut self, field: &'static str) -> Result<bool, WireError> {
        Ok(self.take(field, 1)?[0] != 0)
    }

    pub fn read_u8(&mut self, field: &'static str) -> Result<u8, WireError> {
        Ok(self.take(field, 1)?[0])
    }

    pub fn read_u32(&mut self, field: &'static str) -> Result<u32, WireError> {
        let raw = self.take(field, 4)?;
        Ok(u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }

    /// Read a length-prefixed byte string.
    pub fn read_bytes(&mut self, field: &'static str) -> Result<&'a [u8], WireError> {
        let len = self.read_u32(field)? as usize;
        self.take(field, len)
    }

    /// Read a length-prefixed string that must be valid UTF-8.
    pub fn read_string(&mut self, field: &'static str) -> Result<String, WireError> {
        let raw = self.read_bytes(field)?;
        std::str::from_utf8(raw)
            .map(str::to_owned)
            .map_err(|_| WireError::InvalidUtf8 { field })
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Fail if anything is left in the buffer.
    pub fn finish(self) -> Result<(), WireError> {
        if self.buf.is_empty() {
            Ok(())
        } else {
            Err(WireError::TrailingBytes(self.buf.len()))
        }
    }
}

/// Growable SSH-encoded buffer.
#[derive(Debug, Default)]
pub struct WireWriter {
    buf: BytesMut,
}

impl WireWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_bool(&mut self, value: bool) -> &mut Self {
        self.buf.put_u8(u8::from(value));
        self
    }

    pub fn put_u8(&mut self, value: u8) -> &mut Self {
        self.buf.put_u8(value);
        self
    }

    pub fn put_u32(&mut self, value: u32) -> &mut Self {
        self.buf.put_u32(value);
        self
    }

    pub fn put_bytes(&mut self, value: &[u8]) -> &mut Self {
        self.buf.put_u32(value.len() as u32);
        self.buf.put_slice(value);
        self
    }

    pub fn put_string(&mut self, value: &str) -> &mut Self {
        self.put_bytes(value.as_bytes())
    }

    pub fn freeze(self) -> Bytes {
        self.buf.freeze()
    }
}

/// Endpoints carried by a `direct-tcpip` channel-open payload.
///
/// Field order on the wire is destination host, destination port,
/// originator host, originator port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelEndpoints {
    pub destination_host: String,
    pub destination_port: u32,
    pub source_host: String,
    pub source_port: u32,
}

impl TunnelEndpoints {
    pub fn decode(payload: &[u8]) -> Result<Self, WireError> {
        let mut reader = WireReader::new(payload);
        let endpoints = Self {
            destination_host: reader.read_string("destination host")?,
            destination_port: reader.read_u32("destination port")?,
            source_host: reader.read_string("source host")?,
            source_port: reader.read_u32("source port")?,
        };
        reader.finish()?;
        Ok(endpoints)
    }

    pub fn encode(&self) -> Bytes {
        let mut writer = WireWriter::new();
        writer
            .put_string(&self.destination_host)
            .put_u32(self.destination_port)
            .put_string(&self.source_host)
            .put_u32(self.source_port);
        writer.freeze()
    }
}

impl std::fmt::Display for TunnelEndpoints {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{} -> {}:{}",
            self.source_host, self.source_port, self.destination_host, self.destination_port
        )
    }
}
