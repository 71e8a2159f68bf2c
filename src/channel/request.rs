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

//! Out-of-band channel requests (RFC 4254 section 6).
//!
//! Requests travel through the proxy as `{type, want_reply, payload}` with the
//! payload kept in wire form, so that unknown request types pass through
//! untouched. [`ChannelRequest::body`] decodes the types the SSH adapters need
//! to translate.

use bytes::Bytes;

use super::wire::{WireReader, WireWriter};
use crate::shared::error::WireError;

/// Terminal dimensions carried by `pty-req` and `window-change`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WindowSize {
    pub cols: u32,
    pub rows: u32,
    pub width_px: u32,
    pub height_px: u32,
}

/// Decoded `pty-req` payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PtyRequest {
    pub term: String,
    pub size: WindowSize,
    /// Encoded terminal modes as `(opcode, argument)` pairs, without `TTY_OP_END`.
    pub modes: Vec<(u8, u32)>,
}

/// Decoded form of the request types the proxy understands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestBody {
    Pty(PtyRequest),
    Shell,
    Exec { command: Bytes },
    Env { name: String, value: String },
    Subsystem { name: String },
    WindowChange(WindowSize),
    Signal { name: String },
    ExitStatus { status: u32 },
    ExitSignal {
        signal: String,
        core_dumped: bool,
        message: String,
        lang: String,
    },
    Other,
}

const TTY_OP_END: u8 = 0;

/// A channel request with its payload in SSH wire form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelRequest {
    pub kind: String,
    pub want_reply: bool,
    pub payload: Bytes,
}

impl ChannelRequest {
    pub fn new(kind: impl Into<String>, want_reply: bool, payload: impl Into<Bytes>) -> Self {
        Self {
            kind: kind.into(),
            want_reply,
            payload: payload.into(),
        }
    }

    pub fn pty(want_reply: bool, pty: &PtyRequest) -> Self {
        let mut modes = WireWriter::new();
        for (opcode, arg) in &pty.modes {
            modes.put_u8(*opcode).put_u32(*arg);
        }
        modes.put_u8(TTY_OP_END);

        let mut writer = WireWriter::new();
        writer
            .put_string(&pty.term)
            .put_u32(pty.size.cols)
            .put_u32(pty.size.rows)
            .put_u32(pty.size.width_px)
            .put_u32(pty.size.height_px)
            .put_bytes(&modes.freeze());
        Self::new("pty-req", want_reply, writer.freeze())
    }

    pub fn shell(want_reply: bool) -> Self {
        Self::new("shell", want_reply, Bytes::new())
    }

    pub fn exec(want_reply: bool, command: &[u8]) -> Self {
        let mut writer = WireWriter::new();
        writer.put_bytes(command);
        Self::new("exec", want_reply, writer.freeze())
    }

    pub fn env(want_reply: bool, name: &str, value: &str) -> Self {
        let mut writer = WireWriter::new();
        writer.put_string(name).put_string(value);
        Self::new("env", want_reply, writer.freeze())
    }

    pub fn subsystem(want_reply: bool, name: &str) -> Self {
        let mut writer = WireWriter::new();
        writer.put_string(name);
        Self::new("subsystem", want_reply, writer.freeze())
    }

    pub fn window_change(size: WindowSize) -> Self {
        let mut writer = WireWriter::new();
        writer
            .put_u32(size.cols)
            .put_u32(size.rows)
            .put_u32(size.width_px)
            .put_u32(size.height_px);
        Self::new("window-change", false, writer.freeze())
    }

    /// `name` is the signal name without the `SIG` prefix.
    pub fn signal(name: &str) -> Self {
        let mut writer = WireWriter::new();
        writer.put_string(name);
        Self::new("signal", false, writer.freeze())
    }

    pub fn exit_status(status: u32) -> Self {
        let mut writer = WireWriter::new();
        writer.put_u32(status);
        Self::new("exit-status", false, writer.freeze())
    }

    pub fn exit_signal(signal: &str, core_dumped: bool, message: &str, lang: &str) -> Self {
        let mut writer = WireWriter::new();
        writer
            .put_string(signal)
            .put_bool(core_dumped)
            .put_string(message)
            .put_string(lang);
        Self::new("exit-signal", false, writer.freeze())
    }

    /// Decode the payload according to the request type.
    pub fn body(&self) -> Result<RequestBody, WireError> {
        let mut reader = WireReader::new(&self.payload);
        let body = match self.kind.as_str() {
            "pty-req" => {
                let term = reader.read_string("terminal type")?;
                let size = read_window_size(&mut reader)?;
                let modes = decode_modes(reader.read_bytes("terminal modes")?)?;
                RequestBody::Pty(PtyRequest { term, size, modes })
            }
            "shell" => RequestBody::Shell,
            "exec" => RequestBody::Exec {
                command: Bytes::copy_from_slice(reader.read_bytes("command")?),
            },
            "env" => RequestBody::Env {
                name: reader.read_string("variable name")?,
                value: reader.read_string("variable value")?,
            },
            "subsystem" => RequestBody::Subsystem {
                name: reader.read_string("subsystem name")?,
            },
            "window-change" => RequestBody::WindowChange(read_window_size(&mut reader)?),
            "signal" => RequestBody::Signal {
                name: reader.read_string("signal name")?,
            },
            "exit-status" => RequestBody::ExitStatus {
                status: reader.read_u32("exit status")?,
            },
            "exit-signal" => RequestBody::ExitSignal {
                signal: reader.read_string("signal name")?,
                core_dumped: reader.read_bool("core dumped")?,
                message: reader.read_string("error message")?,
                lang: reader.read_string("language tag")?,
            },
            _ => return Ok(RequestBody::Other),
        };
        reader.finish()?;
        Ok(body)
    }

    /// Command text of an `exec` request, falling back to the raw payload
    /// when it does not decode.
    pub fn exec_command(&self) -> Option<Bytes> {
        if self.kind != "exec" {
            return None;
        }
        match self.body() {
            Ok(RequestBody::Exec { command }) => Some(command),
            _ => Some(self.payload.clone()),
        }
    }
}

fn read_window_size(reader: &mut WireReader<'_>) -> Result<WindowSize, WireError> {
    Ok(WindowSize {
        cols: reader.read_u32("terminal width")?,
        rows: reader.read_u32("terminal height")?,
        width_px: reader.read_u32("terminal pixel width")?,
        height_px: reader.read_u32("terminal pixel height")?,
    })
}

fn decode_modes(raw: &[u8]) -> Result<Vec<(u8, u32)>, WireError> {
    let mut reader = WireReader::new(raw);
    let mut modes = Vec::new();
    while !reader.is_empty() {
        let opcode = reader.read_u8("terminal mode opcode")?;
        if opcode == TTY_OP_END {
            break;
        }
        modes.push((opcode, reader.read_u32("terminal mode argument")?));
    }
    Ok(modes)
}
