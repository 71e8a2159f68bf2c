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

//! Drivers that expose russh channels as [`ChannelEnd`]s.
//!
//! Outbound (client) channels are owned by a single task that multiplexes
//! `Channel::wait` with the command queue. Replies to requests we send are
//! matched first-in first-out, which is the order SSH guarantees.
//!
//! Inbound (server) channels are split in two tasks: one reads the channel,
//! the other writes through the session [`russh::server::Handle`] so that
//! data, EOF, exit status and close keep their relative order. Requests from
//! the client arrive through handler callbacks, not through this module.

use std::collections::VecDeque;

use bytes::Bytes;
use russh::{client, server, Channel, ChannelId, ChannelMsg, CryptoVec, Pty, Sig};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::channel::{
    ChannelEnd, ChannelHandle, ChannelRequest, Command, Frame, IncomingRequest, RequestBody,
    CHANNEL_QUEUE_DEPTH,
};
use crate::shared::error::ChannelError;

type ReplySender = oneshot::Sender<Result<bool, ChannelError>>;

/// Answers owed for requests sent with want_reply, oldest first.
#[derive(Default)]
struct PendingReplies(VecDeque<ReplySender>);

impl PendingReplies {
    fn push(&mut self, reply: ReplySender) {
        self.0.push_back(reply);
    }

    /// Resolve the oldest pending request. Returns `false` if none is pending.
    fn answer(&mut self, accepted: bool) -> bool {
        match self.0.pop_front() {
            Some(reply) => {
                let _ = reply.send(Ok(accepted));
                true
            }
            None => false,
        }
    }

    fn fail_all(&mut self) {
        for reply in self.0.drain(..) {
            let _ = reply.send(Err(ChannelError::Closed));
        }
    }

    fn len(&self) -> usize {
        self.0.len()
    }

    fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Take ownership of an outbound channel.
pub fn spawn_client_channel(channel: Channel<client::Msg>) -> ChannelEnd {
    let (command_tx, commands) = mpsc::channel(CHANNEL_QUEUE_DEPTH);
    let (frame_tx, frames) = mpsc::channel(CHANNEL_QUEUE_DEPTH);
    let (request_tx, requests) = mpsc::channel(CHANNEL_QUEUE_DEPTH);

    let driver = ClientChannelDriver {
        channel,
        commands,
        frames: Some(frame_tx),
        requests: Some(request_tx),
        stalled: None,
        stalled_request: None,
        replies: PendingReplies::default(),
        closed: false,
    };
    tokio::spawn(driver.run());

    ChannelEnd {
        frames,
        requests,
        handle: ChannelHandle::new(command_tx),
    }
}

struct ClientChannelDriver {
    channel: Channel<client::Msg>,
    commands: mpsc::Receiver<Command>,
    frames: Option<mpsc::Sender<Frame>>,
    requests: Option<mpsc::Sender<IncomingRequest>>,
    /// Frame waiting for queue space; the channel is not read meanwhile.
    stalled: Option<Frame>,
    /// Same for a request from the backend, so requests keep their order.
    stalled_request: Option<IncomingRequest>,
    replies: PendingReplies,
    closed: bool,
}

impl ClientChannelDriver {
    async fn run(mut self) {
        let id = self.channel.id();
        loop {
            tokio::select! {
                permit = reserve(&self.frames), if self.stalled.is_some() => {
                    let sent = match (permit, self.stalled.take()) {
                        (Some(permit), Some(frame)) => {
                            permit.send(frame);
                            true
                        }
                        _ => false,
                    };
                    if !sent {
                        self.frames = None;
                    }
                }
                permit = reserve(&self.requests), if self.stalled_request.is_some() => {
                    let sent = match (permit, self.stalled_request.take()) {
                        (Some(permit), Some(request)) => {
                            permit.send(request);
                            true
                        }
                        _ => false,
                    };
                    if !sent {
                        self.requests = None;
                    }
                }
                message = self.channel.wait(),
                    if self.stalled.is_none() && self.stalled_request.is_none() =>
                {
                    match message {
                        Some(message) => self.on_message(message),
                        None => break,
                    }
                }
                command = self.commands.recv() => {
                    match command {
                        Some(command) => {
                            if !self.on_command(command).await {
                                break;
                            }
                        }
                        None => {
                            if !self.closed {
                                let _ = self.channel.close().await;
                            }
                            break;
                        }
                    }
                }
            }
        }
        self.fail_pending();
        debug!(channel = %id, "outbound channel driver stopped");
    }

    fn on_message(&mut self, message: ChannelMsg) {
        match message {
            ChannelMsg::Data { data } => self.deliver(Frame::Data(Bytes::copy_from_slice(&data))),
            ChannelMsg::ExtendedData { data, ext } => {
                self.deliver(Frame::Extended(ext, Bytes::copy_from_slice(&data)))
            }
            ChannelMsg::Eof => self.frames = None,
            ChannelMsg::Close => {
                self.frames = None;
                self.requests = None;
            }
            ChannelMsg::Success => self.answer(true),
            ChannelMsg::Failure => self.answer(false),
            ChannelMsg::ExitStatus { exit_status } => {
                self.incoming(ChannelRequest::exit_status(exit_status))
            }
            ChannelMsg::ExitSignal {
                signal_name,
                core_dumped,
                error_message,
                lang_tag,
            } => self.incoming(ChannelRequest::exit_signal(
                &signal_to_name(&signal_name),
                core_dumped,
                &error_message,
                &lang_tag,
            )),
            other => trace!(message = ?other, "ignoring outbound channel message"),
        }
    }

    fn deliver(&mut self, frame: Frame) {
        let Some(frames) = &self.frames else {
            return;
        };
        match frames.try_send(frame) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(frame)) => self.stalled = Some(frame),
            Err(mpsc::error::TrySendError::Closed(_)) => self.frames = None,
        }
    }

    fn incoming(&mut self, request: ChannelRequest) {
        let Some(requests) = &self.requests else {
            return;
        };
        match requests.try_send(IncomingRequest::new(request, None)) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(request)) => self.stalled_request = Some(request),
            Err(mpsc::error::TrySendError::Closed(_)) => self.requests = None,
        }
    }

    fn answer(&mut self, accepted: bool) {
        if !self.replies.answer(accepted) {
            debug!(accepted, "reply without a pending request");
        }
    }

    /// Returns `false` when the channel can no longer be written.
    async fn on_command(&mut self, command: Command) -> bool {
        if self.closed {
            if let Command::Request { reply, .. } = command {
                let _ = reply.send(Err(ChannelError::Closed));
            }
            return true;
        }

        let written = match command {
            Command::Frame(Frame::Data(data)) => self.channel.data(&data[..]).await,
            Command::Frame(Frame::Extended(ext, data)) => {
                self.channel.extended_data(ext, &data[..]).await
            }
            Command::Eof => self.channel.eof().await,
            Command::Request { request, reply } => {
                self.send_request(request, reply).await;
                return true;
            }
            Command::Close => {
                self.closed = true;
                self.frames = None;
                self.requests = None;
                self.stalled = None;
                self.stalled_request = None;
                self.fail_pending();
                self.channel.close().await
            }
        };

        match written {
            Ok(()) => true,
            Err(error) => {
                debug!(%error, "write to outbound channel failed");
                false
            }
        }
    }

    async fn send_request(&mut self, request: ChannelRequest, reply: ReplySender) {
        let want_reply = request.want_reply;
        let body = match request.body() {
            Ok(body) => body,
            Err(error) => {
                warn!(request = %request.kind, %error, "refusing malformed request");
                let _ = reply.send(Ok(false));
                return;
            }
        };

        let channel = &self.channel;
        // window-change and signal never carry a reply.
        let mut expects_reply = want_reply;
        let sent = match body {
            RequestBody::Pty(pty) => {
                let modes: Vec<(Pty, u32)> = pty
                    .modes
                    .iter()
                    .filter_map(|(opcode, arg)| Pty::from_u8(*opcode).map(|mode| (mode, *arg)))
                    .collect();
                channel
                    .request_pty(
                        want_reply,
                        &pty.term,
                        pty.size.cols,
                        pty.size.rows,
                        pty.size.width_px,
                        pty.size.height_px,
                        &modes,
                    )
                    .await
            }
            RequestBody::Shell => channel.request_shell(want_reply).await,
            RequestBody::Exec { command } => channel.exec(want_reply, command.to_vec()).await,
            RequestBody::Env { name, value } => channel.set_env(want_reply, name, value).await,
            RequestBody::Subsystem { name } => channel.request_subsystem(want_reply, name).await,
            RequestBody::WindowChange(size) => {
                expects_reply = false;
                channel
                    .window_change(size.cols, size.rows, size.width_px, size.height_px)
                    .await
            }
            RequestBody::Signal { name } => {
                expects_reply = false;
                channel.signal(signal_from_name(&name)).await
            }
            RequestBody::ExitStatus { .. }
            | RequestBody::ExitSignal { .. }
            | RequestBody::Other => {
                debug!(request = %request.kind, "request not supported towards a backend");
                let _ = reply.send(Ok(false));
                return;
            }
        };

        match sent {
            Err(error) => {
                let _ = reply.send(Err(ChannelError::ssh(error)));
            }
            Ok(()) if expects_reply => self.replies.push(reply),
            Ok(()) => {
                let _ = reply.send(Ok(false));
            }
        }
    }

    fn fail_pending(&mut self) {
        if !self.replies.is_empty() {
            debug!(pending = self.replies.len(), "failing unanswered requests");
        }
        self.replies.fail_all();
    }
}

async fn reserve<T>(queue: &Option<mpsc::Sender<T>>) -> Option<mpsc::OwnedPermit<T>> {
    match queue.clone() {
        Some(queue) => queue.reserve_owned().await.ok(),
        None => None,
    }
}

/// Take ownership of an inbound channel.
///
/// `requests` carries the client's requests, fed by the connection handler.
pub fn spawn_server_channel(
    channel: Channel<server::Msg>,
    handle: server::Handle,
    requests: mpsc::Receiver<IncomingRequest>,
) -> ChannelEnd {
    let id = channel.id();
    let (command_tx, commands) = mpsc::channel(CHANNEL_QUEUE_DEPTH);
    let (frame_tx, frames) = mpsc::channel(CHANNEL_QUEUE_DEPTH);
    let closed = CancellationToken::new();

    tokio::spawn(read_server_channel(channel, frame_tx, closed.clone()));
    tokio::spawn(write_server_channel(id, handle, commands, closed));

    ChannelEnd {
        frames,
        requests,
        handle: ChannelHandle::new(command_tx),
    }
}

async fn read_server_channel(
    mut channel: Channel<server::Msg>,
    frames: mpsc::Sender<Frame>,
    closed: CancellationToken,
) {
    let mut frames = Some(frames);
    loop {
        let message = tokio::select! {
            _ = closed.cancelled() => break,
            message = channel.wait() => message,
        };
        let frame = match message {
            Some(ChannelMsg::Data { data }) => Frame::Data(Bytes::copy_from_slice(&data)),
            Some(ChannelMsg::ExtendedData { data, ext }) => {
                Frame::Extended(ext, Bytes::copy_from_slice(&data))
            }
            Some(ChannelMsg::Eof) => {
                frames = None;
                continue;
            }
            Some(ChannelMsg::Close) | None => break,
            Some(_) => continue,
        };
        let Some(sink) = &frames else {
            continue;
        };
        tokio::select! {
            _ = closed.cancelled() => break,
            sent = sink.send(frame) => {
                if sent.is_err() {
                    frames = None;
                }
            }
        }
    }
}

async fn write_server_channel(
    id: ChannelId,
    handle: server::Handle,
    mut commands: mpsc::Receiver<Command>,
    closed: CancellationToken,
) {
    while let Some(command) = commands.recv().await {
        let written = match command {
            Command::Frame(Frame::Data(data)) => {
                handle.data(id, CryptoVec::from_slice(&data)).await.is_ok()
            }
            Command::Frame(Frame::Extended(ext, data)) => handle
                .extended_data(id, ext, CryptoVec::from_slice(&data))
                .await
                .is_ok(),
            Command::Eof => handle.eof(id).await.is_ok(),
            Command::Request { request, reply } => {
                forward_to_client(&handle, id, &request).await;
                let _ = reply.send(Ok(false));
                true
            }
            Command::Close => break,
        };
        if !written {
            debug!(channel = %id, "write to inbound channel failed");
            break;
        }
    }

    let _ = handle.close(id).await;
    closed.cancel();
}

/// Send a backend request to the client. Only exit reports are meaningful
/// in this direction and none of them expects a reply.
async fn forward_to_client(handle: &server::Handle, id: ChannelId, request: &ChannelRequest) {
    match request.body() {
        Ok(RequestBody::ExitStatus { status }) => {
            let _ = handle.exit_status_request(id, status).await;
        }
        Ok(RequestBody::ExitSignal {
            signal,
            core_dumped,
            message,
            lang,
        }) => {
            let _ = handle
                .exit_signal_request(id, signal_from_name(&signal), core_dumped, message, lang)
                .await;
        }
        _ => debug!(request = %request.kind, "request not forwarded to client"),
    }
}

/// Signal name as carried on the wire, without the `SIG` prefix.
pub fn signal_to_name(signal: &Sig) -> String {
    match signal {
        Sig::ABRT => "ABRT".to_string(),
        Sig::ALRM => "ALRM".to_string(),
        Sig::FPE => "FPE".to_string(),
        Sig::HUP => "HUP".to_string(),
        Sig::ILL => "ILL".to_string(),
        Sig::INT => "INT".to_string(),
        Sig::KILL => "KILL".to_string(),
        Sig::PIPE => "PIPE".to_string(),
        Sig::QUIT => "QUIT".to_string(),
        Sig::SEGV => "SEGV".to_string(),
        Sig::TERM => "TERM".to_string(),
        Sig::USR1 => "USR1".to_string(),
        Sig::Custom(name) => name.clone(),
        #[allow(unreachable_patterns)]
        other => format!("{other:?}"),
    }
}

pub fn signal_from_name(name: &str) -> Sig {
    match name {
        "ABRT" => Sig::ABRT,
        "ALRM" => Sig::ALRM,
        "FPE" => Sig::FPE,
        "HUP" => Sig::HUP,
        "ILL" => Sig::ILL,
        "INT" => Sig::INT,
        "KILL" => Sig::KILL,
        "PIPE" => Sig::PIPE,
        "QUIT" => Sig::QUIT,
        "SEGV" => Sig::SEGV,
        "TERM" => Sig::TERM,
        "USR1" => Sig::USR1,
        other => Sig::Custom(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_names_round_trip() {
        for name in ["INT", "TERM", "HUP", "USR1", "KILL"] {
            assert_eq!(signal_to_name(&signal_from_name(name)), name);
        }
    }

    #[tokio::test]
    async fn test_replies_resolve_oldest_first() {
        let mut pending = PendingReplies::default();
        let (first_tx, first) = oneshot::channel();
        let (second_tx, second) = oneshot::channel();
        pending.push(first_tx);
        pending.push(second_tx);

        assert!(pending.answer(true));
        assert!(pending.answer(false));
        assert!(!pending.answer(true));
        assert_eq!(first.await.unwrap(), Ok(true));
        assert_eq!(second.await.unwrap(), Ok(false));
    }

    #[tokio::test]
    async fn test_unanswered_requests_fail_on_close() {
        let mut pending = PendingReplies::default();
        let (answered_tx, answered) = oneshot::channel();
        let (lost_tx, lost) = oneshot::channel();
        pending.push(answered_tx);
        pending.push(lost_tx);

        assert!(pending.answer(true));
        pending.fail_all();
        assert!(pending.is_empty());
        assert_eq!(answered.await.unwrap(), Ok(true));
        assert_eq!(lost.await.unwrap(), Err(ChannelError::Closed));
    }

    #[test]
    fn test_custom_signal() {
        let sig = signal_from_name("USR2");
        assert!(matches!(sig, Sig::Custom(ref name) if name == "USR2"));
        assert_eq!(signal_to_name(&sig), "USR2");
    }
}
