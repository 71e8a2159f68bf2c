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

//! Per-connection russh handler.
//!
//! Authenticates the client, then turns every `session` and `direct-tcpip`
//! channel into a dispatch task. Client requests are delivered to the
//! channel's request stream and answered from a per-channel queue so that
//! replies leave in request order.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use russh::keys::ssh_key;
use russh::server::{Auth, Handle, Msg, Session};
use russh::{Channel, ChannelId, Pty, Sig};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use super::identity::{ChainResolver, IdentityProvider};
use crate::channel::{
    ChannelRequest, IncomingRequest, PtyRequest, TunnelEndpoints, WindowSize,
    CHANNEL_QUEUE_DEPTH,
};
use crate::config::RecordingFailurePolicy;
use crate::dispatch::{AcceptedChannel, DispatchRequest, Dispatcher};
use crate::hop::HopChain;
use crate::shared::session::{AuthenticatedIdentity, SessionId};
use crate::ssh::driver::{signal_to_name, spawn_server_channel};
use crate::ssh::RusshConnector;

/// State shared by every connection of a server.
pub struct ServerContext {
    pub dispatcher: Dispatcher<RusshConnector>,
    pub identities: Arc<dyn IdentityProvider>,
    pub chains: Arc<dyn ChainResolver>,
    pub on_recording_failure: RecordingFailurePolicy,
    /// Cancelled to stop the whole server.
    pub shutdown: CancellationToken,
}

#[derive(Debug, Clone)]
struct Login {
    caller_user: String,
    identity: AuthenticatedIdentity,
    chain: HopChain,
}

/// Where client requests for one channel go.
struct ChannelSlot {
    requests: mpsc::Sender<IncomingRequest>,
    replies: mpsc::UnboundedSender<oneshot::Receiver<bool>>,
}

impl ChannelSlot {
    /// Wrap a client request, queueing one answer only when a reply is wanted.
    fn admit(&self, request: ChannelRequest) -> IncomingRequest {
        let reply = if request.want_reply {
            let (tx, rx) = oneshot::channel();
            self.replies.send(rx).ok().map(|()| tx)
        } else {
            None
        };
        IncomingRequest::new(request, reply)
    }
}

/// Whether clients send `kind` with want_reply set.
///
/// russh does not hand the flag to the handler. OpenSSH, paramiko and
/// libssh2 ask for a reply to pty-req, shell, exec and subsystem, and never
/// for env, window-change or signal.
fn client_wants_reply(kind: &str) -> bool {
    matches!(kind, "pty-req" | "shell" | "exec" | "subsystem")
}

/// SSH handler for a single client connection.
pub struct SshHandler {
    peer_addr: Option<SocketAddr>,
    session_id: SessionId,
    context: Arc<ServerContext>,
    login: Option<Login>,
    channels: HashMap<ChannelId, ChannelSlot>,
}

impl SshHandler {
    pub fn new(peer_addr: Option<SocketAddr>, context: Arc<ServerContext>) -> Self {
        Self {
            peer_addr,
            session_id: SessionId::new(),
            context,
            login: None,
            channels: HashMap::new(),
        }
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn is_authenticated(&self) -> bool {
        self.login.is_some()
    }

    /// Name of the authenticated identity, if any.
    pub fn username(&self) -> Option<&str> {
        self.login.as_ref().map(|login| login.identity.name.as_str())
    }

    fn reject() -> Auth {
        Auth::Reject {
            proceed_with_methods: None,
            partial_success: false,
        }
    }

    /// Resolve identity and target for a login attempt.
    fn authorize(&self, user: &str, public_key: &ssh_key::PublicKey) -> Option<Login> {
        let identity = self.context.identities.identify(public_key)?;
        let chain = self.context.chains.resolve(&identity, user)?;
        Some(Login {
            caller_user: user.to_string(),
            identity,
            chain,
        })
    }

    /// Adopt an accepted channel and start proxying it.
    fn open_channel(
        &mut self,
        channel: Channel<Msg>,
        channel_type: &'static str,
        extra_data: Bytes,
        handle: Handle,
    ) -> bool {
        let Some(login) = self.login.clone() else {
            tracing::warn!(peer = ?self.peer_addr, "channel open before authentication");
            return false;
        };

        let id = channel.id();
        let (requests, request_rx) = mpsc::channel(CHANNEL_QUEUE_DEPTH);
        let (replies, reply_rx) = mpsc::unbounded_channel();
        tokio::spawn(answer_requests(id, handle.clone(), reply_rx));
        let end = spawn_server_channel(channel, handle, request_rx);
        self.channels.insert(id, ChannelSlot { requests, replies });

        tracing::debug!(
            session_id = %self.session_id,
            channel = %id,
            channel_type,
            "channel accepted"
        );

        let request = DispatchRequest {
            identity: login.identity,
            caller_user: login.caller_user,
            session_id: self.session_id,
            chain: login.chain,
        };
        let new_channel = AcceptedChannel::new(channel_type, extra_data, end);
        let context = Arc::clone(&self.context);
        let session_id = self.session_id;
        let peer = self.peer_addr;

        tokio::spawn(async move {
            match context.dispatcher.dispatch(new_channel, request).await {
                Ok(()) => {
                    tracing::debug!(%session_id, channel_type, "channel finished");
                }
                Err(error)
                    if error.is_recording_failure()
                        && context.on_recording_failure == RecordingFailurePolicy::Terminate =>
                {
                    tracing::error!(
                        %session_id,
                        peer = ?peer,
                        %error,
                        "recording unavailable, shutting down"
                    );
                    context.shutdown.cancel();
                }
                Err(error) => {
                    tracing::warn!(
                        %session_id,
                        peer = ?peer,
                        channel_type,
                        %error,
                        "channel failed"
                    );
                }
            }
        });
        true
    }

    /// Queue a client request for the channel's pipe.
    fn deliver(
        &mut self,
        id: ChannelId,
        request: ChannelRequest,
        session: &mut Session,
    ) -> impl std::future::Future<Output = Result<(), anyhow::Error>> + Send {
        let kind = request.kind.clone();
        let target = match self.channels.get(&id) {
            Some(slot) => Some((slot.requests.clone(), slot.admit(request))),
            None => {
                tracing::warn!(channel = %id, request = %kind, "request for unknown channel");
                let _ = session.channel_failure(id);
                None
            }
        };

        async move {
            if let Some((requests, incoming)) = target {
                if requests.send(incoming).await.is_err() {
                    tracing::debug!(
                        channel = %id,
                        request = %kind,
                        "channel no longer reads requests"
                    );
                }
            }
            Ok(())
        }
    }
}

/// Answer client requests in the order they arrived.
async fn answer_requests(
    id: ChannelId,
    handle: Handle,
    mut replies: mpsc::UnboundedReceiver<oneshot::Receiver<bool>>,
) {
    while let Some(answer) = replies.recv().await {
        let accepted = answer.await.unwrap_or(false);
        let sent = if accepted {
            handle.channel_success(id).await
        } else {
            handle.channel_failure(id).await
        };
        if sent.is_err() {
            break;
        }
    }
}

impl russh::server::Handler for SshHandler {
    type Error = anyhow::Error;

    fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &ssh_key::PublicKey,
    ) -> impl std::future::Future<Output = Result<Auth, Self::Error>> + Send {
        let auth = match self.authorize(user, public_key) {
            Some(login) => {
                tracing::info!(
                    session_id = %self.session_id,
                    peer = ?self.peer_addr,
                    user = %user,
                    identity = %login.identity.name,
                    hops = login.chain.len(),
                    "client authenticated"
                );
                self.login = Some(login);
                Auth::Accept
            }
            None => {
                tracing::info!(
                    peer = ?self.peer_addr,
                    user = %user,
                    key_type = %public_key.algorithm(),
                    "public key rejected"
                );
                Self::reject()
            }
        };
        async move { Ok(auth) }
    }

    fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        session: &mut Session,
    ) -> impl std::future::Future<Output = Result<bool, Self::Error>> + Send {
        let accepted = self.open_channel(channel, "session", Bytes::new(), session.handle());
        async move { Ok(accepted) }
    }

    fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        originator_address: &str,
        originator_port: u32,
        session: &mut Session,
    ) -> impl std::future::Future<Output = Result<bool, Self::Error>> + Send {
        let endpoints = TunnelEndpoints {
            destination_host: host_to_connect.to_string(),
            destination_port: port_to_connect,
            source_host: originator_address.to_string(),
            source_port: originator_port,
        };
        let accepted =
            self.open_channel(channel, "direct-tcpip", endpoints.encode(), session.handle());
        async move { Ok(accepted) }
    }

    #[allow(clippy::too_many_arguments)]
    fn pty_request(
        &mut self,
        channel: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        modes: &[(Pty, u32)],
        session: &mut Session,
    ) -> impl std::future::Future<Output = Result<(), Self::Error>> + Send {
        let pty = PtyRequest {
            term: term.to_string(),
            size: WindowSize {
                cols: col_width,
                rows: row_height,
                width_px: pix_width,
                height_px: pix_height,
            },
            modes: modes.iter().map(|(mode, value)| (*mode as u8, *value)).collect(),
        };
        let request = ChannelRequest::pty(client_wants_reply("pty-req"), &pty);
        self.deliver(channel, request, session)
    }

    fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> impl std::future::Future<Output = Result<(), Self::Error>> + Send {
        let request = ChannelRequest::shell(client_wants_reply("shell"));
        self.deliver(channel, request, session)
    }

    fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> impl std::future::Future<Output = Result<(), Self::Error>> + Send {
        tracing::debug!(
            session_id = %self.session_id,
            command = %String::from_utf8_lossy(data),
            "exec request"
        );
        let request = ChannelRequest::exec(client_wants_reply("exec"), data);
        self.deliver(channel, request, session)
    }

    fn env_request(
        &mut self,
        channel: ChannelId,
        variable_name: &str,
        variable_value: &str,
        session: &mut Session,
    ) -> impl std::future::Future<Output = Result<(), Self::Error>> + Send {
        let request =
            ChannelRequest::env(client_wants_reply("env"), variable_name, variable_value);
        self.deliver(channel, request, session)
    }

    fn subsystem_request(
        &mut self,
        channel: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> impl std::future::Future<Output = Result<(), Self::Error>> + Send {
        let request = ChannelRequest::subsystem(client_wants_reply("subsystem"), name);
        self.deliver(channel, request, session)
    }

    fn window_change_request(
        &mut self,
        channel: ChannelId,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        session: &mut Session,
    ) -> impl std::future::Future<Output = Result<(), Self::Error>> + Send {
        let size = WindowSize {
            cols: col_width,
            rows: row_height,
            width_px: pix_width,
            height_px: pix_height,
        };
        self.deliver(channel, ChannelRequest::window_change(size), session)
    }

    fn signal(
        &mut self,
        channel: ChannelId,
        signal: Sig,
        session: &mut Session,
    ) -> impl std::future::Future<Output = Result<(), Self::Error>> + Send {
        let name = signal_to_name(&signal);
        self.deliver(channel, ChannelRequest::signal(&name), session)
    }

    /// X11 forwarding needs reverse channels from the backend; refused.
    fn x11_request(
        &mut self,
        channel: ChannelId,
        _single_connection: bool,
        _x11_auth_protocol: &str,
        _x11_auth_cookie: &str,
        _x11_screen_number: u32,
        session: &mut Session,
    ) -> impl std::future::Future<Output = Result<(), Self::Error>> + Send {
        tracing::debug!(session_id = %self.session_id, channel = %channel, "refusing x11-req");
        let _ = session.channel_failure(channel);
        async { Ok(()) }
    }

    fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> impl std::future::Future<Output = Result<(), Self::Error>> + Send {
        // Ends the channel's request stream.
        self.channels.remove(&channel);
        async { Ok(()) }
    }
}

impl Drop for SshHandler {
    fn drop(&mut self) {
        tracing::info!(
            session_id = %self.session_id,
            peer = ?self.peer_addr,
            channels = self.channels.len(),
            "connection closed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::identity::ConfigDirectory;

    fn context() -> Arc<ServerContext> {
        let directory = Arc::new(ConfigDirectory::default());
        Arc::new(ServerContext {
            dispatcher: Dispatcher::new(RusshConnector::new()),
            identities: directory.clone(),
            chains: directory,
            on_recording_failure: RecordingFailurePolicy::CloseSession,
            shutdown: CancellationToken::new(),
        })
    }

    #[test]
    fn test_handler_creation() {
        let peer: SocketAddr = "127.0.0.1:40000".parse().unwrap();
        let first = SshHandler::new(Some(peer), context());
        let second = SshHandler::new(None, context());

        assert_eq!(first.peer_addr(), Some(peer));
        assert!(!first.is_authenticated());
        assert!(first.username().is_none());
        assert_ne!(first.session_id(), second.session_id());
    }

    #[test]
    fn test_unknown_key_is_not_authorized() {
        let handler = SshHandler::new(None, context());
        let key = crate::server::identity::parse_authorized_key(
            "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIAECAwQFBgcICQoLDA0ODxAREhMUFRYXGBkaGxwdHh8g",
        )
        .unwrap();
        assert!(handler.authorize("db1", &key).is_none());
    }

    #[test]
    fn test_client_reply_expectations() {
        for kind in ["pty-req", "shell", "exec", "subsystem"] {
            assert!(client_wants_reply(kind), "{kind}");
        }
        for kind in ["env", "window-change", "signal", "x11-req"] {
            assert!(!client_wants_reply(kind), "{kind}");
        }
    }

    #[tokio::test]
    async fn test_one_queued_answer_per_reply_wanting_request() {
        let (requests, mut request_rx) = mpsc::channel(CHANNEL_QUEUE_DEPTH);
        let (replies, mut reply_rx) = mpsc::unbounded_channel();
        let slot = ChannelSlot { requests, replies };

        let pty = PtyRequest {
            term: "xterm".to_string(),
            size: WindowSize {
                cols: 80,
                rows: 24,
                width_px: 0,
                height_px: 0,
            },
            modes: Vec::new(),
        };
        let sequence = [
            ChannelRequest::pty(client_wants_reply("pty-req"), &pty),
            ChannelRequest::env(client_wants_reply("env"), "LANG", "C.UTF-8"),
            ChannelRequest::shell(client_wants_reply("shell")),
        ];
        for request in sequence {
            let incoming = slot.admit(request);
            slot.requests.send(incoming).await.unwrap();
        }

        let pty_answer = reply_rx.try_recv().unwrap();
        let shell_answer = reply_rx.try_recv().unwrap();
        assert!(reply_rx.try_recv().is_err());

        let (pty_request, pty_responder) = request_rx.recv().await.unwrap().into_parts();
        let (env_request, env_responder) = request_rx.recv().await.unwrap().into_parts();
        let (shell_request, shell_responder) = request_rx.recv().await.unwrap().into_parts();
        assert_eq!(pty_request.kind, "pty-req");
        assert_eq!(env_request.kind, "env");
        assert!(!env_request.want_reply);
        assert_eq!(shell_request.kind, "shell");

        // The backend refuses env; nothing reaches the client for it.
        pty_responder.reply(true).unwrap();
        env_responder.reply(false).unwrap();
        shell_responder.reply(true).unwrap();

        assert!(pty_answer.await.unwrap());
        assert!(shell_answer.await.unwrap());
    }
}
