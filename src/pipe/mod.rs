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

//! Bidirectional pipe between an inbound and an outbound channel.
//!
//! Four workers run per pipe:
//!
//! - frames local -> remote
//! - frames remote -> local
//! - requests local -> remote (replies flow back)
//! - requests remote -> local (replies flow back)
//!
//! Workers never touch shared state. They report completion on a signal
//! queue and forwarding failures on an error queue; the coordinator in
//! [`run_with_sink`] owns the [`ShutdownState`] and is the only task that
//! half-closes or closes the channels. There are no timeouts: a pipe lives
//! until both channels have finished or an error occurs.

pub mod state;

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Local;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::channel::{ChannelHandle, ChannelKind, ChannelPair, Frame, IncomingRequest};
use crate::recorder::{recording_path, FileRecorder, RecordingSink, RecordingTap};
use crate::shared::error::BastionError;
use crate::shared::session::SessionId;

pub use self::state::{PipeSignal, ShutdownActions, ShutdownState};

/// Who is on the other end of a pipe and where its recording goes.
#[derive(Debug, Clone)]
pub struct PipeContext {
    /// Directory of the last hop's recordings.
    pub recording_location: PathBuf,
    /// Login name the client used on the inbound connection.
    pub caller_user: String,
    /// Name of the authenticated identity.
    pub username: String,
    pub session_id: SessionId,
    pub kind: ChannelKind,
}

/// Open the recording for `context` and pipe `pair` until it finishes.
///
/// Both channels are closed on every return path, including a failure to
/// open the recording.
pub async fn run(pair: ChannelPair, context: &PipeContext) -> Result<(), BastionError> {
    let started_at = Local::now();
    let path = recording_path(
        &context.recording_location,
        &context.caller_user,
        &context.username,
        context.kind.type_name(),
        context.session_id,
        &started_at,
    );

    let recorder = match FileRecorder::create(&path).await {
        Ok(recorder) => recorder,
        Err(source) => {
            close_pair(&pair.local.handle, &pair.remote.handle).await;
            return Err(BastionError::Recording { path, source });
        }
    };

    info!(
        session_id = %context.session_id,
        channel_type = %context.kind,
        path = %path.display(),
        "channel is recorded"
    );

    run_with_sink(pair, &context.kind, Arc::new(recorder)).await
}

/// Pipe `pair` until it finishes, recording into `sink`.
pub async fn run_with_sink(
    pair: ChannelPair,
    kind: &ChannelKind,
    sink: Arc<dyn RecordingSink>,
) -> Result<(), BastionError> {
    let taps = Taps::for_kind(kind, sink);
    let ChannelPair { local, remote } = pair;
    let local_handle = local.handle.clone();
    let remote_handle = remote.handle.clone();

    // Exactly one signal per worker, so the queue never blocks a worker.
    let (signal_tx, mut signals) = mpsc::channel(4);
    let (error_tx, mut errors) = mpsc::unbounded_channel();

    let mut workers = JoinSet::new();
    workers.spawn(copy_frames(
        local.frames,
        remote.handle.clone(),
        taps.to_remote,
        PipeSignal::LocalDataEof,
        signal_tx.clone(),
    ));
    workers.spawn(copy_frames(
        remote.frames,
        local.handle.clone(),
        taps.to_local,
        PipeSignal::RemoteDataEof,
        signal_tx.clone(),
    ));
    workers.spawn(forward_requests(
        local.requests,
        remote.handle,
        taps.exec,
        PipeSignal::LocalRequestsDrained,
        signal_tx.clone(),
        error_tx.clone(),
    ));
    workers.spawn(forward_requests(
        remote.requests,
        local.handle,
        None,
        PipeSignal::RemoteRequestsDrained,
        signal_tx,
        error_tx,
    ));

    let mut state = ShutdownState::new();
    let result = loop {
        tokio::select! {
            biased;

            Some(error) = errors.recv() => break Err(error),
            signal = signals.recv() => {
                let Some(signal) = signal else {
                    break Err(BastionError::WorkerLost);
                };
                debug!(?signal, "pipe worker finished");

                let actions = state.apply(signal);
                apply_actions(actions, &local_handle, &remote_handle).await;
                if actions.finished {
                    break Ok(());
                }
            }
        }
    };

    if !state.local_closed() {
        close_channel(&local_handle, "local").await;
    }
    if !state.remote_closed() {
        close_channel(&remote_handle, "remote").await;
    }
    workers.shutdown().await;
    result
}

async fn apply_actions(actions: ShutdownActions, local: &ChannelHandle, remote: &ChannelHandle) {
    if actions.close_write_remote {
        if let Err(error) = remote.close_write().await {
            debug!(%error, "half-close of remote channel failed");
        }
    }
    if actions.close_write_local {
        if let Err(error) = local.close_write().await {
            debug!(%error, "half-close of local channel failed");
        }
    }
    if actions.close_remote {
        debug!("local side finished, closing remote channel");
        if let Err(error) = remote.close().await {
            warn!(%error, "failed to close remote channel");
        }
    }
    if actions.close_local {
        debug!("remote side finished, closing local channel");
        if let Err(error) = local.close().await {
            warn!(%error, "failed to close local channel");
        }
    }
}

async fn close_pair(local: &ChannelHandle, remote: &ChannelHandle) {
    close_channel(local, "local").await;
    close_channel(remote, "remote").await;
}

/// Close one end, logging instead of propagating a failure.
pub(crate) async fn close_channel(handle: &ChannelHandle, side: &str) {
    if let Err(error) = handle.close().await {
        warn!(%error, side, "failed to close channel");
    }
}

/// Recording taps for each stream of a pipe.
#[derive(Debug, Default)]
struct Taps {
    /// Frames delivered to the local end.
    to_local: Option<RecordingTap>,
    /// Frames delivered to the remote end.
    to_remote: Option<RecordingTap>,
    /// `exec` commands forwarded to the remote end.
    exec: Option<RecordingTap>,
}

impl Taps {
    fn for_kind(kind: &ChannelKind, sink: Arc<dyn RecordingSink>) -> Self {
        match kind {
            ChannelKind::Session => Self {
                to_local: Some(RecordingTap::new(Arc::clone(&sink), None)),
                to_remote: None,
                exec: Some(RecordingTap::new(sink, None)),
            },
            ChannelKind::DirectTcpip(endpoints) => Self {
                to_local: Some(RecordingTap::new(
                    Arc::clone(&sink),
                    Some(&endpoints.source_host),
                )),
                to_remote: Some(RecordingTap::new(sink, Some(&endpoints.destination_host))),
                exec: None,
            },
            ChannelKind::Other(_) => Self::default(),
        }
    }
}

/// Copy frames until the source ends or a write fails.
///
/// A failed write means the destination was closed, which is a normal way
/// for a copy to finish.
async fn copy_frames(
    mut frames: mpsc::Receiver<Frame>,
    to: ChannelHandle,
    tap: Option<RecordingTap>,
    done: PipeSignal,
    signals: mpsc::Sender<PipeSignal>,
) {
    while let Some(frame) = frames.recv().await {
        if let Some(tap) = &tap {
            if let Err(error) = tap.record(frame.payload()).await {
                warn!(%error, ?done, "recording write failed, stopping copy");
                break;
            }
        }
        if let Err(error) = to.send_frame(frame).await {
            debug!(%error, ?done, "copy stopped on write");
            break;
        }
    }
    let _ = signals.send(done).await;
}

/// Forward requests and their replies until the source request stream ends.
///
/// Failures are reported to the coordinator without stopping the loop; the
/// original request is answered `false` when forwarding failed.
async fn forward_requests(
    mut requests: mpsc::Receiver<IncomingRequest>,
    to: ChannelHandle,
    exec_tap: Option<RecordingTap>,
    done: PipeSignal,
    signals: mpsc::Sender<PipeSignal>,
    errors: mpsc::UnboundedSender<BastionError>,
) {
    while let Some(incoming) = requests.recv().await {
        let (request, responder) = incoming.into_parts();
        let kind = request.kind.clone();
        let command = exec_tap.as_ref().and_then(|_| request.exec_command());
        debug!(request = %kind, want_reply = request.want_reply, ?done, "forwarding request");

        let answer = to.send_request(request).await;

        if let (Some(tap), Some(command)) = (&exec_tap, command) {
            let mut line = command.to_vec();
            line.push(b'\n');
            if let Err(error) = tap.record(&line).await {
                warn!(%error, "failed to record exec command");
            }
        }

        // The requester is answered before a failure is reported.
        let (accepted, failure) = match answer {
            Ok(accepted) => (accepted, None),
            Err(source) => (
                false,
                Some(BastionError::Forward {
                    what: format!("{kind} request"),
                    source,
                }),
            ),
        };
        if let Err(source) = responder.reply(accepted) {
            let _ = errors.send(BastionError::Forward {
                what: format!("reply to {kind} request"),
                source,
            });
        }
        if let Some(failure) = failure {
            let _ = errors.send(failure);
        }
    }
    let _ = signals.send(done).await;
}
