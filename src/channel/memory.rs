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

//! In-process channel pairs.
//!
//! [`pair`] returns two connected [`ChannelEnd`]s: frames and requests written
//! on one appear on the other, and closing either end closes both, the same
//! way an SSH channel behaves once either side sends `CHANNEL_CLOSE`.

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use super::{ChannelEnd, ChannelHandle, Command, Frame, IncomingRequest, CHANNEL_QUEUE_DEPTH};
use crate::shared::error::ChannelError;

/// Create two connected channel ends.
pub fn pair() -> (ChannelEnd, ChannelEnd) {
    let closed = CancellationToken::new();

    let (a_commands, a_command_rx) = mpsc::channel(CHANNEL_QUEUE_DEPTH);
    let (b_commands, b_command_rx) = mpsc::channel(CHANNEL_QUEUE_DEPTH);
    let (a_frames, a_frame_rx) = mpsc::channel(CHANNEL_QUEUE_DEPTH);
    let (b_frames, b_frame_rx) = mpsc::channel(CHANNEL_QUEUE_DEPTH);
    let (a_requests, a_request_rx) = mpsc::channel(CHANNEL_QUEUE_DEPTH);
    let (b_requests, b_request_rx) = mpsc::channel(CHANNEL_QUEUE_DEPTH);

    tokio::spawn(relay(a_command_rx, b_frames, b_requests, closed.clone()));
    tokio::spawn(relay(b_command_rx, a_frames, a_requests, closed));

    (
        ChannelEnd {
            frames: a_frame_rx,
            requests: a_request_rx,
            handle: ChannelHandle::new(a_commands),
        },
        ChannelEnd {
            frames: b_frame_rx,
            requests: b_request_rx,
            handle: ChannelHandle::new(b_commands),
        },
    )
}

/// Carry one end's commands to the other end's streams.
async fn relay(
    mut commands: mpsc::Receiver<Command>,
    frames: mpsc::Sender<Frame>,
    requests: mpsc::Sender<IncomingRequest>,
    closed: CancellationToken,
) {
    let mut frames = Some(frames);

    loop {
        let command = tokio::select! {
            _ = closed.cancelled() => break,
            command = commands.recv() => command,
        };

        match command {
            Some(Command::Frame(frame)) => {
                let Some(sink) = frames.as_ref() else {
                    // Data after EOF is dropped like the SSH layer does.
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
            Some(Command::Eof) => frames = None,
            Some(Command::Request { request, reply }) => {
                let want_reply = request.want_reply;
                let (answer_tx, answer_rx) = oneshot::channel();
                let incoming = IncomingRequest::new(request, want_reply.then_some(answer_tx));

                let delivered = tokio::select! {
                    _ = closed.cancelled() => break,
                    sent = requests.send(incoming) => sent.is_ok(),
                };
                if !delivered {
                    let _ = reply.send(Err(ChannelError::Closed));
                } else if want_reply {
                    tokio::spawn(async move {
                        let answer = answer_rx.await.map_err(|_| ChannelError::Closed);
                        let _ = reply.send(answer);
                    });
                } else {
                    let _ = reply.send(Ok(false));
                }
            }
            Some(Command::Close) | None => {
                closed.cancel();
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelRequest;
    use bytes::Bytes;

    #[tokio::test]
    async fn test_frames_cross_over() {
        let (mut a, mut b) = pair();
        a.handle.data(Bytes::from_static(b"ping")).await.unwrap();
        b.handle
            .extended_data(1, Bytes::from_static(b"warn"))
            .await
            .unwrap();

        assert_eq!(
            b.frames.recv().await,
            Some(Frame::Data(Bytes::from_static(b"ping")))
        );
        assert_eq!(
            a.frames.recv().await,
            Some(Frame::Extended(1, Bytes::from_static(b"warn")))
        );
    }

    #[tokio::test]
    async fn test_eof_ends_only_one_direction() {
        let (mut a, mut b) = pair();
        a.handle.close_write().await.unwrap();
        assert_eq!(b.frames.recv().await, None);

        b.handle.data(Bytes::from_static(b"still open")).await.unwrap();
        assert!(a.frames.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_request_reply() {
        let (a, mut b) = pair();
        let sender = tokio::spawn(async move {
            a.handle
                .send_request(ChannelRequest::exec(true, b"uptime"))
                .await
        });

        let incoming = b.requests.recv().await.unwrap();
        assert_eq!(incoming.request().kind, "exec");
        let (_, responder) = incoming.into_parts();
        responder.reply(true).unwrap();

        assert_eq!(sender.await.unwrap(), Ok(true));
    }

    #[tokio::test]
    async fn test_request_without_reply() {
        let (a, mut b) = pair();
        let answer = a
            .handle
            .send_request(ChannelRequest::window_change(Default::default()))
            .await;
        assert_eq!(answer, Ok(false));
        assert_eq!(b.requests.recv().await.unwrap().request().kind, "window-change");
    }

    #[tokio::test]
    async fn test_close_ends_both_sides() {
        let (mut a, mut b) = pair();
        b.handle.close().await.unwrap();

        assert_eq!(a.frames.recv().await, None);
        assert!(a.requests.recv().await.is_none());
        assert_eq!(b.frames.recv().await, None);
        assert!(b.requests.recv().await.is_none());
        assert!(a.handle.close().await.is_ok());
    }

    #[tokio::test]
    async fn test_dropping_handles_closes() {
        let (a, mut b) = pair();
        let ChannelEnd { handle, .. } = a;
        drop(handle);
        assert!(b.requests.recv().await.is_none());
    }
}
