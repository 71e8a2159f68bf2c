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

//! Pipe engine behaviour over in-memory channel pairs.

use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use hopgate::channel::{
    memory, ChannelEnd, ChannelHandle, ChannelKind, ChannelPair, ChannelRequest, Command, Frame,
    TunnelEndpoints,
};
use hopgate::pipe::{self, run_with_sink, PipeContext};
use hopgate::recorder::ttyrec::decode_frames;
use hopgate::recorder::RecordingSink;
use hopgate::shared::{BastionError, SessionId};
use tokio::sync::mpsc;

#[derive(Default)]
struct MemorySink {
    records: Mutex<Vec<(Option<String>, Vec<u8>)>>,
}

impl MemorySink {
    fn records(&self) -> Vec<(Option<String>, Vec<u8>)> {
        self.records.lock().unwrap().clone()
    }
}

#[async_trait]
impl RecordingSink for MemorySink {
    async fn record(&self, label: Option<&str>, data: &[u8]) -> io::Result<()> {
        self.records
            .lock()
            .unwrap()
            .push((label.map(str::to_string), data.to_vec()));
        Ok(())
    }
}

/// A remote end whose streams and commands the test drives directly.
struct ScriptedEnd {
    commands: mpsc::Receiver<Command>,
    frames: Option<mpsc::Sender<Frame>>,
    requests: Option<mpsc::Sender<hopgate::channel::IncomingRequest>>,
}

fn scripted_end() -> (ChannelEnd, ScriptedEnd) {
    let (command_tx, commands) = mpsc::channel(16);
    let (frame_tx, frames) = mpsc::channel(16);
    let (request_tx, requests) = mpsc::channel(16);
    (
        ChannelEnd {
            frames,
            requests,
            handle: ChannelHandle::new(command_tx),
        },
        ScriptedEnd {
            commands,
            frames: Some(frame_tx),
            requests: Some(request_tx),
        },
    )
}

fn spawn_pipe(
    pair: ChannelPair,
    kind: ChannelKind,
    sink: Arc<MemorySink>,
) -> tokio::task::JoinHandle<Result<(), BastionError>> {
    tokio::spawn(async move { run_with_sink(pair, &kind, sink).await })
}

#[tokio::test]
async fn test_session_pipe_copies_both_directions() {
    let (mut client, local) = memory::pair();
    let (remote, mut backend) = memory::pair();
    let sink = Arc::new(MemorySink::default());
    let pipe = spawn_pipe(ChannelPair { local, remote }, ChannelKind::Session, sink.clone());

    client.handle.data(Bytes::from_static(b"whoami\n")).await.unwrap();
    assert_eq!(
        backend.frames.recv().await,
        Some(Frame::Data(Bytes::from_static(b"whoami\n")))
    );

    backend.handle.data(Bytes::from_static(b"root\n")).await.unwrap();
    backend
        .handle
        .extended_data(1, Bytes::from_static(b"warning\n"))
        .await
        .unwrap();
    assert_eq!(
        client.frames.recv().await,
        Some(Frame::Data(Bytes::from_static(b"root\n")))
    );
    assert_eq!(
        client.frames.recv().await,
        Some(Frame::Extended(1, Bytes::from_static(b"warning\n")))
    );

    backend.handle.close().await.unwrap();
    pipe.await.unwrap().unwrap();
    assert_eq!(client.frames.recv().await, None);

    // Only server output is recorded for sessions.
    let records = sink.records();
    assert_eq!(
        records,
        vec![(None, b"root\n".to_vec()), (None, b"warning\n".to_vec())]
    );
}

#[tokio::test]
async fn test_requests_and_replies_are_forwarded() {
    let (mut client, local) = memory::pair();
    let (remote, mut backend) = memory::pair();
    let sink = Arc::new(MemorySink::default());
    let pipe = spawn_pipe(ChannelPair { local, remote }, ChannelKind::Session, sink.clone());

    let exec = {
        let handle = client.handle.clone();
        tokio::spawn(
            async move { handle.send_request(ChannelRequest::exec(true, b"ls -la")).await },
        )
    };
    let incoming = backend.requests.recv().await.unwrap();
    assert_eq!(incoming.request().kind, "exec");
    assert_eq!(incoming.request().exec_command().unwrap(), Bytes::from_static(b"ls -la"));
    let (_, responder) = incoming.into_parts();
    responder.reply(true).unwrap();
    assert_eq!(exec.await.unwrap(), Ok(true));

    let refused = {
        let handle = client.handle.clone();
        tokio::spawn(
            async move { handle.send_request(ChannelRequest::subsystem(true, "sftp")).await },
        )
    };
    let (_, responder) = backend.requests.recv().await.unwrap().into_parts();
    responder.reply(false).unwrap();
    assert_eq!(refused.await.unwrap(), Ok(false));

    backend
        .handle
        .send_request(ChannelRequest::exit_status(0))
        .await
        .unwrap();
    let exit = client.requests.recv().await.unwrap();
    assert_eq!(exit.request().kind, "exit-status");
    assert!(!exit.request().want_reply);

    backend.handle.close().await.unwrap();
    pipe.await.unwrap().unwrap();

    let records = sink.records();
    assert!(records.contains(&(None, b"ls -la\n".to_vec())));
}

#[tokio::test]
async fn test_direct_tcpip_records_both_directions_with_labels() {
    let (mut client, local) = memory::pair();
    let (remote, mut backend) = memory::pair();
    let sink = Arc::new(MemorySink::default());
    let kind = ChannelKind::DirectTcpip(TunnelEndpoints {
        destination_host: "10.0.0.8".to_string(),
        destination_port: 5432,
        source_host: "127.0.0.1".to_string(),
        source_port: 53211,
    });
    let pipe = spawn_pipe(ChannelPair { local, remote }, kind, sink.clone());

    client.handle.data(Bytes::from_static(b"SELECT 1")).await.unwrap();
    assert!(backend.frames.recv().await.is_some());
    backend.handle.data(Bytes::from_static(b"1")).await.unwrap();
    assert_eq!(
        client.frames.recv().await,
        Some(Frame::Data(Bytes::from_static(b"1")))
    );
    client.handle.close().await.unwrap();
    pipe.await.unwrap().unwrap();

    assert_eq!(
        sink.records(),
        vec![
            (Some("10.0.0.8".to_string()), b"SELECT 1".to_vec()),
            (Some("127.0.0.1".to_string()), b"1".to_vec()),
        ]
    );
}

#[tokio::test]
async fn test_local_finished_force_closes_remote_once() {
    let (client, local) = memory::pair();
    let (remote, mut scripted) = scripted_end();
    let sink = Arc::new(MemorySink::default());
    let pipe = spawn_pipe(ChannelPair { local, remote }, ChannelKind::Session, sink);

    // Ends both local streams.
    client.handle.close().await.unwrap();

    assert!(matches!(scripted.commands.recv().await, Some(Command::Eof)));
    assert!(matches!(scripted.commands.recv().await, Some(Command::Close)));

    // The remote request stream is still open, so the pipe keeps running.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!pipe.is_finished());

    scripted.frames.take();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!pipe.is_finished());

    scripted.requests.take();
    pipe.await.unwrap().unwrap();

    let mut closes = 0;
    while let Some(command) = scripted.commands.recv().await {
        if matches!(command, Command::Close) {
            closes += 1;
        }
    }
    assert_eq!(closes, 0, "remote must not be closed a second time");
}

#[tokio::test]
async fn test_forwarding_error_closes_both_sides() {
    let (mut client, local) = memory::pair();
    let (remote, scripted) = scripted_end();
    let ScriptedEnd {
        commands,
        frames: _frames,
        requests: _requests,
    } = scripted;
    // Every write to the remote now fails.
    drop(commands);

    let sink = Arc::new(MemorySink::default());
    let pipe = spawn_pipe(ChannelPair { local, remote }, ChannelKind::Session, sink);

    let answer = client
        .handle
        .send_request(ChannelRequest::shell(true))
        .await;
    assert_eq!(answer, Ok(false));

    let result = pipe.await.unwrap();
    assert!(matches!(result, Err(BastionError::Forward { .. })), "{result:?}");
    assert_eq!(client.frames.recv().await, None);
}

#[tokio::test]
async fn test_recording_open_failure_closes_both_channels() {
    let dir = tempfile::tempdir().unwrap();
    let blocker = dir.path().join("not-a-dir");
    std::fs::write(&blocker, b"x").unwrap();

    let (mut client, local) = memory::pair();
    let (remote, mut backend) = memory::pair();
    let context = PipeContext {
        recording_location: blocker,
        caller_user: "db1".to_string(),
        username: "alice".to_string(),
        session_id: SessionId::new(),
        kind: ChannelKind::Session,
    };

    let result = pipe::run(ChannelPair { local, remote }, &context).await;
    let err = result.unwrap_err();
    assert!(err.is_recording_failure(), "{err:?}");
    assert_eq!(client.frames.recv().await, None);
    assert_eq!(backend.frames.recv().await, None);
}

#[tokio::test]
async fn test_recording_file_contains_exec_command() {
    let dir = tempfile::tempdir().unwrap();
    let (mut client, local) = memory::pair();
    let (remote, mut backend) = memory::pair();
    let session_id = SessionId::new();
    let context = PipeContext {
        recording_location: dir.path().to_path_buf(),
        caller_user: "db1".to_string(),
        username: "alice".to_string(),
        session_id,
        kind: ChannelKind::Session,
    };
    let pipe =
        tokio::spawn(async move { pipe::run(ChannelPair { local, remote }, &context).await });

    let exec = {
        let handle = client.handle.clone();
        tokio::spawn(
            async move { handle.send_request(ChannelRequest::exec(true, b"ls -la")).await },
        )
    };
    let (_, responder) = backend.requests.recv().await.unwrap().into_parts();
    responder.reply(true).unwrap();
    assert_eq!(exec.await.unwrap(), Ok(true));

    backend.handle.data(Bytes::from_static(b"total 0\n")).await.unwrap();
    assert!(client.frames.recv().await.is_some());
    backend.handle.close().await.unwrap();
    pipe.await.unwrap().unwrap();

    let entries: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .collect();
    assert_eq!(entries.len(), 1);
    let name = entries[0].file_name().unwrap().to_string_lossy().to_string();
    assert!(
        name.starts_with(&format!("db1-alice-session-{session_id}-")),
        "{name}"
    );

    let contents = std::fs::read(&entries[0]).unwrap();
    let payloads: Vec<Bytes> = decode_frames(&contents)
        .into_iter()
        .map(|frame| frame.payload)
        .collect();
    assert_eq!(
        payloads,
        vec![Bytes::from_static(b"ls -la\n"), Bytes::from_static(b"total 0\n")]
    );
}
