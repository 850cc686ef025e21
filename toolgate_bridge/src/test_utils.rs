//! Test helpers for toolgate.
//!
//! In-memory stand-ins for the pieces that normally need a real process:
//! a terminal spawner whose shells are plain buffers, and a scripted provider
//! peer that speaks the line protocol over any async stream pair.

use crate::error::{GatewayError, Result};
use crate::terminal::{SpawnRequest, TerminalProcess, TerminalSize, TerminalSpawner};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, watch};
use tokio_util::codec::{FramedRead, FramedWrite};
use toolgate_common::codec::{LineCodec, LineFrame};
use toolgate_common::protocol::{Reply, Request, RpcError};

/// Spawner producing [`FakeTerminal`]s.
#[derive(Default)]
pub struct FakeTerminalSpawner {
    terminals: Mutex<Vec<FakeTerminal>>,
    requests: Mutex<Vec<SpawnRequest>>,
    fail_next: AtomicBool,
}

impl FakeTerminalSpawner {
    pub fn last_request(&self) -> Option<SpawnRequest> {
        self.requests.lock().ok()?.last().cloned()
    }

    /// Every terminal spawned so far, oldest first.
    pub fn terminals(&self) -> Vec<FakeTerminal> {
        self.terminals
            .lock()
            .map(|t| t.clone())
            .unwrap_or_default()
    }

    pub fn fail_next_spawn(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }
}

impl TerminalSpawner for FakeTerminalSpawner {
    fn spawn(&self, request: SpawnRequest) -> Result<Box<dyn TerminalProcess>> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(GatewayError::ExecutionError(format!(
                "cannot start {}",
                request.shell
            )));
        }
        let terminal = FakeTerminal::new(request.size);
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request);
        }
        if let Ok(mut terminals) = self.terminals.lock() {
            terminals.push(terminal.clone());
        }
        Ok(Box::new(terminal))
    }
}

/// A "shell" that echoes its input back as output, like a terminal in
/// cooked mode with echo on.
#[derive(Clone)]
pub struct FakeTerminal {
    state: Arc<FakeState>,
}

struct FakeState {
    output: broadcast::Sender<Bytes>,
    exited: watch::Sender<bool>,
    input: Mutex<Vec<u8>>,
    size: Mutex<TerminalSize>,
    killed: AtomicBool,
    busy_writes: AtomicUsize,
}

impl FakeTerminal {
    pub fn new(size: TerminalSize) -> Self {
        let (output, _) = broadcast::channel(256);
        let (exited, _) = watch::channel(false);
        Self {
            state: Arc::new(FakeState {
                output,
                exited,
                input: Mutex::new(Vec::new()),
                size: Mutex::new(size),
                killed: AtomicBool::new(false),
                busy_writes: AtomicUsize::new(0),
            }),
        }
    }

    /// Publishes output as if the shell had printed it.
    pub fn emit(&self, data: &[u8]) {
        let _ = self.state.output.send(Bytes::copy_from_slice(data));
    }

    /// Simulates the shell exiting on its own.
    pub fn exit(&self) {
        self.state.exited.send_replace(true);
    }

    pub fn input(&self) -> Vec<u8> {
        self.state
            .input
            .lock()
            .map(|i| i.clone())
            .unwrap_or_default()
    }

    pub fn size(&self) -> TerminalSize {
        self.state
            .size
            .lock()
            .map(|s| *s)
            .unwrap_or_default()
    }

    pub fn is_killed(&self) -> bool {
        self.state.killed.load(Ordering::SeqCst)
    }

    /// Rejects the next `count` writes with `TerminalBusy`, like a shell whose
    /// input queue is full.
    pub fn refuse_writes(&self, count: usize) {
        self.state.busy_writes.store(count, Ordering::SeqCst);
    }
}

impl TerminalProcess for FakeTerminal {
    fn write(&self, data: &[u8]) -> Result<()> {
        if self.is_killed() || *self.state.exited.borrow() {
            return Err(GatewayError::ExecutionError("terminal has exited".into()));
        }
        let busy = self
            .state
            .busy_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if busy.is_ok() {
            return Err(GatewayError::TerminalBusy("fake input queue is full".into()));
        }
        if let Ok(mut input) = self.state.input.lock() {
            input.extend_from_slice(data);
        }
        self.emit(data);
        Ok(())
    }

    fn resize(&self, size: TerminalSize) -> Result<()> {
        if let Ok(mut current) = self.state.size.lock() {
            *current = size;
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<Bytes> {
        self.state.output.subscribe()
    }

    fn exited(&self) -> watch::Receiver<bool> {
        self.state.exited.subscribe()
    }

    fn kill(&self) {
        self.state.killed.store(true, Ordering::SeqCst);
        self.state.exited.send_replace(true);
    }
}

/// How a scripted provider answers one request.
pub enum Scripted {
    Reply(Value),
    Error(i64, String),
    /// Emit a raw line verbatim, then reply with the value
    GarbageThenReply(String, Value),
    Ignore,
}

/// Runs a provider peer on the far side of an in-memory transport.
///
/// Requests are collected until `batch` of them have arrived, then answered
/// in reverse arrival order using `answer`. Returns when the client closes
/// its side.
pub async fn run_scripted_provider<R, W, F>(reader: R, writer: W, batch: usize, answer: F)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    F: Fn(&Request) -> Scripted,
{
    let mut requests = FramedRead::new(reader, LineCodec::new());
    let mut replies = FramedWrite::new(writer, LineCodec::new());
    let mut held: Vec<Request> = Vec::new();

    while let Some(Ok(frame)) = requests.next().await {
        let LineFrame::Line(line) = frame else {
            continue;
        };
        let Ok(request) = serde_json::from_str::<Request>(&line) else {
            continue;
        };
        held.push(request);
        if held.len() < batch.max(1) {
            continue;
        }

        for request in held.drain(..).rev() {
            let reply = match answer(&request) {
                Scripted::Reply(value) => Reply::success(request.id, value),
                Scripted::Error(code, message) => {
                    Reply::failure(request.id, RpcError::new(code, message))
                }
                Scripted::GarbageThenReply(garbage, value) => {
                    if replies.send(garbage).await.is_err() {
                        return;
                    }
                    Reply::success(request.id, value)
                }
                Scripted::Ignore => continue,
            };
            let Ok(line) = reply.to_line() else {
                continue;
            };
            if replies.send(line).await.is_err() {
                return;
            }
        }
    }
}
