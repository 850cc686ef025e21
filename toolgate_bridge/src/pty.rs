//! Native pseudo-terminal shells via `portable-pty`.
//!
//! Reads from the PTY master happen on a blocking task and are published to a
//! broadcast channel; writes are queued on an mpsc channel and flushed on the
//! blocking pool; a third blocking task reaps the shell.

use crate::error::{GatewayError, Result};
use crate::terminal::{SpawnRequest, TerminalProcess, TerminalSize, TerminalSpawner};
use bytes::Bytes;
use portable_pty::{ChildKiller, CommandBuilder, MasterPty, PtySize, native_pty_system};
use std::io::{ErrorKind, Read, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, warn};

const OUTPUT_CHANNEL_CAPACITY: usize = 1024;
const INPUT_CHANNEL_CAPACITY: usize = 256;
const READ_BUFFER_SIZE: usize = 8192;

#[derive(Debug, Default, Clone, Copy)]
pub struct NativePtySpawner;

fn pty_size(size: TerminalSize) -> PtySize {
    PtySize {
        rows: size.rows,
        cols: size.cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

fn pty_error(context: &str, e: impl std::fmt::Display) -> GatewayError {
    GatewayError::ExecutionError(format!("{context}: {e}"))
}

impl TerminalSpawner for NativePtySpawner {
    fn spawn(&self, request: SpawnRequest) -> Result<Box<dyn TerminalProcess>> {
        let pair = native_pty_system()
            .openpty(pty_size(request.size))
            .map_err(|e| pty_error("failed to open pty", e))?;

        let mut command = CommandBuilder::new(&request.shell);
        command.cwd(&request.working_dir);
        for (key, value) in &request.env {
            command.env(key, value);
        }

        let mut child = pair
            .slave
            .spawn_command(command)
            .map_err(|e| pty_error(&format!("failed to start {}", request.shell), e))?;
        // The master must see EOF once the shell exits.
        drop(pair.slave);

        let killer = child.clone_killer();
        let mut reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| pty_error("failed to read pty", e))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| pty_error("failed to write pty", e))?;

        let (output, _) = broadcast::channel::<Bytes>(OUTPUT_CHANNEL_CAPACITY);
        let (exit_tx, exited) = watch::channel(false);
        let exit_tx = Arc::new(exit_tx);

        let reader_output = output.clone();
        let reader_exit = exit_tx.clone();
        tokio::task::spawn_blocking(move || {
            let mut buf = [0u8; READ_BUFFER_SIZE];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        // No subscribers is fine; output is not retained.
                        let _ = reader_output.send(Bytes::copy_from_slice(&buf[..n]));
                    }
                    Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
                    Err(ref e) if e.kind() == ErrorKind::WouldBlock => {
                        std::thread::sleep(Duration::from_millis(5));
                        continue;
                    }
                    Err(e) => {
                        debug!("pty read ended: {}", e);
                        break;
                    }
                }
            }
            reader_exit.send_replace(true);
        });

        let (input, mut input_rx) = mpsc::channel::<Vec<u8>>(INPUT_CHANNEL_CAPACITY);
        let writer = Arc::new(Mutex::new(writer));
        tokio::spawn(async move {
            while let Some(bytes) = input_rx.recv().await {
                let writer = writer.clone();
                let written = tokio::task::spawn_blocking(move || {
                    let mut guard = writer
                        .lock()
                        .map_err(|_| std::io::Error::other("pty writer poisoned"))?;
                    guard.write_all(&bytes)?;
                    guard.flush()
                })
                .await;
                if !matches!(written, Ok(Ok(()))) {
                    warn!("pty write failed - closing terminal input");
                    break;
                }
            }
        });

        let shell = request.shell.clone();
        tokio::task::spawn_blocking(move || {
            match child.wait() {
                Ok(status) => debug!(shell = %shell, code = status.exit_code(), "Shell exited"),
                Err(e) => warn!(shell = %shell, "Failed to wait for shell: {}", e),
            }
            exit_tx.send_replace(true);
        });

        Ok(Box::new(NativePty {
            master: Mutex::new(pair.master),
            killer: Mutex::new(killer),
            input,
            output,
            exited,
        }))
    }
}

struct NativePty {
    master: Mutex<Box<dyn MasterPty + Send>>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
    input: mpsc::Sender<Vec<u8>>,
    output: broadcast::Sender<Bytes>,
    exited: watch::Receiver<bool>,
}

impl TerminalProcess for NativePty {
    fn write(&self, data: &[u8]) -> Result<()> {
        self.input.try_send(data.to_vec()).map_err(|e| match e {
            TrySendError::Full(_) => GatewayError::TerminalBusy("input queue is full".into()),
            TrySendError::Closed(_) => pty_error("terminal input unavailable", "closed"),
        })
    }

    fn resize(&self, size: TerminalSize) -> Result<()> {
        let master = self
            .master
            .lock()
            .map_err(|_| GatewayError::ExecutionError("pty master poisoned".into()))?;
        master
            .resize(pty_size(size))
            .map_err(|e| pty_error("failed to resize pty", e))
    }

    fn subscribe(&self) -> broadcast::Receiver<Bytes> {
        self.output.subscribe()
    }

    fn exited(&self) -> watch::Receiver<bool> {
        self.exited.clone()
    }

    fn kill(&self) {
        if *self.exited.borrow() {
            return;
        }
        if let Ok(mut killer) = self.killer.lock()
            && let Err(e) = killer.kill()
        {
            debug!("Shell kill failed (already exited?): {}", e);
        }
    }
}
