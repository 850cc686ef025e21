//! Pipes a terminal session to and from a WebSocket.
//!
//! Outbound: every chunk the shell prints becomes one binary frame, as soon as
//! it arrives. When the shell exits the remaining output is flushed and a
//! close frame follows.
//!
//! Inbound text frames are first tried as a control message
//! `{"type":"resize","cols":N,"rows":N}`; anything else is typed into the
//! shell verbatim. Binary frames are always typed verbatim.

use crate::error::GatewayError;
use crate::terminal::{TerminalPool, TerminalSession};
use axum::extract::ws::{CloseFrame, Message, Utf8Bytes, close_code};
use bytes::Bytes;
use futures::{Sink, SinkExt, Stream, StreamExt};
use serde::Deserialize;
use std::fmt::Display;
use std::sync::Arc;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum ControlMessage {
    Resize { cols: u16, rows: u16 },
}

/// Interpretation of an inbound text frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundText<'a> {
    Resize { cols: u16, rows: u16 },
    Input(&'a str),
}

pub fn classify_text(text: &str) -> InboundText<'_> {
    match serde_json::from_str::<ControlMessage>(text) {
        Ok(ControlMessage::Resize { cols, rows }) => InboundText::Resize { cols, rows },
        Err(_) => InboundText::Input(text),
    }
}

enum Step {
    Continue,
    Finish { close: bool },
}

/// Runs until either side goes away.
pub async fn bridge_session<S, R, E>(
    session: Arc<TerminalSession>,
    pool: TerminalPool,
    mut sink: S,
    mut stream: R,
) where
    S: Sink<Message> + Unpin,
    R: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    let id = session.id().to_string();
    let mut output = session.subscribe();
    let mut exited = session.exited();
    info!(session_id = %id, "Terminal socket attached");

    loop {
        let step = tokio::select! {
            biased;

            chunk = output.recv() => match chunk {
                Ok(bytes) => {
                    if sink.send(Message::Binary(bytes)).await.is_ok() {
                        Step::Continue
                    } else {
                        debug!(session_id = %id, "Socket gone - dropping output");
                        Step::Finish { close: false }
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(session_id = %id, skipped, "Socket fell behind terminal output");
                    Step::Continue
                }
                Err(RecvError::Closed) => Step::Finish { close: true },
            },

            inbound = stream.next() => match inbound {
                Some(Ok(message)) => handle_inbound(&pool, &id, message).await,
                Some(Err(e)) => {
                    debug!(session_id = %id, "Socket error: {}", e);
                    Step::Finish { close: false }
                }
                None => Step::Finish { close: false },
            },

            _ = shell_exited(&mut exited) => {
                flush_remaining(&mut output, &mut sink).await;
                Step::Finish { close: true }
            }
        };

        if let Step::Finish { close } = step {
            if close {
                let frame = CloseFrame {
                    code: close_code::NORMAL,
                    reason: Utf8Bytes::from_static("terminal exited"),
                };
                let _ = sink.send(Message::Close(Some(frame))).await;
            }
            break;
        }
    }

    info!(session_id = %id, "Terminal socket detached");
}

async fn handle_inbound(pool: &TerminalPool, id: &str, message: Message) -> Step {
    match message {
        Message::Text(text) => match classify_text(text.as_str()) {
            InboundText::Resize { cols, rows } => {
                if !pool.resize(id, cols, rows) {
                    debug!(session_id = %id, cols, rows, "Ignoring resize");
                }
                Step::Continue
            }
            InboundText::Input(data) => write_or_finish(pool, id, data.as_bytes()).await,
        },
        Message::Binary(data) => write_or_finish(pool, id, &data).await,
        Message::Ping(_) | Message::Pong(_) => Step::Continue,
        Message::Close(_) => Step::Finish { close: false },
    }
}

/// Waiting for a backed-up shell stops reading the socket, which pushes back
/// on the client. Input the shell never accepts is dropped; only a missing or
/// closed session ends the bridge.
async fn write_or_finish(pool: &TerminalPool, id: &str, data: &[u8]) -> Step {
    match pool.write_input(id, data).await {
        Ok(()) => Step::Continue,
        Err(GatewayError::TerminalBusy(_)) => {
            warn!(
                session_id = %id,
                bytes = data.len(),
                "Dropping input for backed-up terminal"
            );
            Step::Continue
        }
        Err(e) => {
            debug!(session_id = %id, "Terminal input closed: {}", e);
            Step::Finish { close: true }
        }
    }
}

/// Resolves once the shell has exited or its process handle is gone.
async fn shell_exited(exited: &mut watch::Receiver<bool>) {
    let _ = exited.wait_for(|done| *done).await;
}

async fn flush_remaining<S>(output: &mut broadcast::Receiver<Bytes>, sink: &mut S)
where
    S: Sink<Message> + Unpin,
{
    loop {
        match output.try_recv() {
            Ok(bytes) => {
                if sink.send(Message::Binary(bytes)).await.is_err() {
                    return;
                }
            }
            Err(TryRecvError::Lagged(_)) => continue,
            Err(TryRecvError::Empty | TryRecvError::Closed) => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resize_messages_are_recognized() {
        assert_eq!(
            classify_text(r#"{"type":"resize","cols":120,"rows":40}"#),
            InboundText::Resize { cols: 120, rows: 40 }
        );
    }

    #[test]
    fn everything_else_is_input() {
        for text in [
            "ls -la\r",
            "{\"type\":\"resize\"}",
            "{\"type\":\"input\",\"data\":\"x\"}",
            "{\"type\":\"resize\",\"cols\":-1,\"rows\":5}",
            "[1,2,3]",
            "",
        ] {
            assert_eq!(classify_text(text), InboundText::Input(text), "{text}");
        }
    }
}
