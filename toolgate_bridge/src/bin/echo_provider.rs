//! Reference provider speaking the toolgate line protocol.
//!
//! Handles each request on its own task, so slow methods reply after fast
//! ones. Methods:
//!
//! | method          | behaviour                                          |
//! |-----------------|----------------------------------------------------|
//! | `ping`          | `{"pong": true}`                                   |
//! | `tools/echo`    | returns `params` unchanged                         |
//! | `tools/env`     | returns the `TOOLGATE_*` environment it was given  |
//! | `tools/sleep`   | waits `params.ms` milliseconds, then replies       |
//! | `tools/garbage` | prints a non-JSON line, then echoes `params`       |
//! | `tools/fail`    | replies with an error                              |
//! | `tools/never`   | never replies                                      |
//! | `tools/exit`    | exits with `params.code` without replying          |

use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use toolgate_common::codec::{LineCodec, LineFrame};
use toolgate_common::protocol::{Reply, Request, RpcError, codes};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();

    let writer = tokio::spawn(async move {
        let mut stdout = FramedWrite::new(tokio::io::stdout(), LineCodec::new());
        while let Some(line) = out_rx.recv().await {
            if stdout.send(line).await.is_err() {
                break;
            }
        }
    });

    eprintln!("echo provider ready (pid {})", std::process::id());

    let mut stdin = FramedRead::new(tokio::io::stdin(), LineCodec::new());
    while let Some(frame) = stdin.next().await {
        let line = match frame {
            Ok(LineFrame::Line(line)) => line,
            Ok(LineFrame::Invalid { reason, .. }) => {
                eprintln!("ignoring input: {reason}");
                continue;
            }
            Err(e) => {
                eprintln!("stdin failed: {e}");
                break;
            }
        };

        let request: Request = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(e) => {
                eprintln!("ignoring malformed request: {e}");
                continue;
            }
        };

        let out = out_tx.clone();
        tokio::spawn(async move {
            for line in handle(request).await {
                let _ = out.send(line);
            }
        });
    }

    drop(out_tx);
    let _ = writer.await;
    Ok(())
}

/// Lines to print in answer to one request.
async fn handle(request: Request) -> Vec<String> {
    let id = request.id;
    let params = request.params;
    let reply = match request.method.as_str() {
        "ping" => Reply::success(id, json!({ "pong": true })),
        "tools/echo" => Reply::success(id, params),
        "tools/env" => {
            let env: serde_json::Map<String, Value> = std::env::vars()
                .filter(|(key, _)| key.starts_with("TOOLGATE_"))
                .map(|(key, value)| (key, Value::String(value)))
                .collect();
            Reply::success(id, Value::Object(env))
        }
        "tools/sleep" => {
            let ms = params.get("ms").and_then(Value::as_u64).unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Reply::success(id, json!({ "slept": ms }))
        }
        "tools/garbage" => {
            let mut lines = vec!["this is not json {".to_string()];
            lines.extend(Reply::success(id, params).to_line().ok());
            return lines;
        }
        "tools/fail" => Reply::failure(
            id,
            RpcError::new(
                -32000,
                params
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("requested failure"),
            ),
        ),
        "tools/never" => return Vec::new(),
        "tools/exit" => {
            let code = params.get("code").and_then(Value::as_i64).unwrap_or(0);
            std::process::exit(code as i32);
        }
        other => Reply::failure(
            id,
            RpcError::new(codes::METHOD_NOT_FOUND, format!("unknown method '{other}'")),
        ),
    };
    reply.to_line().into_iter().collect()
}
