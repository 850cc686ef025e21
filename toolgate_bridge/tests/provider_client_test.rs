//! Provider client behaviour over an in-memory transport.
//!
//! The far side of a `tokio::io::duplex` pair plays the provider, so reply
//! order and malformed output are fully under the test's control.

use futures::{SinkExt, StreamExt};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{DuplexStream, ReadHalf, WriteHalf};
use tokio_util::codec::{FramedRead, FramedWrite};
use toolgate_bridge::GatewayError;
use toolgate_bridge::ProviderClient;
use toolgate_bridge::config::DEFAULT_CALL_TIMEOUT;
use toolgate_bridge::test_utils::{Scripted, run_scripted_provider};
use toolgate_common::ProviderState;
use toolgate_common::codec::{LineCodec, LineFrame};

type ProviderHalves = (ReadHalf<DuplexStream>, WriteHalf<DuplexStream>);

fn connected_client(timeout: Duration) -> (Arc<ProviderClient>, ProviderHalves) {
    let (client_side, provider_side) = tokio::io::duplex(64 * 1024);
    let (client_read, client_write) = tokio::io::split(client_side);
    let client = ProviderClient::attach("fake", client_read, client_write, timeout);
    (Arc::new(client), tokio::io::split(provider_side))
}

#[tokio::test]
async fn concurrent_calls_each_get_their_own_reply() {
    let (client, (reader, writer)) = connected_client(Duration::from_secs(5));
    // Hold all three requests, then answer newest first.
    tokio::spawn(run_scripted_provider(reader, writer, 3, |request| {
        Scripted::Reply(json!({ "echo": request.params["n"] }))
    }));

    let (a, b, c) = tokio::join!(
        client.call("tools/echo", json!({ "n": 1 })),
        client.call("tools/echo", json!({ "n": 2 })),
        client.call("tools/echo", json!({ "n": 3 })),
    );

    assert_eq!(a.unwrap(), json!({ "echo": 1 }));
    assert_eq!(b.unwrap(), json!({ "echo": 2 }));
    assert_eq!(c.unwrap(), json!({ "echo": 3 }));
    assert_eq!(client.pending_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn unanswered_call_times_out_and_clears_its_slot() {
    let (client, (reader, writer)) = connected_client(DEFAULT_CALL_TIMEOUT);
    tokio::spawn(run_scripted_provider(reader, writer, 1, |_| Scripted::Ignore));

    let started = tokio::time::Instant::now();
    let err = client
        .call("tools/never", json!({}))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        GatewayError::Timeout { ref provider, ref method, .. }
            if provider == "fake" && method == "tools/never"
    ));
    assert!(started.elapsed() >= Duration::from_secs(30));
    assert_eq!(client.pending_count(), 0);
    assert!(client.is_ready(), "a timeout does not stop the provider");
}

#[tokio::test]
async fn provider_that_stops_reading_stdin_times_out() {
    let (client_side, provider_side) = tokio::io::duplex(1024);
    let (client_read, client_write) = tokio::io::split(client_side);
    let client = ProviderClient::attach(
        "stuck",
        client_read,
        client_write,
        Duration::from_millis(200),
    );
    // Held open but never read, so the pipe fills up.
    let _provider = provider_side;

    let big = "x".repeat(64 * 1024);
    let err = tokio::time::timeout(
        Duration::from_secs(5),
        client.call("tools/echo", json!({ "data": big })),
    )
    .await
    .expect("call blocked past its deadline")
    .unwrap_err();
    assert!(matches!(err, GatewayError::Timeout { .. }), "{err:?}");
    assert_eq!(client.pending_count(), 0);

    // The writer is released for later calls.
    let err = tokio::time::timeout(Duration::from_secs(5), client.call("ping", json!({})))
        .await
        .expect("writer still held by the first call")
        .unwrap_err();
    assert!(matches!(err, GatewayError::Timeout { .. }), "{err:?}");
    assert_eq!(client.pending_count(), 0);
}

#[tokio::test]
async fn garbage_output_is_skipped() {
    let (client, (reader, writer)) = connected_client(Duration::from_secs(5));
    tokio::spawn(run_scripted_provider(reader, writer, 1, |request| {
        Scripted::GarbageThenReply("{\"id\": oops".to_string(), request.params.clone())
    }));

    let result = client
        .call("tools/garbage", json!({ "still": "works" }))
        .await
        .unwrap();
    assert_eq!(result, json!({ "still": "works" }));
    assert!(client.is_ready());
}

#[tokio::test]
async fn replies_for_unknown_ids_do_not_resolve_anyone() {
    let (client, (reader, writer)) = connected_client(Duration::from_secs(5));
    tokio::spawn(async move {
        let mut requests = FramedRead::new(reader, LineCodec::new());
        let mut replies = FramedWrite::new(writer, LineCodec::new());
        while let Some(Ok(LineFrame::Line(line))) = requests.next().await {
            let request: serde_json::Value = serde_json::from_str(&line).unwrap();
            let id = request["id"].as_u64().unwrap();
            let stray = json!({ "protocolVersion": "2.0", "id": id + 1000, "result": "stray" });
            let both = json!({
                "protocolVersion": "2.0",
                "id": id,
                "result": 1,
                "error": { "code": 1, "message": "x" }
            });
            let real = json!({ "protocolVersion": "2.0", "id": id, "result": "real" });
            for line in [stray, both, real] {
                replies.send(line.to_string()).await.unwrap();
            }
        }
    });

    let result = client.call("tools/echo", json!({})).await.unwrap();
    assert_eq!(result, json!("real"));
}

#[tokio::test]
async fn error_replies_surface_as_execution_errors() {
    let (client, (reader, writer)) = connected_client(Duration::from_secs(5));
    tokio::spawn(run_scripted_provider(reader, writer, 1, |_| {
        Scripted::Error(-32000, "file is locked".to_string())
    }));

    let err = client.call("tools/write", json!({})).await.unwrap_err();
    match err {
        GatewayError::ExecutionError(message) => {
            assert!(message.contains("file is locked"), "{message}");
            assert!(message.contains("-32000"), "{message}");
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn provider_exit_fails_outstanding_calls() {
    let (client, (reader, writer)) = connected_client(Duration::from_secs(30));
    tokio::spawn(async move {
        let mut requests = FramedRead::new(reader, LineCodec::new());
        // Read one request, then "crash".
        let _ = requests.next().await;
        drop(requests);
        drop(writer);
    });

    let err = client.call("tools/echo", json!({})).await.unwrap_err();
    assert!(matches!(err, GatewayError::ExecutionError(_)), "{err:?}");
    assert_eq!(client.pending_count(), 0);

    client
        .lifecycle()
        .subscribe()
        .wait_for(|state| state.is_stopped())
        .await
        .unwrap();
    assert!(matches!(
        client.call("tools/echo", json!({})).await,
        Err(GatewayError::NotStarted(_))
    ));
}

#[tokio::test]
async fn stop_is_idempotent_and_fails_pending() {
    let (client, (reader, writer)) = connected_client(Duration::from_secs(30));
    tokio::spawn(run_scripted_provider(reader, writer, 1, |_| Scripted::Ignore));

    let pending = {
        let client = client.clone();
        tokio::spawn(async move { client.call("tools/never", json!({})).await })
    };
    while client.pending_count() == 0 {
        tokio::task::yield_now().await;
    }

    client.stop().await;
    client.stop().await;

    let outcome = pending.await.unwrap();
    assert!(matches!(outcome, Err(GatewayError::ExecutionError(_))));
    assert!(matches!(client.state(), ProviderState::Stopped { .. }));
    assert_eq!(client.pending_count(), 0);
}
