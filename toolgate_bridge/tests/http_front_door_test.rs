//! Router-level tests: status codes, envelopes and route wiring.

mod common;

use axum::Router;
use axum::body::Body;
use axum::http::{Method, Request, StatusCode, header};
use common::{fake_gateway, gateway_config};
use serde_json::{Value, json};
use std::sync::Arc;
use tempfile::TempDir;
use tower::ServiceExt;
use toolgate_bridge::test_utils::FakeTerminalSpawner;
use toolgate_bridge::{Gateway, TerminalPoolConfig, build_router};

async fn send(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let mut request = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(json) => {
            request = request.header(header::CONTENT_TYPE, "application/json");
            Body::from(json.to_string())
        }
        None => Body::empty(),
    };
    let response = app
        .clone()
        .oneshot(request.body(body).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, json)
}

#[tokio::test]
async fn health_reports_ok() {
    let dir = TempDir::new().unwrap();
    let (gateway, _) = fake_gateway(gateway_config(dir.path()));
    let app = build_router(gateway);

    let (status, body) = send(&app, Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ok"], true);
    assert_eq!(body["result"]["status"], "ok");
}

#[tokio::test]
async fn tool_calls_are_forwarded_to_providers() {
    let dir = TempDir::new().unwrap();
    let (gateway, _) = fake_gateway(gateway_config(dir.path()));
    let app = build_router(gateway.clone());

    let (status, body) = send(
        &app,
        Method::POST,
        "/tools/call",
        Some(json!({ "provider": "echo", "method": "tools/echo", "params": { "x": 1 } })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body, json!({ "ok": true, "result": { "x": 1 } }));

    let (status, body) = send(&app, Method::GET, "/providers", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["result"][0]["name"], "echo");
    assert_eq!(body["result"][0]["state"], "ready");

    gateway.shutdown().await;
}

#[tokio::test]
async fn tool_call_errors_map_to_status_codes() {
    let dir = TempDir::new().unwrap();
    let (gateway, _) = fake_gateway(gateway_config(dir.path()));
    let app = build_router(gateway.clone());

    let (status, body) = send(
        &app,
        Method::POST,
        "/tools/call",
        Some(json!({ "provider": "nope", "method": "tools/echo" })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["ok"], false);
    assert_eq!(body["error"]["kind"], "ProviderNotFound");

    let (status, body) = send(
        &app,
        Method::POST,
        "/tools/call",
        Some(json!({ "provider": "echo", "method": "tools/fail" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(body["error"]["kind"], "ExecutionError");

    gateway.shutdown().await;
}

#[tokio::test]
async fn terminal_lifecycle_over_http() {
    let dir = TempDir::new().unwrap();
    let (gateway, spawner) = fake_gateway(gateway_config(dir.path()));
    let app = build_router(gateway);

    let (status, body) = send(
        &app,
        Method::POST,
        "/terminals",
        Some(json!({ "name": "dev", "cols": 100, "rows": 30 })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["result"]["name"], "dev");
    let id = body["result"]["id"].as_str().unwrap().to_string();

    let (status, body) = send(&app, Method::GET, "/terminals", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["result"][0]["id"], id);
    assert!(body["result"][0]["createdAt"].is_string());

    let (status, _) = send(
        &app,
        Method::POST,
        &format!("/terminals/{id}/input"),
        Some(json!({ "data": "pwd\r" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(spawner.terminals()[0].input(), b"pwd\r");

    let (status, body) = send(
        &app,
        Method::POST,
        &format!("/terminals/{id}/resize"),
        Some(json!({ "cols": 120, "rows": 40 })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["result"], json!({ "cols": 120, "rows": 40 }));

    let (status, _) = send(&app, Method::DELETE, &format!("/terminals/{id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    let (status, body) = send(&app, Method::DELETE, &format!("/terminals/{id}"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["kind"], "TerminalNotFound");
}

#[tokio::test]
async fn create_without_body_uses_defaults() {
    let dir = TempDir::new().unwrap();
    let (gateway, spawner) = fake_gateway(gateway_config(dir.path()));
    let app = build_router(gateway);

    let (status, body) = send(&app, Method::POST, "/terminals", None).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["result"]["name"], "terminal-1");
    assert_eq!(spawner.terminals()[0].size().cols, 80);
}

#[tokio::test]
async fn unknown_terminals_are_not_found() {
    let dir = TempDir::new().unwrap();
    let (gateway, _) = fake_gateway(gateway_config(dir.path()));
    let app = build_router(gateway);

    for (method, uri, body) in [
        (Method::POST, "/terminals/missing/input", Some(json!({ "data": "x" }))),
        (Method::POST, "/terminals/missing/resize", Some(json!({ "cols": 1, "rows": 1 }))),
        (Method::GET, "/terminals/missing/ws", None),
    ] {
        let (status, body) = send(&app, method, uri, body).await;
        assert_eq!(status, StatusCode::NOT_FOUND, "{uri}");
        assert_eq!(body["error"]["kind"], "TerminalNotFound", "{uri}");
    }
}

#[tokio::test(start_paused = true)]
async fn backed_up_terminal_is_unavailable_not_missing() {
    let dir = TempDir::new().unwrap();
    let (gateway, spawner) = fake_gateway(gateway_config(dir.path()));
    let app = build_router(gateway.clone());

    let (_, body) = send(&app, Method::POST, "/terminals", None).await;
    let id = body["result"]["id"].as_str().unwrap().to_string();
    spawner.terminals()[0].refuse_writes(usize::MAX);

    let (status, body) = send(
        &app,
        Method::POST,
        &format!("/terminals/{id}/input"),
        Some(json!({ "data": "x" })),
    )
    .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"]["kind"], "TerminalBusy");
    assert!(gateway.terminals().get(&id).is_some());
}

#[tokio::test]
async fn session_cap_maps_to_too_many_requests() {
    let dir = TempDir::new().unwrap();
    let config = gateway_config(dir.path());
    let pool_config = TerminalPoolConfig {
        max_sessions: 1,
        ..TerminalPoolConfig::new("/bin/sh", config.project_dir.clone())
    };
    let gateway = Arc::new(Gateway::with_pool_config(
        config,
        pool_config,
        Arc::new(FakeTerminalSpawner::default()),
    ));
    let app = build_router(gateway);

    let (status, _) = send(&app, Method::POST, "/terminals", None).await;
    assert_eq!(status, StatusCode::CREATED);
    let (status, body) = send(&app, Method::POST, "/terminals", None).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["error"]["kind"], "CapacityExceeded");
}

#[tokio::test]
async fn shutdown_disposes_terminals() {
    let dir = TempDir::new().unwrap();
    let (gateway, spawner) = fake_gateway(gateway_config(dir.path()));
    let app = build_router(gateway.clone());
    send(&app, Method::POST, "/terminals", None).await;
    send(&app, Method::POST, "/terminals", None).await;

    gateway.shutdown().await;
    assert!(gateway.terminals().is_empty());
    assert!(spawner.terminals().iter().all(|t| t.is_killed()));
}
