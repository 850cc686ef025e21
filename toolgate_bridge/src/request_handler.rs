//! HTTP and WebSocket handlers.
//!
//! Successful responses use the envelope `{"ok": true, "result": ...}`; failures
//! are rendered by [`GatewayError`]'s `IntoResponse` impl.

use crate::duplex;
use crate::error::{GatewayError, Result};
use crate::gateway::Gateway;
use crate::terminal::CreateTerminal;
use axum::{
    Json,
    extract::{
        Path, State,
        ws::{WebSocketUpgrade, rejection::WebSocketUpgradeRejection},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::debug;

pub type SharedGateway = Arc<Gateway>;

fn ok(result: Value) -> Json<Value> {
    Json(json!({ "ok": true, "result": result }))
}

fn ok_with_status(status: StatusCode, result: Value) -> Response {
    (status, ok(result)).into_response()
}

fn default_params() -> Value {
    Value::Object(Default::default())
}

#[derive(Debug, Deserialize)]
pub struct ToolCall {
    pub provider: String,
    pub method: String,
    #[serde(default = "default_params")]
    pub params: Value,
}

#[derive(Debug, Deserialize)]
pub struct TerminalInput {
    pub data: String,
}

#[derive(Debug, Deserialize)]
pub struct TerminalResize {
    pub cols: u16,
    pub rows: u16,
}

pub async fn health_check(State(gateway): State<SharedGateway>) -> Json<Value> {
    ok(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "providers": gateway.registry().providers().len(),
        "terminals": gateway.terminals().len(),
    }))
}

pub async fn list_providers(State(gateway): State<SharedGateway>) -> Result<Json<Value>> {
    Ok(ok(serde_json::to_value(gateway.registry().providers())?))
}

pub async fn call_tool(
    State(gateway): State<SharedGateway>,
    Json(call): Json<ToolCall>,
) -> Result<Json<Value>> {
    debug!(provider = %call.provider, method = %call.method, "Tool call");
    let result = gateway
        .call_tool(&call.provider, &call.method, call.params)
        .await?;
    Ok(ok(result))
}

pub async fn list_terminals(State(gateway): State<SharedGateway>) -> Result<Json<Value>> {
    Ok(ok(serde_json::to_value(gateway.terminals().list())?))
}

pub async fn create_terminal(
    State(gateway): State<SharedGateway>,
    body: Option<Json<CreateTerminal>>,
) -> Result<Response> {
    let options = body.map(|Json(options)| options).unwrap_or_default();
    let info = gateway.terminals().create(options)?;
    Ok(ok_with_status(
        StatusCode::CREATED,
        json!({ "id": info.id, "name": info.name }),
    ))
}

pub async fn delete_terminal(
    State(gateway): State<SharedGateway>,
    Path(id): Path<String>,
) -> Result<Json<Value>> {
    if gateway.terminals().dispose(&id) {
        Ok(ok(json!({ "id": id, "disposed": true })))
    } else {
        Err(GatewayError::TerminalNotFound(id))
    }
}

pub async fn write_terminal(
    State(gateway): State<SharedGateway>,
    Path(id): Path<String>,
    Json(input): Json<TerminalInput>,
) -> Result<Json<Value>> {
    gateway
        .terminals()
        .write_input(&id, input.data.as_bytes())
        .await?;
    Ok(ok(json!({ "written": input.data.len() })))
}

pub async fn resize_terminal(
    State(gateway): State<SharedGateway>,
    Path(id): Path<String>,
    Json(size): Json<TerminalResize>,
) -> Result<Json<Value>> {
    if gateway.terminals().resize(&id, size.cols, size.rows) {
        Ok(ok(json!({ "cols": size.cols, "rows": size.rows })))
    } else {
        Err(GatewayError::TerminalNotFound(id))
    }
}

/// Upgrades to a WebSocket bridged to the terminal. Unknown ids are rejected
/// before the upgrade.
pub async fn terminal_socket(
    State(gateway): State<SharedGateway>,
    Path(id): Path<String>,
    upgrade: std::result::Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let Some(session) = gateway.terminals().get(&id) else {
        return GatewayError::TerminalNotFound(id).into_response();
    };
    let upgrade = match upgrade {
        Ok(upgrade) => upgrade,
        Err(rejection) => return rejection.into_response(),
    };

    let pool = gateway.terminals().clone();
    upgrade.on_upgrade(move |socket| async move {
        let (sink, stream) = socket.split();
        duplex::bridge_session(session, pool, sink, stream).await;
    })
}
