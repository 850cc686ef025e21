//! Error types for the gateway

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Path '{}' is outside the allowed directories", path.display())]
    PathNotAllowed { path: PathBuf },

    #[error("Provider not found: {0}")]
    ProviderNotFound(String),

    #[error("Provider '{0}' is not started")]
    NotStarted(String),

    #[error("Execution error: {0}")]
    ExecutionError(String),

    #[error("Provider '{provider}' did not reply to '{method}' within {}s", timeout.as_secs())]
    Timeout {
        provider: String,
        method: String,
        timeout: Duration,
    },

    #[error("Terminal session not found: {0}")]
    TerminalNotFound(String),

    #[error("Terminal '{0}' is not accepting input")]
    TerminalBusy(String),

    #[error("Terminal capacity exceeded (limit {limit})")]
    CapacityExceeded { limit: usize },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP server error: {0}")]
    HttpServer(String),
}

/// Stable error kinds reported in the response envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorKind {
    PathNotAllowed,
    ProviderNotFound,
    NotStarted,
    ExecutionError,
    Timeout,
    TerminalNotFound,
    TerminalBusy,
    CapacityExceeded,
    Internal,
}

impl GatewayError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            GatewayError::PathNotAllowed { .. } => ErrorKind::PathNotAllowed,
            GatewayError::ProviderNotFound(_) => ErrorKind::ProviderNotFound,
            GatewayError::NotStarted(_) => ErrorKind::NotStarted,
            GatewayError::ExecutionError(_) => ErrorKind::ExecutionError,
            GatewayError::Timeout { .. } => ErrorKind::Timeout,
            GatewayError::TerminalNotFound(_) => ErrorKind::TerminalNotFound,
            GatewayError::TerminalBusy(_) => ErrorKind::TerminalBusy,
            GatewayError::CapacityExceeded { .. } => ErrorKind::CapacityExceeded,
            GatewayError::Config(_)
            | GatewayError::Io(_)
            | GatewayError::Json(_)
            | GatewayError::HttpServer(_) => ErrorKind::Internal,
        }
    }

    pub fn status(&self) -> StatusCode {
        match self.kind() {
            ErrorKind::PathNotAllowed => StatusCode::FORBIDDEN,
            ErrorKind::ProviderNotFound => StatusCode::NOT_FOUND,
            ErrorKind::NotStarted => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::ExecutionError => StatusCode::BAD_GATEWAY,
            ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorKind::TerminalNotFound => StatusCode::NOT_FOUND,
            ErrorKind::TerminalBusy => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::CapacityExceeded => StatusCode::TOO_MANY_REQUESTS,
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "ok": false,
            "error": {
                "kind": self.kind(),
                "message": self.to_string(),
            }
        });
        (self.status(), Json(body)).into_response()
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_map_to_distinct_statuses() {
        let cases = [
            (
                GatewayError::PathNotAllowed {
                    path: PathBuf::from("/etc"),
                },
                StatusCode::FORBIDDEN,
            ),
            (
                GatewayError::ProviderNotFound("git".into()),
                StatusCode::NOT_FOUND,
            ),
            (
                GatewayError::NotStarted("git".into()),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                GatewayError::ExecutionError("crashed".into()),
                StatusCode::BAD_GATEWAY,
            ),
            (
                GatewayError::Timeout {
                    provider: "git".into(),
                    method: "status".into(),
                    timeout: Duration::from_secs(30),
                },
                StatusCode::GATEWAY_TIMEOUT,
            ),
            (
                GatewayError::TerminalNotFound("abc".into()),
                StatusCode::NOT_FOUND,
            ),
            (
                GatewayError::TerminalBusy("abc".into()),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                GatewayError::CapacityExceeded { limit: 10 },
                StatusCode::TOO_MANY_REQUESTS,
            ),
        ];
        for (error, status) in cases {
            assert_eq!(error.status(), status, "{error}");
        }
    }

    #[test]
    fn timeout_message_names_provider_and_method() {
        let error = GatewayError::Timeout {
            provider: "fs".into(),
            method: "tools/read".into(),
            timeout: Duration::from_secs(30),
        };
        assert_eq!(
            error.to_string(),
            "Provider 'fs' did not reply to 'tools/read' within 30s"
        );
    }

    #[tokio::test]
    async fn response_envelope_carries_kind() {
        let response = GatewayError::CapacityExceeded { limit: 10 }.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        let body = axum::body::to_bytes(response.into_body(), 1024)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["ok"], false);
        assert_eq!(json["error"]["kind"], "CapacityExceeded");
    }
}
