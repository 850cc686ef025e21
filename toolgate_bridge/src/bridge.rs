//! HTTP front door: router, CORS policy and the server loop.

use crate::config::GatewayConfig;
use crate::error::{GatewayError, Result};
use crate::gateway::Gateway;
use crate::request_handler::{
    SharedGateway, call_tool, create_terminal, delete_terminal, health_check, list_providers,
    list_terminals, resize_terminal, terminal_socket, write_terminal,
};
use axum::{
    Router,
    http::{HeaderValue, Method, Uri, header},
    routing::{delete, get, post},
};
use std::{net::SocketAddr, sync::Arc};
use tower_http::{
    cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer},
    trace::TraceLayer,
};
use tracing::{info, warn};

/// CORS policy by bind address.
///
/// - **Loopback**: only pages served from `http://127.0.0.1`, `http://localhost`
///   or `http://[::1]` (any port) may call the gateway.
/// - **Non-loopback**: any origin; the caller logs a warning.
pub fn build_cors_layer(bind_addr: &SocketAddr) -> CorsLayer {
    let methods = AllowMethods::list([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS]);
    let headers = AllowHeaders::list([header::CONTENT_TYPE, header::ACCEPT]);

    let origin = if bind_addr.ip().is_loopback() {
        AllowOrigin::predicate(|origin: &HeaderValue, _req: &axum::http::request::Parts| {
            origin.to_str().is_ok_and(is_loopback_origin)
        })
    } else {
        AllowOrigin::any()
    };

    CorsLayer::new()
        .allow_origin(origin)
        .allow_methods(methods)
        .allow_headers(headers)
}

const LOOPBACK_HOSTS: &[&str] = &["localhost", "127.0.0.1", "[::1]"];

/// `http://` plus a loopback host and optional port, nothing else. The host
/// must match exactly so that `http://localhost.example.com` is refused.
fn is_loopback_origin(origin: &str) -> bool {
    let Ok(uri) = origin.parse::<Uri>() else {
        return false;
    };
    let Some(authority) = uri.authority() else {
        return false;
    };
    let (host, raw) = (authority.host(), authority.as_str());
    if raw.contains('@') || !raw.starts_with(host) {
        return false;
    }
    let port_ok = match &raw[host.len()..] {
        "" => true,
        rest => rest
            .strip_prefix(':')
            .is_some_and(|port| port.parse::<u16>().is_ok()),
    };

    port_ok
        && uri
            .scheme_str()
            .is_some_and(|scheme| scheme.eq_ignore_ascii_case("http"))
        && LOOPBACK_HOSTS.iter().any(|h| host.eq_ignore_ascii_case(h))
        && uri.path_and_query().is_none_or(|p| p.as_str() == "/")
}

pub fn build_router(gateway: SharedGateway) -> Router {
    let cors = build_cors_layer(&gateway.config().bind_addr);
    Router::new()
        .route("/health", get(health_check))
        .route("/providers", get(list_providers))
        .route("/tools/call", post(call_tool))
        .route("/terminals", get(list_terminals).post(create_terminal))
        .route("/terminals/{id}", delete(delete_terminal))
        .route("/terminals/{id}/input", post(write_terminal))
        .route("/terminals/{id}/resize", post(resize_terminal))
        .route("/terminals/{id}/ws", get(terminal_socket))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(gateway)
}

/// Serves the gateway until Ctrl-C / SIGTERM, then shuts every provider and
/// terminal down.
///
/// The bound address is printed to stderr as `TOOLGATE_BOUND_PORT=<port>` so
/// tooling can bind to port 0 and discover the real port.
pub async fn start_gateway(config: GatewayConfig) -> Result<()> {
    let bind_addr = config.bind_addr;
    info!("Starting gateway on {}", bind_addr);

    if !bind_addr.ip().is_loopback() {
        warn!(
            "Gateway bound to non-loopback address {}. \
             CORS allows any origin and there is no authentication. \
             Restrict access via firewall or reverse proxy.",
            bind_addr
        );
    }

    let gateway = Arc::new(Gateway::new(config));
    gateway.start_background_tasks();
    let app = build_router(gateway.clone());

    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .map_err(|e| GatewayError::HttpServer(format!("Failed to bind {}: {}", bind_addr, e)))?;
    let local_addr = listener
        .local_addr()
        .map_err(|e| GatewayError::HttpServer(format!("Failed to get local addr: {}", e)))?;

    info!("Gateway listening on http://{}", local_addr);
    eprintln!("TOOLGATE_BOUND_PORT={}", local_addr.port());

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| GatewayError::HttpServer(format!("Server error: {}", e)));

    gateway.shutdown().await;
    served
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl-C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
