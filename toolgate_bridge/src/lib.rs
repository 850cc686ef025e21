//! # Toolgate
//!
//! A process-bridging tool gateway. Remote clients call tools over HTTP; each
//! call is forwarded to a long-running helper process ("provider") over
//! newline-delimited JSON on stdio, and the provider's reply is returned.
//! Interactive shells run in pseudo-terminals and are piped over WebSockets.
//!
//! ## Architecture
//!
//! *   **Path guard** ([`path_guard`]): every working directory is checked
//!     against the configured allowed roots, after symlink resolution.
//! *   **Provider client** ([`provider`]): one subprocess per provider; concurrent
//!     requests are correlated with replies by id, with a fixed per-call timeout.
//! *   **Registry** ([`registry`]): starts providers lazily, once per name.
//! *   **Terminal pool** ([`terminal`], [`pty`]): at most ten shells, idle ones
//!     evicted after thirty minutes.
//! *   **Duplex bridge** ([`duplex`]): terminal bytes to and from a WebSocket.
//! *   **Front door** ([`bridge`], [`request_handler`]): the axum router.
//!
//! ## Example
//!
//! ```rust,no_run
//! use toolgate_bridge::{GatewayConfig, ProviderSpec, start_gateway};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = GatewayConfig {
//!         project_dir: "/work/project".into(),
//!         ..GatewayConfig::default()
//!     }
//!     .with_provider("fs", ProviderSpec::new("node").with_args(["providers/fs.js"]))
//!     .validate()?;
//!
//!     start_gateway(config).await?;
//!     Ok(())
//! }
//! ```

pub mod bridge;
pub mod config;
pub mod duplex;
pub mod error;
pub mod gateway;
pub mod logging;
pub mod path_guard;
pub mod provider;
pub mod pty;
pub mod registry;
pub mod request_handler;
pub mod terminal;

// Test utilities
pub mod test_utils;

pub use bridge::{build_router, start_gateway};
pub use config::{GatewayConfig, NamedProvider, ProviderSpec};
pub use error::{GatewayError, Result};
pub use gateway::Gateway;
pub use path_guard::PathGuard;
pub use provider::{LaunchOptions, ProviderClient};
pub use registry::{ProviderRegistry, ProviderStatus};
pub use terminal::{TerminalInfo, TerminalPool, TerminalPoolConfig, TerminalSession};
