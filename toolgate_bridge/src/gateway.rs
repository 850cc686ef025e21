//! The gateway owns every long-lived component and is shared as axum state.

use crate::config::GatewayConfig;
use crate::error::Result;
use crate::path_guard::PathGuard;
use crate::pty::NativePtySpawner;
use crate::registry::ProviderRegistry;
use crate::terminal::{TerminalPool, TerminalPoolConfig, TerminalSpawner, resolve_shell};
use serde_json::Value;
use std::sync::Arc;
use tracing::info;

pub struct Gateway {
    config: GatewayConfig,
    registry: ProviderRegistry,
    terminals: TerminalPool,
}

impl Gateway {
    /// Builds a gateway whose terminals are real pseudo-terminals.
    pub fn new(config: GatewayConfig) -> Self {
        Self::with_spawner(config, Arc::new(NativePtySpawner))
    }

    pub fn with_spawner(config: GatewayConfig, spawner: Arc<dyn TerminalSpawner>) -> Self {
        let pool_config = TerminalPoolConfig::new(
            resolve_shell(config.shell.as_deref()),
            config.project_dir.clone(),
        );
        Self::with_pool_config(config, pool_config, spawner)
    }

    pub fn with_pool_config(
        config: GatewayConfig,
        pool_config: TerminalPoolConfig,
        spawner: Arc<dyn TerminalSpawner>,
    ) -> Self {
        let guard = Arc::new(PathGuard::new(&config.allowed_dirs));
        let registry = ProviderRegistry::new(&config, guard.clone());
        let terminals = TerminalPool::new(pool_config, spawner, guard);
        Self {
            config,
            registry,
            terminals,
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    pub fn terminals(&self) -> &TerminalPool {
        &self.terminals
    }

    /// Tool invocation entry point.
    pub async fn call_tool(&self, provider: &str, method: &str, params: Value) -> Result<Value> {
        self.registry.call(provider, method, params).await
    }

    /// Starts background maintenance (the terminal idle sweep).
    pub fn start_background_tasks(&self) {
        self.terminals.start_sweeper();
    }

    /// Stops every provider and disposes every terminal.
    pub async fn shutdown(&self) {
        info!("Shutting down gateway");
        let disposed = self.terminals.dispose_all();
        self.registry.stop_all().await;
        info!(terminals = disposed, "Gateway shut down");
    }
}
