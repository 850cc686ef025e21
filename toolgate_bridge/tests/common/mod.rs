//! Shared setup for integration tests.

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use toolgate_bridge::test_utils::FakeTerminalSpawner;
use toolgate_bridge::{Gateway, GatewayConfig, PathGuard, ProviderSpec};

/// Path of the reference provider built alongside the tests.
pub fn echo_provider_path() -> &'static str {
    env!("CARGO_BIN_EXE_toolgate_echo_provider")
}

pub fn echo_provider_spec() -> ProviderSpec {
    ProviderSpec::new(echo_provider_path()).with_ready_method("ping")
}

/// A validated config rooted at `project_dir` with the echo provider as `echo`.
pub fn gateway_config(project_dir: &Path) -> GatewayConfig {
    GatewayConfig {
        project_dir: project_dir.to_path_buf(),
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        start_grace: Duration::from_millis(50),
        ..GatewayConfig::default()
    }
    .with_provider("echo", echo_provider_spec())
    .validate()
    .unwrap()
}

pub fn guard_for(dir: &Path) -> Arc<PathGuard> {
    Arc::new(PathGuard::new([dir]))
}

/// Gateway whose terminals are in-memory fakes.
pub fn fake_gateway(config: GatewayConfig) -> (Arc<Gateway>, Arc<FakeTerminalSpawner>) {
    let spawner = Arc::new(FakeTerminalSpawner::default());
    let gateway = Arc::new(Gateway::with_spawner(config, spawner.clone()));
    (gateway, spawner)
}
