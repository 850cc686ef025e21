//! Lazily started, per-name cached provider clients.

use crate::config::{GatewayConfig, ProviderSpec};
use crate::error::{GatewayError, Result};
use crate::path_guard::PathGuard;
use crate::provider::{LaunchOptions, ProviderClient};
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{info, warn};

type ClientCell = Arc<OnceCell<Arc<ProviderClient>>>;

/// Running state of one configured provider, as reported by `GET /providers`.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProviderStatus {
    pub name: String,
    pub command: String,
    pub state: &'static str,
    pub pending_requests: usize,
}

pub struct ProviderRegistry {
    specs: BTreeMap<String, ProviderSpec>,
    template: LaunchTemplate,
    clients: DashMap<String, ClientCell>,
}

/// Launch settings shared by every provider.
#[derive(Debug, Clone)]
struct LaunchTemplate {
    working_dir: std::path::PathBuf,
    env: Vec<(String, String)>,
    guard: Arc<PathGuard>,
    call_timeout: std::time::Duration,
    start_grace: std::time::Duration,
    colored_output: bool,
}

impl ProviderRegistry {
    pub fn new(config: &GatewayConfig, guard: Arc<PathGuard>) -> Self {
        Self {
            specs: config.providers.clone(),
            template: LaunchTemplate {
                working_dir: config.project_dir.clone(),
                env: config.provider_environment(),
                guard,
                call_timeout: config.call_timeout,
                start_grace: config.start_grace,
                colored_output: config.enable_colored_output,
            },
            clients: DashMap::new(),
        }
    }

    fn launch_options(&self, spec: &ProviderSpec) -> LaunchOptions {
        LaunchOptions {
            spec: spec.clone(),
            working_dir: self.template.working_dir.clone(),
            env: self.template.env.clone(),
            guard: self.template.guard.clone(),
            call_timeout: self.template.call_timeout,
            start_grace: self.template.start_grace,
            colored_output: self.template.colored_output,
        }
    }

    /// Returns the running client for `name`, starting it on first use.
    ///
    /// Concurrent first calls for one name share a single start; different
    /// names start independently. A client whose subprocess has died is
    /// replaced by a fresh one.
    pub async fn get_client(&self, name: &str) -> Result<Arc<ProviderClient>> {
        let spec = self
            .specs
            .get(name)
            .ok_or_else(|| GatewayError::ProviderNotFound(format!("no provider named '{name}'")))?;

        for _ in 0..2 {
            let cell = self
                .clients
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone();

            let client = cell
                .get_or_try_init(|| async {
                    let client = Arc::new(ProviderClient::new(name, self.launch_options(spec)));
                    client.start().await?;
                    Ok::<_, GatewayError>(client)
                })
                .await?;

            if !client.state().is_stopped() {
                return Ok(client.clone());
            }

            warn!(provider = %name, "Provider has stopped - restarting on demand");
            self.clients
                .remove_if(name, |_, current| Arc::ptr_eq(current, &cell));
        }

        Err(GatewayError::NotStarted(name.to_string()))
    }

    pub async fn call(&self, provider: &str, method: &str, params: Value) -> Result<Value> {
        let client = self.get_client(provider).await?;
        client.call(method, params).await
    }

    /// Stops every started client and forgets it.
    pub async fn stop_all(&self) {
        let cells: Vec<ClientCell> = self
            .clients
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        self.clients.clear();

        for cell in cells {
            if let Some(client) = cell.get() {
                client.stop().await;
            }
        }
        info!("All providers stopped");
    }

    pub fn providers(&self) -> Vec<ProviderStatus> {
        self.specs
            .iter()
            .map(|(name, spec)| {
                let client = self
                    .clients
                    .get(name)
                    .and_then(|cell| cell.get().cloned());
                ProviderStatus {
                    name: name.clone(),
                    command: spec.command.clone(),
                    state: client
                        .as_ref()
                        .map(|c| c.state().label())
                        .unwrap_or("unstarted"),
                    pending_requests: client.map(|c| c.pending_count()).unwrap_or(0),
                }
            })
            .collect()
    }

    pub fn is_configured(&self, name: &str) -> bool {
        self.specs.contains_key(name)
    }
}
