//! Gateway configuration.
//!
//! Settings come from the command line / `TOOLGATE_*` environment variables
//! (see `main.rs`) and optionally from a TOML file:
//!
//! ```toml
//! bind_addr = "127.0.0.1:3000"
//! project_dir = "/work/project"
//! allowed_dirs = ["/work/project", "/work/shared"]
//! execution_enabled = true
//! shell = "/bin/bash"
//!
//! [providers.fs]
//! command = "node"
//! args = ["providers/fs.js"]
//! ready_method = "ping"
//!
//! [providers.git]
//! command = "/usr/local/bin/git-provider"
//! env = { GIT_TERMINAL_PROMPT = "0" }
//! ```
//!
//! Everything is read once at startup and never changes afterwards.

use crate::error::{GatewayError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Deadline for a single provider call.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Pause after spawning a provider before it is considered started.
pub const DEFAULT_START_GRACE: Duration = Duration::from_millis(100);

pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1:3000";

/// Environment variables handed to every provider subprocess.
pub const ENV_PROJECT_DIR: &str = "TOOLGATE_PROJECT_DIR";
pub const ENV_ALLOWED_DIRS: &str = "TOOLGATE_ALLOWED_DIRS";
pub const ENV_EXECUTION_ENABLED: &str = "TOOLGATE_EXECUTION_ENABLED";

/// How to launch one provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProviderSpec {
    /// Executable path or a bare command name looked up on `PATH`
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra environment for this provider only
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Method called once after spawn; the provider is ready when it answers
    #[serde(default)]
    pub ready_method: Option<String>,
}

impl ProviderSpec {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            ready_method: None,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_ready_method(mut self, method: impl Into<String>) -> Self {
        self.ready_method = Some(method.into());
        self
    }
}

/// A `name=command arg...` provider definition from the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamedProvider {
    pub name: String,
    pub spec: ProviderSpec,
}

impl FromStr for NamedProvider {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (name, command_line) = s
            .split_once('=')
            .ok_or_else(|| format!("expected name=command, got '{s}'"))?;
        let name = name.trim();
        if name.is_empty() {
            return Err(format!("provider name is empty in '{s}'"));
        }
        let mut words = command_line.split_whitespace();
        let command = words
            .next()
            .ok_or_else(|| format!("provider '{name}' has no command"))?;
        Ok(Self {
            name: name.to_string(),
            spec: ProviderSpec::new(command).with_args(words),
        })
    }
}

/// Optional TOML configuration file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub bind_addr: Option<SocketAddr>,
    pub project_dir: Option<PathBuf>,
    #[serde(default)]
    pub allowed_dirs: Vec<PathBuf>,
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderSpec>,
    pub execution_enabled: Option<bool>,
    pub shell: Option<String>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            GatewayError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::parse(&text)
            .map_err(|e| GatewayError::Config(format!("{}: {}", path.display(), e)))
    }

    pub fn parse(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| GatewayError::Config(e.to_string()))
    }
}

/// Resolved gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub bind_addr: SocketAddr,
    /// Working directory for providers and terminals
    pub project_dir: PathBuf,
    /// Roots for the path guard; empty means "project_dir only" after validation
    pub allowed_dirs: Vec<PathBuf>,
    pub providers: BTreeMap<String, ProviderSpec>,
    pub execution_enabled: bool,
    /// Shell for terminal sessions; falls back to `$SHELL`, then `/bin/sh`
    pub shell: Option<String>,
    /// Echo provider stdio to stderr in color (debugging aid)
    pub enable_colored_output: bool,
    pub call_timeout: Duration,
    pub start_grace: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], DEFAULT_PORT)),
            project_dir: PathBuf::from("."),
            allowed_dirs: Vec::new(),
            providers: BTreeMap::new(),
            execution_enabled: false,
            shell: None,
            enable_colored_output: false,
            call_timeout: DEFAULT_CALL_TIMEOUT,
            start_grace: DEFAULT_START_GRACE,
        }
    }
}

impl GatewayConfig {
    /// Applies values present in a configuration file.
    pub fn with_file(mut self, file: FileConfig) -> Self {
        if let Some(addr) = file.bind_addr {
            self.bind_addr = addr;
        }
        if let Some(dir) = file.project_dir {
            self.project_dir = dir;
        }
        self.allowed_dirs.extend(file.allowed_dirs);
        self.providers.extend(file.providers);
        if let Some(enabled) = file.execution_enabled {
            self.execution_enabled = enabled;
        }
        if file.shell.is_some() {
            self.shell = file.shell;
        }
        self
    }

    pub fn with_provider(mut self, name: impl Into<String>, spec: ProviderSpec) -> Self {
        self.providers.insert(name.into(), spec);
        self
    }

    /// Makes the project directory absolute and defaults the allow-list to it.
    pub fn validate(mut self) -> Result<Self> {
        let project_dir = std::fs::canonicalize(&self.project_dir).map_err(|e| {
            GatewayError::Config(format!(
                "project directory {} is not usable: {}",
                self.project_dir.display(),
                e
            ))
        })?;
        if !project_dir.is_dir() {
            return Err(GatewayError::Config(format!(
                "project directory {} is not a directory",
                project_dir.display()
            )));
        }
        self.project_dir = project_dir;
        if self.allowed_dirs.is_empty() {
            self.allowed_dirs.push(self.project_dir.clone());
        }
        for (name, spec) in &self.providers {
            if spec.command.trim().is_empty() {
                return Err(GatewayError::Config(format!(
                    "provider '{name}' has an empty command"
                )));
            }
        }
        Ok(self)
    }

    /// Execution-scoped settings exported to provider subprocesses.
    pub fn provider_environment(&self) -> Vec<(String, String)> {
        let allowed = std::env::join_paths(&self.allowed_dirs)
            .map(|joined| joined.to_string_lossy().into_owned())
            .unwrap_or_default();
        vec![
            (
                ENV_PROJECT_DIR.to_string(),
                self.project_dir.to_string_lossy().into_owned(),
            ),
            (ENV_ALLOWED_DIRS.to_string(), allowed),
            (
                ENV_EXECUTION_ENABLED.to_string(),
                if self.execution_enabled { "1" } else { "0" }.to_string(),
            ),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn parses_provider_argument() {
        let parsed: NamedProvider = "git=python3 providers/git.py --verbose".parse().unwrap();
        assert_eq!(parsed.name, "git");
        assert_eq!(parsed.spec.command, "python3");
        assert_eq!(parsed.spec.args, vec!["providers/git.py", "--verbose"]);
    }

    #[test]
    fn rejects_malformed_provider_arguments() {
        assert!("no-equals-sign".parse::<NamedProvider>().is_err());
        assert!("=cmd".parse::<NamedProvider>().is_err());
        assert!("fs=   ".parse::<NamedProvider>().is_err());
    }

    #[test]
    fn parses_toml_file() {
        let file = FileConfig::parse(
            r#"
            bind_addr = "0.0.0.0:8080"
            allowed_dirs = ["/srv/a", "/srv/b"]
            execution_enabled = true

            [providers.fs]
            command = "node"
            args = ["fs.js"]
            ready_method = "ping"

            [providers.git]
            command = "git-provider"
            env = { GIT_TERMINAL_PROMPT = "0" }
            "#,
        )
        .unwrap();

        let config = GatewayConfig::default().with_file(file);
        assert_eq!(config.bind_addr.to_string(), "0.0.0.0:8080");
        assert_eq!(config.allowed_dirs.len(), 2);
        assert!(config.execution_enabled);
        assert_eq!(
            config.providers["fs"].ready_method.as_deref(),
            Some("ping")
        );
        assert_eq!(
            config.providers["git"].env.get("GIT_TERMINAL_PROMPT"),
            Some(&"0".to_string())
        );
    }

    #[test]
    fn unknown_file_keys_are_rejected() {
        let err = FileConfig::parse("bind_adress = \"127.0.0.1:1\"").unwrap_err();
        assert!(matches!(err, GatewayError::Config(_)));
    }

    #[test]
    fn validate_defaults_allow_list_to_project_dir() {
        let dir = TempDir::new().unwrap();
        let config = GatewayConfig {
            project_dir: dir.path().to_path_buf(),
            ..GatewayConfig::default()
        }
        .validate()
        .unwrap();

        let canonical = std::fs::canonicalize(dir.path()).unwrap();
        assert_eq!(config.project_dir, canonical);
        assert_eq!(config.allowed_dirs, vec![canonical]);
    }

    #[test]
    fn validate_rejects_missing_project_dir() {
        let dir = TempDir::new().unwrap();
        let result = GatewayConfig {
            project_dir: dir.path().join("nope"),
            ..GatewayConfig::default()
        }
        .validate();
        assert!(matches!(result, Err(GatewayError::Config(_))));
    }

    #[test]
    fn provider_environment_reports_execution_flag() {
        let config = GatewayConfig {
            execution_enabled: true,
            ..GatewayConfig::default()
        };
        let env = config.provider_environment();
        assert!(env.contains(&(ENV_EXECUTION_ENABLED.to_string(), "1".to_string())));
        assert!(env.iter().any(|(k, _)| k == ENV_PROJECT_DIR));
    }

    #[test]
    fn defaults_match_fixed_timeouts() {
        let config = GatewayConfig::default();
        assert_eq!(config.call_timeout, Duration::from_secs(30));
        assert_eq!(config.bind_addr.to_string(), DEFAULT_BIND_ADDR);
        assert!(config.providers.is_empty());
    }
}
