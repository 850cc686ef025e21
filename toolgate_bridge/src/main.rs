use anyhow::Context;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use toolgate_bridge::config::FileConfig;
use toolgate_bridge::logging::init_logging;
use toolgate_bridge::{GatewayConfig, NamedProvider, start_gateway};

/// Process-bridging tool gateway.
///
/// Forwards HTTP tool calls to long-running provider subprocesses and serves
/// interactive terminals over WebSockets.
#[derive(Parser, Debug)]
#[command(name = "toolgate")]
#[command(version, about)]
struct Args {
    /// Address to bind the HTTP server (default 127.0.0.1:3000).
    #[arg(long, env = "TOOLGATE_BIND_ADDR")]
    bind_addr: Option<SocketAddr>,

    /// Working directory for providers and terminals.
    #[arg(long, env = "TOOLGATE_PROJECT_DIR")]
    project_dir: Option<PathBuf>,

    /// Directory that filesystem operations may touch. Repeatable; defaults to
    /// the project directory.
    #[arg(long = "allowed-dir", env = "TOOLGATE_ALLOWED_DIRS", value_delimiter = ',')]
    allowed_dirs: Vec<PathBuf>,

    /// Provider definition `name=command [args..]`. Repeatable.
    #[arg(long = "provider", env = "TOOLGATE_PROVIDERS", value_delimiter = ',')]
    providers: Vec<NamedProvider>,

    /// TOML configuration file; command-line values extend it.
    #[arg(long, env = "TOOLGATE_CONFIG")]
    config: Option<PathBuf>,

    /// Allow providers to run commands.
    #[arg(long, env = "TOOLGATE_EXECUTION_ENABLED")]
    execution_enabled: bool,

    /// Shell for terminal sessions (default: $SHELL, then /bin/sh).
    #[arg(long, env = "TOOLGATE_SHELL")]
    shell: Option<String>,

    /// Echo provider stdio to stderr in color (debug mode).
    #[arg(long)]
    colored_output: bool,

    /// Write logs to a daily rolling file instead of stderr.
    #[arg(long)]
    log_to_file: bool,

    /// Minimum log level when RUST_LOG is not set.
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn build_config(args: Args) -> anyhow::Result<GatewayConfig> {
    let mut config = GatewayConfig::default();
    if let Some(path) = &args.config {
        let file = FileConfig::load(path)
            .with_context(|| format!("loading configuration {}", path.display()))?;
        config = config.with_file(file);
    }

    if let Some(addr) = args.bind_addr {
        config.bind_addr = addr;
    }
    if let Some(dir) = args.project_dir {
        config.project_dir = dir;
    }
    config.allowed_dirs.extend(args.allowed_dirs);
    for provider in args.providers {
        config = config.with_provider(provider.name, provider.spec);
    }
    config.execution_enabled |= args.execution_enabled;
    if args.shell.is_some() {
        config.shell = args.shell;
    }
    config.enable_colored_output = args.colored_output;

    Ok(config.validate()?)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level, args.log_to_file)?;

    let config = build_config(args)?;

    tracing::info!(
        project_dir = %config.project_dir.display(),
        allowed_dirs = ?config.allowed_dirs,
        providers = ?config.providers.keys().collect::<Vec<_>>(),
        execution_enabled = config.execution_enabled,
        "Starting toolgate"
    );

    start_gateway(config).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    fn parse(args: &[&str]) -> Args {
        Args::try_parse_from(std::iter::once("toolgate").chain(args.iter().copied())).unwrap()
    }

    #[test]
    #[serial]
    fn command_line_builds_a_validated_config() {
        let dir = TempDir::new().unwrap();
        let project = dir.path().to_str().unwrap();
        let args = parse(&[
            "--project-dir",
            project,
            "--provider",
            "fs=node providers/fs.js",
            "--provider",
            "git=git-provider",
            "--execution-enabled",
            "--bind-addr",
            "127.0.0.1:0",
        ]);

        let config = build_config(args).unwrap();
        assert_eq!(config.bind_addr.port(), 0);
        assert!(config.execution_enabled);
        assert_eq!(config.providers.len(), 2);
        assert_eq!(config.providers["fs"].args, vec!["providers/fs.js"]);
        assert_eq!(
            config.allowed_dirs,
            vec![std::fs::canonicalize(dir.path()).unwrap()]
        );
    }

    #[test]
    #[serial]
    fn config_file_is_extended_by_flags() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("toolgate.toml");
        std::fs::write(
            &file,
            format!(
                "project_dir = {:?}\nshell = \"/bin/bash\"\n\n[providers.fs]\ncommand = \"fs-provider\"\n",
                dir.path().to_str().unwrap()
            ),
        )
        .unwrap();

        let args = parse(&[
            "--config",
            file.to_str().unwrap(),
            "--provider",
            "git=git-provider --stdio",
        ]);
        let config = build_config(args).unwrap();
        assert_eq!(config.shell.as_deref(), Some("/bin/bash"));
        assert!(config.providers.contains_key("fs"));
        assert_eq!(config.providers["git"].args, vec!["--stdio"]);
    }

    #[test]
    #[serial]
    fn missing_config_file_is_fatal() {
        let args = parse(&["--config", "/definitely/not/here.toml"]);
        assert!(build_config(args).is_err());
    }

    #[test]
    fn malformed_provider_flag_is_rejected() {
        let result = Args::try_parse_from(["toolgate", "--provider", "no-command"]);
        assert!(result.is_err());
    }
}
