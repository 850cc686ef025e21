//! Logging initialization.
//!
//! `init_logging` installs a global `tracing` subscriber exactly once:
//!
//! - The filter comes from `RUST_LOG` when set, otherwise
//!   `<level>,toolgate_bridge=debug`.
//! - With `log_to_file`, events go to a daily rolling file in the user cache
//!   directory (no ANSI colors). If that directory is not writable the logger
//!   falls back to stderr.
//! - Otherwise events go to stderr with colors.

use anyhow::Result;
use directories::ProjectDirs;
use std::{io::stderr, path::Path, sync::Once};
use tracing_subscriber::{EnvFilter, fmt::layer, prelude::*};

static INIT: Once = Once::new();

const LOG_FILE_NAME: &str = "toolgate.log";

pub fn init_logging(log_level: &str, log_to_file: bool) -> Result<()> {
    INIT.call_once(|| {
        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(format!("{log_level},toolgate_bridge=debug")));

        if log_to_file && let Some(log_dir) = log_directory() {
            // tracing-appender panics when the directory is not writable.
            let file_appender = if can_write_to(&log_dir) {
                std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    tracing_appender::rolling::daily(&log_dir, LOG_FILE_NAME)
                }))
                .ok()
            } else {
                None
            };

            if let Some(file_appender) = file_appender {
                let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(layer().with_writer(non_blocking).with_ansi(false))
                    .init();
                // Flushes on exit only while the guard is alive.
                Box::leak(Box::new(guard));
                return;
            }
        }

        tracing_subscriber::registry()
            .with(env_filter)
            .with(layer().with_writer(stderr).with_ansi(true))
            .init();
    });

    Ok(())
}

/// Where `--log-to-file` writes, if the platform has a cache directory.
pub fn log_directory() -> Option<std::path::PathBuf> {
    ProjectDirs::from("dev", "Toolgate", "toolgate").map(|dirs| dirs.cache_dir().to_path_buf())
}

fn can_write_to(dir: &Path) -> bool {
    if std::fs::create_dir_all(dir).is_err() {
        return false;
    }
    let probe = dir.join(".toolgate_log_probe");
    match std::fs::write(&probe, "probe") {
        Ok(()) => {
            let _ = std::fs::remove_file(&probe);
            true
        }
        Err(_) => false,
    }
}
