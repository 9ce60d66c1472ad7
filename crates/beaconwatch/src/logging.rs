//! Logging initialization and configuration.
//!
//! Two layouts, picked by whether a log directory was given:
//! - **Daemon**: JSON logs to daily rolling files + compact logs to stdout
//! - **Interactive**: compact logs to stderr, keeping stdout for calibration
//!   output

use std::path::Path;
use std::sync::OnceLock;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Environment variable overriding the default level.
pub const LOG_LEVEL_ENV: &str = "BEACONWATCH_LOG_LEVEL";

/// Static guards to keep non-blocking writers alive.
/// These must persist for the lifetime of the program.
static FILE_GUARD: OnceLock<WorkerGuard> = OnceLock::new();
static STDOUT_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Initialize logging.
///
/// The filter comes from `RUST_LOG` when set, else from
/// `BEACONWATCH_LOG_LEVEL`, else `info` (`debug` when `verbose`).
///
/// # Errors
///
/// Returns an error if the filter cannot be parsed or the log directory
/// cannot be created.
pub fn init(verbose: bool, log_dir: Option<&Path>) -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level(verbose)))?;

    match log_dir {
        Some(dir) => init_daemon(env_filter, dir)?,
        None => init_interactive(env_filter),
    }

    Ok(())
}

fn default_level(verbose: bool) -> String {
    if verbose {
        return "debug".to_string();
    }
    std::env::var(LOG_LEVEL_ENV).unwrap_or_else(|_| "info".to_string())
}

/// File + stdout output for running under a service manager.
fn init_daemon(env_filter: EnvFilter, log_dir: &Path) -> anyhow::Result<()> {
    std::fs::create_dir_all(log_dir)?;

    let file_appender = RollingFileAppender::new(Rotation::DAILY, log_dir, "beaconwatch");
    let (non_blocking_file, file_guard) = tracing_appender::non_blocking(file_appender);
    let (non_blocking_stdout, stdout_guard) = tracing_appender::non_blocking(std::io::stdout());

    let file_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking_file)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    // journald adds its own timestamps and does not render ANSI
    let stdout_layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_writer(non_blocking_stdout)
        .with_target(true)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(stdout_layer)
        .init();

    let _ = FILE_GUARD.set(file_guard);
    let _ = STDOUT_GUARD.set(stdout_guard);

    Ok(())
}

fn init_interactive(env_filter: EnvFilter) {
    let stderr_layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_writer(std::io::stderr)
        .with_target(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stderr_layer)
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_daemon_layout_creates_log_directory() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("logs");
        init(false, Some(&nested)).unwrap();
        assert!(nested.is_dir());
    }

    #[test]
    fn test_verbose_forces_debug() {
        assert_eq!(default_level(true), "debug");
    }
}
