//! Logging setup for `telosd`.
//!
//! - [`init_daemon`]: stderr plus, when a logs directory is configured, a
//!   daily-rotated JSON file for the long-running `start` subcommand.
//! - [`init_cli`]: stderr only, for `ctl` and `clean-pins`.
//!
//! Both honour `RUST_LOG`.

use std::path::Path;

use anyhow::Context;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Log file prefix inside the logs directory.
pub const LOG_FILE_NAME: &str = "telosd.log";

/// Keeps the non-blocking file writer alive. Dropping it flushes the file.
pub struct LoggingGuard {
    _guard: WorkerGuard,
}

fn env_filter(default: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
}

/// Initialise logging for the daemon.
///
/// Without `logs_dir` only the stderr layer is installed and `None` is
/// returned. With it, JSON lines go to `{logs_dir}/telosd.log.YYYY-MM-DD`
/// and the returned guard must outlive the daemon.
///
/// # Errors
///
/// Returns an error if the logs directory cannot be created.
pub fn init_daemon(logs_dir: Option<&Path>) -> anyhow::Result<Option<LoggingGuard>> {
    let Some(logs_dir) = logs_dir else {
        let console_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);
        tracing_subscriber::registry()
            .with(env_filter("info"))
            .with(console_layer)
            .init();
        return Ok(None);
    };

    std::fs::create_dir_all(logs_dir)
        .with_context(|| format!("failed to create logs directory {}", logs_dir.display()))?;

    let file_appender = tracing_appender::rolling::daily(logs_dir, LOG_FILE_NAME);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking);
    let console_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    tracing_subscriber::registry()
        .with(env_filter("info"))
        .with(json_layer)
        .with(console_layer)
        .init();

    Ok(Some(LoggingGuard { _guard: guard }))
}

/// Initialise stderr logging for one-shot subcommands. Quieter than the
/// daemon by default so command output stays readable.
pub fn init_cli() {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter("warn"))
        .with_writer(std::io::stderr)
        .init();
}
