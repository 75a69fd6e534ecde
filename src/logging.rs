//! Structured logging setup using `tracing-subscriber` and `tracing-appender`.
//!
//! With a log directory configured, JSON entries go to a daily-rotated file
//! while human-readable output goes to stderr; without one, stderr only.
//! `RUST_LOG` controls the filter (default `info`).

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Holds the non-blocking writer guard for file logging.
///
/// The [`WorkerGuard`] must be kept alive for the duration of the process.
/// Dropping it flushes pending log entries and closes the file.
pub struct LoggingGuard {
    _guard: WorkerGuard,
}

/// Initialise logging.
///
/// When `logs_dir` is set, writes JSON logs to
/// `{logs_dir}/kubefreezer.log.YYYY-MM-DD` with daily rotation alongside the
/// stderr layer, and returns a guard that must be kept alive for flushing.
///
/// # Errors
///
/// Returns an error if the logs directory cannot be created.
pub fn init(logs_dir: Option<&Path>) -> anyhow::Result<Option<LoggingGuard>> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let Some(logs_dir) = logs_dir else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
        return Ok(None);
    };

    std::fs::create_dir_all(logs_dir).map_err(|e| {
        anyhow::anyhow!(
            "failed to create logs directory {}: {e}",
            logs_dir.display()
        )
    })?;

    let file_appender = tracing_appender::rolling::daily(logs_dir, "kubefreezer.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(json_layer)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    Ok(Some(LoggingGuard { _guard: guard }))
}
