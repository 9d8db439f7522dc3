//! File logging for the agent.
//!
//! stdout carries command output, so diagnostics go to a daily-rolling file
//! under `~/.proctor/logs/`.

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const LOG_FILE_PREFIX: &str = "proctor-agent.log";

/// Installs the global subscriber. The returned guard flushes buffered lines
/// on drop and must live until the process exits.
pub fn init() -> Option<WorkerGuard> {
    let log_dir = dirs::home_dir()?.join(".proctor").join("logs");
    if fs_err::create_dir_all(&log_dir).is_err() {
        return None;
    }

    let appender = tracing_appender::rolling::daily(&log_dir, LOG_FILE_PREFIX);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(writer).with_ansi(false).with_target(false))
        .try_init()
        .is_ok();

    installed.then_some(guard)
}
