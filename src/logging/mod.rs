//! Logging setup: a console layer routed through the progress
//! aggregator's log channel (so log lines scroll past the pinned
//! progress block) and a JSON file layer with rolling files under
//! `<exe_dir>/logs/`.

use std::path::PathBuf;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::progress::LogWriter;

pub fn executable_dir() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(|p| p.to_path_buf()))
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Install the global subscriber. The returned guard must live for the
/// duration of the process so buffered file output is flushed.
pub fn init(debug: bool, console: LogWriter) -> WorkerGuard {
    let default_level = if debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let file_appender =
        tracing_appender::rolling::daily(executable_dir().join("logs"), "uploader.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    let console_layer = fmt::layer()
        .with_target(false)
        .with_writer(console)
        .with_ansi(false);

    let file_layer = fmt::layer()
        .json()
        .with_writer(file_writer)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    guard
}
