//! Tracing configuration and log routing.
//!
//! The gateway logs to stdout with a compact formatter and, when a file target is
//! available, to disk as well. `RAGCHAT_LOG_FILE` selects the file target; without it
//! logs land in `logs/ragchat.log`. File writes go through a non-blocking worker so
//! request handling never waits on disk.
use std::sync::OnceLock;

use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

static LOG_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Configure tracing subscribers for stdout and optional file logging.
///
/// Respects `RUST_LOG` for filtering (defaults to `info`). The worker guard backing the
/// file writer is stored globally so buffered lines survive until process exit.
pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stdout_layer = fmt::layer().with_target(false).compact();
    let file_layer = file_writer().map(|writer| {
        fmt::layer()
            .with_writer(writer)
            .with_target(true)
            .with_ansi(false)
            .compact()
    });

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout_layer)
        .with(file_layer)
        .init();
}

/// Build a non-blocking writer for the configured log file, if one can be opened.
fn file_writer() -> Option<NonBlocking> {
    let (non_blocking, guard) = match std::env::var("RAGCHAT_LOG_FILE") {
        Ok(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .map_err(|err| eprintln!("Failed to open log file {path}: {err}"))
                .ok()?;
            tracing_appender::non_blocking(file)
        }
        Err(_) => {
            if let Err(err) = std::fs::create_dir_all("logs") {
                eprintln!("Failed to create logs directory: {err}");
                return None;
            }
            tracing_appender::non_blocking(tracing_appender::rolling::never("logs", "ragchat.log"))
        }
    };
    let _ = LOG_GUARD.set(guard);
    Some(non_blocking)
}
