//! Tracing subscriber setup for the binary.
//!
//! Console output always; a daily-rolling log file as well when a log directory is
//! given. Both honour `RUST_LOG` and default to `info`.

use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

pub const LOG_DIR_ENV: &str = "HR_DOC_SYNC_LOG_DIR";
const DEFAULT_FILTER: &str = "info";

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Installs the global subscriber. Keep the returned guard alive until exit or buffered
/// file output is lost.
pub fn init(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let mut guard = None;
    let file_layer = log_dir.and_then(|dir| match std::fs::create_dir_all(dir) {
        Ok(()) => {
            let appender = tracing_appender::rolling::daily(dir, "hr-doc-sync.log");
            let (writer, file_guard) = tracing_appender::non_blocking(appender);
            guard = Some(file_guard);
            Some(
                tracing_subscriber::fmt::layer()
                    .with_writer(writer)
                    .with_ansi(false)
                    .with_filter(env_filter()),
            )
        }
        Err(err) => {
            eprintln!(
                "Warning: failed to create log directory {}: {err}",
                dir.display()
            );
            None
        }
    });

    let console_layer = tracing_subscriber::fmt::layer().with_filter(env_filter());

    let installed = tracing_subscriber::registry()
        .with(file_layer)
        .with(console_layer)
        .try_init();
    if let Err(err) = installed {
        eprintln!("Warning: tracing subscriber already installed: {err}");
    }
    guard
}
