//! Tracing subscriber setup.
//!
//! Human-readable output goes to stderr. When a log directory is available
//! a daily-rotated file receives the same events without ANSI colors.

use imagebake_shared::{BakeError, BakeResult};
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

pub const LOG_FILE_NAME: &str = "imagebake.log";

#[derive(Debug, Clone)]
pub struct LoggingOptions {
    pub log_dir: Option<PathBuf>,
    /// Used when `RUST_LOG` is unset.
    pub default_filter: String,
    pub ansi: bool,
}

impl Default for LoggingOptions {
    fn default() -> Self {
        Self {
            log_dir: None,
            default_filter: "info".to_string(),
            ansi: true,
        }
    }
}

fn env_filter(default_filter: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter))
}

/// Install the global subscriber.
///
/// The returned guard flushes the file writer on drop; keep it alive for
/// the lifetime of the process.
pub fn init_logging(options: &LoggingOptions) -> BakeResult<Option<WorkerGuard>> {
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(options.ansi)
        .with_target(false);

    let (file_layer, guard) = match &options.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir).map_err(|e| {
                BakeError::Storage(format!(
                    "Failed to create log directory {}: {}",
                    dir.display(),
                    e
                ))
            })?;
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_NAME);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_thread_ids(true);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(env_filter(&options.default_filter))
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| BakeError::Internal(format!("Failed to initialize logging: {}", e)))?;

    Ok(guard)
}
