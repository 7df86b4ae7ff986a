// Logging module - tracing subscriber setup
//
// Logs always go to stdout. File logging optionally adds a rolling JSON
// file layer behind a non-blocking writer; the returned guard must be kept
// alive for the duration of the program so buffered lines get flushed.
//
// Precedence for the filter: RUST_LOG env var > config level > "info"

use crate::config::LoggingConfig;
use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Filter directive used when RUST_LOG is not set
pub fn default_filter(config: &LoggingConfig) -> String {
    format!("widget_sync={}", config.level)
}

/// Install the global subscriber
pub fn init(config: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter(config).into());

    if !config.file_enabled {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init()
            .context("Failed to install tracing subscriber")?;
        return Ok(None);
    }

    std::fs::create_dir_all(&config.file_dir)
        .with_context(|| format!("Could not create log directory {:?}", config.file_dir))?;

    let file_appender = config
        .file_rotation
        .appender(&config.file_dir, &config.file_prefix);

    // Wrap in non-blocking writer (writes happen in background thread)
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    // File layer uses JSON format for structured log parsing
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(non_blocking)
                .with_ansi(false),
        )
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(Some(guard))
}
