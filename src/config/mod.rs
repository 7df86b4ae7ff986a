//! Configuration for widget sync
//!
//! Configuration is loaded in order of precedence:
//! 1. Environment variables (highest priority)
//! 2. Config file (~/.config/widget-sync/config.toml)
//! 3. Built-in defaults (lowest priority)

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::PathBuf;

// ─────────────────────────────────────────────────────────────────────────────
// Submodules
// ─────────────────────────────────────────────────────────────────────────────

mod demo;
mod observability;
mod serialization;
mod sync;

#[cfg(test)]
mod tests;

// ─────────────────────────────────────────────────────────────────────────────
// Re-exports
// ─────────────────────────────────────────────────────────────────────────────

pub use demo::{DemoConfig, FileDemo};
pub use observability::{FileLogging, LogRotation, LoggingConfig};
pub use sync::{FileSync, SyncConfig};

// ─────────────────────────────────────────────────────────────────────────────
// Constants
// ─────────────────────────────────────────────────────────────────────────────

/// Version info
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// ─────────────────────────────────────────────────────────────────────────────
// Application Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Application configuration
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Model synchronization behavior
    pub sync: SyncConfig,

    /// Logging configuration
    pub logging: LoggingConfig,

    /// Simulated kernel session settings
    pub demo: DemoConfig,
}

// ─────────────────────────────────────────────────────────────────────────────
// File Configuration (deserialization layer)
// ─────────────────────────────────────────────────────────────────────────────

/// Config file structure
#[derive(Debug, Deserialize, Default)]
pub(crate) struct FileConfig {
    /// Optional [sync] section
    pub sync: Option<FileSync>,

    /// Optional [logging] section
    pub logging: Option<FileLogging>,

    /// Optional [demo] section
    pub demo: Option<FileDemo>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Configuration Loading
// ─────────────────────────────────────────────────────────────────────────────

impl Config {
    /// Get the config file path: ~/.config/widget-sync/config.toml
    /// Uses Unix-style ~/.config on all platforms for consistency
    pub fn config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|p| p.join(".config").join("widget-sync").join("config.toml"))
    }

    /// Create config file with defaults if it doesn't exist
    pub fn ensure_config_exists() -> Result<()> {
        let Some(path) = Self::config_path() else {
            return Ok(());
        };

        // Don't overwrite existing config
        if path.exists() {
            return Ok(());
        }

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        // Use Config::default().to_toml() as single source of truth
        std::fs::write(&path, Self::default().to_toml())
            .with_context(|| format!("Failed to write {}", path.display()))
    }

    /// Load file config if it exists.
    ///
    /// A file that exists but does not parse is an error: a broken config
    /// should fail fast instead of silently falling back to defaults.
    fn load_file_config() -> Result<FileConfig> {
        let Some(path) = Self::config_path() else {
            return Ok(FileConfig::default());
        };

        match std::fs::read_to_string(&path) {
            Ok(contents) => Self::parse_file_config(&contents)
                .with_context(|| format!("Invalid config file {}", path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(FileConfig::default()),
            Err(e) => Err(e).with_context(|| format!("Cannot read config file {}", path.display())),
        }
    }

    pub(crate) fn parse_file_config(contents: &str) -> Result<FileConfig> {
        Ok(toml::from_str(contents)?)
    }

    /// Load configuration: file -> env vars -> defaults
    pub fn load() -> Result<Self> {
        let file = Self::load_file_config()?;
        Ok(Self::from_sources(file, |key| std::env::var(key).ok()))
    }

    /// Merge a parsed file with environment overrides
    pub(crate) fn from_sources(file: FileConfig, env: impl Fn(&str) -> Option<String>) -> Self {
        let mut sync = SyncConfig::from_file(file.sync);
        let mut logging = LoggingConfig::from_file(file.logging);
        let mut demo = DemoConfig::from_file(file.demo);

        // Max pending syncs: env > file > default
        if let Some(max) = env("WIDGET_SYNC_MAX_PENDING").and_then(|v| v.parse::<usize>().ok()) {
            sync.max_pending_msgs = max.max(1);
        }

        // Comm target: env > file > default
        if let Some(target) = env("WIDGET_SYNC_COMM_TARGET").filter(|t| !t.is_empty()) {
            sync.comm_target = target;
        }

        // Log level: env > file > default (RUST_LOG still wins at subscriber level)
        if let Some(level) = env("WIDGET_SYNC_LOG_LEVEL") {
            logging.level = level;
        }

        // Recording directory: env only turns recording on
        if let Some(dir) = env("WIDGET_SYNC_RECORD_DIR") {
            demo.record_dir = Some(PathBuf::from(dir));
        }

        Self {
            sync,
            logging,
            demo,
        }
    }
}
