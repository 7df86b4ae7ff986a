//! Demo session configuration

use serde::Deserialize;
use std::path::PathBuf;

/// Settings for the simulated kernel session
#[derive(Debug, Clone)]
pub struct DemoConfig {
    /// Pause between scripted kernel actions
    pub delay_ms: u64,
    /// Write comm frames as JSON Lines here when set
    pub record_dir: Option<PathBuf>,
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            delay_ms: 250,
            record_dir: None,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct FileDemo {
    pub delay_ms: Option<u64>,
    pub record_dir: Option<String>,
}

impl DemoConfig {
    pub fn from_file(file: Option<FileDemo>) -> Self {
        let file = file.unwrap_or_default();
        let defaults = Self::default();

        Self {
            delay_ms: file.delay_ms.unwrap_or(defaults.delay_ms),
            record_dir: file
                .record_dir
                .filter(|d| !d.is_empty())
                .map(PathBuf::from)
                .or(defaults.record_dir),
        }
    }
}
