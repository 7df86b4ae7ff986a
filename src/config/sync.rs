//! Model synchronization settings

use serde::Deserialize;

/// How models talk to the kernel
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Syncs allowed in flight before further ones are buffered
    pub max_pending_msgs: usize,
    /// Comm target name used when opening widget comms
    pub comm_target: String,
    /// Omit attributes equal to their defaults in full-state updates
    pub drop_defaults: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_pending_msgs: 1,
            comm_target: "jupyter.widget".to_string(),
            drop_defaults: false,
        }
    }
}

/// Sync settings as loaded from config file
#[derive(Debug, Deserialize, Default)]
pub struct FileSync {
    pub max_pending_msgs: Option<usize>,
    pub comm_target: Option<String>,
    pub drop_defaults: Option<bool>,
}

impl SyncConfig {
    /// Create from file config with defaults
    pub fn from_file(file: Option<FileSync>) -> Self {
        let file = file.unwrap_or_default();
        let defaults = Self::default();

        Self {
            // zero would buffer forever
            max_pending_msgs: file
                .max_pending_msgs
                .map(|n| n.max(1))
                .unwrap_or(defaults.max_pending_msgs),
            comm_target: file.comm_target.unwrap_or(defaults.comm_target),
            drop_defaults: file.drop_defaults.unwrap_or(defaults.drop_defaults),
        }
    }
}
