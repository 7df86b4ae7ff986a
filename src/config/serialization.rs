//! Config serialization to TOML
//!
//! Single source of truth for config file format.

use super::Config;

impl Config {
    /// Render the config as a commented TOML document
    pub fn to_toml(&self) -> String {
        let record_dir = match &self.demo.record_dir {
            Some(dir) => format!("record_dir = {:?}", dir.display().to_string()),
            None => "# record_dir = \"./logs/frames\"".to_string(),
        };

        format!(
            r#"# widget-sync configuration

# Model synchronization
[sync]
# Syncs in flight before further changes are buffered until the kernel is idle
max_pending_msgs = {max_pending}
# Comm target for frontend-created widgets
comm_target = "{comm_target}"
# Leave default-valued attributes out of full-state updates
drop_defaults = {drop_defaults}

# Logging configuration (RUST_LOG env var overrides)
[logging]
level = "{log_level}"
# File logging (in addition to stdout)
file_enabled = {log_file_enabled}
file_dir = "{log_file_dir}"
file_rotation = "{log_file_rotation}"  # hourly, daily, never
file_prefix = "{log_file_prefix}"

# Simulated kernel session (widget-sync demo)
[demo]
delay_ms = {delay_ms}
{record_dir}
"#,
            max_pending = self.sync.max_pending_msgs,
            comm_target = self.sync.comm_target,
            drop_defaults = self.sync.drop_defaults,
            log_level = self.logging.level,
            log_file_enabled = self.logging.file_enabled,
            log_file_dir = self.logging.file_dir.display(),
            log_file_rotation = self.logging.file_rotation.name(),
            log_file_prefix = self.logging.file_prefix,
            delay_ms = self.demo.delay_ms,
            record_dir = record_dir,
        )
    }
}
