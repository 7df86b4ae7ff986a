//! Configuration tests
//!
//! The rendered TOML template must parse back into the same settings; when a
//! field is added, the round-trip test fails until `to_toml()` writes it.

use super::*;
use std::collections::HashMap;

fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let map: HashMap<String, String> = pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    move |key| map.get(key).cloned()
}

// ─────────────────────────────────────────────────────────────────────────────
// Round-trip tests
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_config_roundtrip_default() {
    let config = Config::default();
    let toml_str = config.to_toml();

    let parsed = Config::parse_file_config(&toml_str);
    assert!(
        parsed.is_ok(),
        "Default config should round-trip.\nTOML:\n{}\nError: {:?}",
        toml_str,
        parsed.err()
    );

    let reloaded = Config::from_sources(parsed.unwrap(), env_from(&[]));
    assert_eq!(reloaded.sync.max_pending_msgs, 1);
    assert_eq!(reloaded.sync.comm_target, "jupyter.widget");
    assert_eq!(reloaded.logging.file_prefix, "widget-sync");
    assert_eq!(reloaded.demo.record_dir, None);
}

#[test]
fn test_config_roundtrip_customized() {
    let mut config = Config::default();
    config.sync.max_pending_msgs = 4;
    config.sync.comm_target = "custom.target".to_string();
    config.sync.drop_defaults = true;
    config.logging.level = "debug".to_string();
    config.logging.file_rotation = LogRotation::Hourly;
    config.demo.delay_ms = 10;
    config.demo.record_dir = Some(PathBuf::from("/tmp/frames"));

    let parsed = Config::parse_file_config(&config.to_toml()).unwrap();
    let reloaded = Config::from_sources(parsed, env_from(&[]));

    assert_eq!(reloaded.sync.max_pending_msgs, 4);
    assert_eq!(reloaded.sync.comm_target, "custom.target");
    assert!(reloaded.sync.drop_defaults);
    assert_eq!(reloaded.logging.level, "debug");
    assert_eq!(reloaded.logging.file_rotation, LogRotation::Hourly);
    assert_eq!(reloaded.demo.delay_ms, 10);
    assert_eq!(reloaded.demo.record_dir, Some(PathBuf::from("/tmp/frames")));
}

// ─────────────────────────────────────────────────────────────────────────────
// Precedence
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_env_overrides_file() {
    let file = Config::parse_file_config(
        r#"
[sync]
max_pending_msgs = 2
comm_target = "from.file"
"#,
    )
    .unwrap();

    let config = Config::from_sources(
        file,
        env_from(&[
            ("WIDGET_SYNC_MAX_PENDING", "5"),
            ("WIDGET_SYNC_LOG_LEVEL", "trace"),
            ("WIDGET_SYNC_RECORD_DIR", "./frames"),
        ]),
    );

    assert_eq!(config.sync.max_pending_msgs, 5);
    assert_eq!(config.sync.comm_target, "from.file");
    assert_eq!(config.logging.level, "trace");
    assert_eq!(config.demo.record_dir, Some(PathBuf::from("./frames")));
}

#[test]
fn test_zero_pending_is_clamped() {
    let file = Config::parse_file_config("[sync]\nmax_pending_msgs = 0\n").unwrap();
    let config = Config::from_sources(file, env_from(&[("WIDGET_SYNC_MAX_PENDING", "0")]));
    assert_eq!(config.sync.max_pending_msgs, 1);

    let config = Config::from_sources(FileConfig::default(), env_from(&[]));
    assert_eq!(config.sync.max_pending_msgs, 1);
}

#[test]
fn test_invalid_file_is_error() {
    assert!(Config::parse_file_config("[sync\nmax_pending_msgs = ").is_err());
    assert!(Config::parse_file_config("[sync]\nmax_pending_msgs = \"many\"").is_err());
}

#[test]
fn test_rotation_names() {
    assert_eq!(LogRotation::from_name("NEVER"), Some(LogRotation::Never));
    assert_eq!(LogRotation::from_name(" hourly "), Some(LogRotation::Hourly));
    assert_eq!(LogRotation::from_name("weekly"), None);
}

#[test]
fn test_unknown_rotation_in_file_falls_back_to_daily() {
    let file = Config::parse_file_config("[logging]\nfile_rotation = \"weekly\"\n").unwrap();
    let config = Config::from_sources(file, env_from(&[]));
    assert_eq!(config.logging.file_rotation, LogRotation::Daily);
}
