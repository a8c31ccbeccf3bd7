// SPDX-License-Identifier: MPL-2.0

//! Integration tests for configuration module

use pano_rig::RigConfig;
use pano_rig::config::{ENV_RELEASE_TIMEOUT, ENV_STOP_RECORD_TIMEOUT, Timeouts};
use std::time::Duration;

#[test]
fn test_config_default() {
    let config = RigConfig::default();

    assert_eq!(config.timeouts.camera_release(), Duration::from_millis(7000));
    assert_eq!(config.timeouts.stop_record(), Duration::from_millis(8000));
    assert_eq!(config.timeouts.capture_settle(), Duration::from_millis(1500));
    assert_eq!(config.timeouts.capture_reopen_settle(), Duration::from_millis(500));
    assert_eq!(config.timeouts.update_preview_barrier(), Duration::from_millis(1000));
    assert_eq!(config.timeouts.stack_file_ready(), Duration::from_millis(5000));
    assert!(!config.hdr.keep_sources, "HDR sources are deleted by default");
    assert!(config.hdr.prefer_burst);
    assert!(!config.force_switch_on_resolution_change);
    assert!(config.output_dir.is_none());
}

#[test]
fn test_partial_file_keeps_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.json");
    std::fs::write(
        &path,
        r#"{ "timeouts": { "camera_release_ms": 250 }, "hdr": { "keep_sources": true } }"#,
    )
    .unwrap();

    let config = RigConfig::load(&path).unwrap();
    assert_eq!(config.timeouts.camera_release_ms, 250);
    assert_eq!(config.timeouts.stop_record_ms, 8000);
    assert!(config.hdr.keep_sources);
    assert!(config.hdr.thumbnail);
}

#[test]
fn test_load_reports_bad_json() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.json");
    std::fs::write(&path, "{ not json").unwrap();

    let err = RigConfig::load(&path).unwrap_err();
    assert!(err.contains("Failed to parse"), "unexpected error: {}", err);
    assert!(RigConfig::load(&dir.path().join("missing.json")).is_err());
}

#[test]
fn test_json_round_trip() {
    let config = RigConfig {
        timeouts: Timeouts::uniform(42),
        force_switch_on_resolution_change: true,
        ..RigConfig::default()
    };
    let json = config.to_json().unwrap();
    let parsed: RigConfig = serde_json::from_str(&json).unwrap();
    assert_eq!(parsed, config);
}

#[test]
fn test_env_overrides() {
    let mut config = RigConfig::default();
    config.apply_env_overrides(|key| match key {
        k if k == ENV_RELEASE_TIMEOUT => Some("1200".to_string()),
        k if k == ENV_STOP_RECORD_TIMEOUT => Some(" 900 ".to_string()),
        _ => None,
    });
    assert_eq!(config.timeouts.camera_release(), Duration::from_millis(1200));
    assert_eq!(config.timeouts.stop_record(), Duration::from_millis(900));
}

#[test]
fn test_invalid_env_override_ignored() {
    let mut config = RigConfig::default();
    config.apply_env_overrides(|_| Some("soon".to_string()));
    assert_eq!(config.timeouts, Timeouts::default());
}

#[test]
fn test_photo_dir_prefers_configured_output() {
    let config = RigConfig {
        output_dir: Some("/tmp/rig-photos".into()),
        ..RigConfig::default()
    };
    assert_eq!(config.photo_dir(), std::path::PathBuf::from("/tmp/rig-photos"));
}
