//! Configuration file tests

use std::time::Duration;
use tempfile::TempDir;

use snippet_sequencer::{EngineConfig, ProgressionMode, ProgressionPolicy, SequencerError};

#[test]
fn test_save_and_load_round_trip() {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("engine.json");

    let config = EngineConfig {
        stop_grace_ms: 500,
        transport_disabled: true,
        ..EngineConfig::with_policy(ProgressionPolicy::ContinueWithDelay(Duration::from_millis(
            1_500,
        )))
    };
    config.save_to_file(&path).expect("save");

    let loaded = EngineConfig::load_from_file(&path).expect("load");
    assert_eq!(loaded, config);
    assert_eq!(
        loaded.policy().unwrap(),
        ProgressionPolicy::ContinueWithDelay(Duration::from_millis(1_500))
    );
    assert_eq!(loaded.stop_grace(), Duration::from_millis(500));
}

#[test]
fn test_saved_file_uses_snake_case_mode() {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("engine.json");

    EngineConfig::with_policy(ProgressionPolicy::PauseAfterEach)
        .save_to_file(&path)
        .expect("save");

    let text = std::fs::read_to_string(&path).expect("read");
    assert!(text.contains("\"pause_after_each\""));
}

#[test]
fn test_load_missing_file_fails_with_context() {
    let dir = TempDir::new().expect("tempdir");
    let err = EngineConfig::load_from_file(dir.path().join("nope.json")).unwrap_err();
    assert!(format!("{:#}", err).contains("Failed to read engine configuration"));
}

#[test]
fn test_load_malformed_json_fails() {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("broken.json");
    std::fs::write(&path, "{ progression: ").expect("write");

    let err = EngineConfig::load_from_file(&path).unwrap_err();
    assert!(format!("{:#}", err).contains("Failed to parse engine configuration JSON"));
}

#[test]
fn test_loaded_delay_mode_without_delay_fails_validation() {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("engine.json");
    std::fs::write(&path, r#"{ "progression": "continue_with_delay" }"#).expect("write");

    let config = EngineConfig::load_from_file(&path).expect("parses");
    assert_eq!(config.progression, ProgressionMode::ContinueWithDelay);
    assert!(matches!(config.validate(), Err(SequencerError::Config(_))));
}
