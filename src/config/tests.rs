//! Unit tests for configuration module
//!
//! Tests configuration parsing, validation, serialization/deserialization,
//! and edge cases in configuration handling.

use super::*;
use anyhow::Result;
use tempfile::tempdir;

#[test]
fn test_default_configuration_is_valid() {
    let config = AlcoveConfig::default();

    assert!(config.output.width > 0);
    assert!(config.output.height > 0);
    assert!(config.output.refresh_mhz > 0);
    assert!(config.repaint.fallback_ms > 0);
    assert!(!config.input.seat_name.is_empty());
    assert_eq!(config.input.keycode_offset, 8);
    assert!(config.socket.set_env);

    assert!(config.validate().is_ok());
}

#[test]
fn test_configuration_serialization_roundtrip() -> Result<()> {
    let original_config = AlcoveConfig::default();

    let toml_string = toml::to_string(&original_config)?;
    let deserialized_config: AlcoveConfig = toml::from_str(&toml_string)?;

    assert_eq!(original_config.output, deserialized_config.output);
    assert_eq!(original_config.repaint, deserialized_config.repaint);
    assert_eq!(original_config.input, deserialized_config.input);
    assert_eq!(original_config.socket, deserialized_config.socket);
    assert_eq!(original_config.logging, deserialized_config.logging);

    Ok(())
}

#[test]
fn test_configuration_from_file() -> Result<()> {
    let dir = tempdir()?;
    let file_path = dir.path().join("test_config.toml");

    let test_config = r#"
[output]
width = 1920
height = 1080
refresh_mhz = 144000

[repaint]
fallback_ms = 16

[input]
seat_name = "seat1"
keycode_offset = 0

[socket]
set_env = false

[logging]
level = "debug"
"#;
    std::fs::write(&file_path, test_config)?;

    let config = AlcoveConfig::load(&file_path)?;
    assert_eq!(config.output.width, 1920);
    assert_eq!(config.output.height, 1080);
    assert_eq!(config.output.refresh_mhz, 144_000);
    assert_eq!(config.repaint.fallback_ms, 16);
    assert_eq!(config.input.seat_name, "seat1");
    assert_eq!(config.input.keycode_offset, 0);
    assert!(!config.socket.set_env);
    assert_eq!(config.logging.level, "debug");

    Ok(())
}

#[test]
fn test_partial_configuration_uses_defaults() -> Result<()> {
    let dir = tempdir()?;
    let file_path = dir.path().join("partial.toml");

    std::fs::write(
        &file_path,
        r#"
[output]
width = 800
height = 600
"#,
    )?;

    let config = AlcoveConfig::load(&file_path)?;
    assert_eq!(config.output.width, 800);
    assert_eq!(config.output.height, 600);
    // Everything unspecified falls back to defaults
    assert_eq!(config.output.refresh_mhz, 60_000);
    assert_eq!(config.repaint.fallback_ms, 33);
    assert_eq!(config.input.seat_name, "seat0");
    assert_eq!(config.logging.level, "info");

    Ok(())
}

#[test]
fn test_validation_rejects_zero_output_size() {
    let mut config = AlcoveConfig::default();
    config.output.width = 0;
    assert!(config.validate().is_err());

    let mut config = AlcoveConfig::default();
    config.output.height = 0;
    assert!(config.validate().is_err());
}

#[test]
fn test_validation_rejects_zero_fallback() {
    let mut config = AlcoveConfig::default();
    config.repaint.fallback_ms = 0;
    assert!(config.validate().is_err());
}

#[test]
fn test_validation_rejects_empty_seat_name() {
    let mut config = AlcoveConfig::default();
    config.input.seat_name = String::new();
    assert!(config.validate().is_err());
}

#[test]
fn test_validation_rejects_unknown_log_level() {
    let mut config = AlcoveConfig::default();
    config.logging.level = "verbose".to_string();
    assert!(config.validate().is_err());
}

#[test]
fn test_load_rejects_invalid_values() -> Result<()> {
    let dir = tempdir()?;
    let file_path = dir.path().join("bad.toml");

    std::fs::write(
        &file_path,
        r#"
[output]
width = 0
height = 720
"#,
    )?;

    assert!(AlcoveConfig::load(&file_path).is_err());

    Ok(())
}

#[test]
fn test_load_missing_file_fails() {
    let result = AlcoveConfig::load("/nonexistent/path/alcove.toml");
    assert!(result.is_err());
}

#[test]
fn test_load_or_default_falls_back() {
    let config = AlcoveConfig::load_or_default("/nonexistent/path/alcove.toml");
    assert_eq!(config.output.width, default_output_width());
}

#[test]
fn test_save_and_reload() -> Result<()> {
    let dir = tempdir()?;
    let file_path = dir.path().join("saved.toml");

    let mut config = AlcoveConfig::default();
    config.output.width = 2560;
    config.repaint.fallback_ms = 50;
    config.save(&file_path)?;

    let reloaded = AlcoveConfig::load(&file_path)?;
    assert_eq!(reloaded.output.width, 2560);
    assert_eq!(reloaded.repaint.fallback_ms, 50);

    Ok(())
}

#[test]
fn test_malformed_toml_fails() -> Result<()> {
    let dir = tempdir()?;
    let file_path = dir.path().join("malformed.toml");

    std::fs::write(&file_path, "[output\nwidth = ")?;

    assert!(AlcoveConfig::load(&file_path).is_err());

    Ok(())
}
