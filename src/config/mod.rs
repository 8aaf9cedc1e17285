//! Configuration management for Alcove
//!
//! This module handles loading, parsing, and validating configuration
//! from TOML files. It combines settings for the embedded output, repaint
//! synchronization, input forwarding, and the listening socket.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Main configuration struct containing all Alcove settings
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AlcoveConfig {
    /// Embedded output (render target) settings
    #[serde(default)]
    pub output: OutputConfig,

    /// Repaint / frame-completion synchronization
    #[serde(default)]
    pub repaint: RepaintConfig,

    /// Input forwarding settings
    #[serde(default)]
    pub input: InputConfig,

    /// Listening socket settings
    #[serde(default)]
    pub socket: SocketConfig,

    /// Logging settings
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Embedded output configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutputConfig {
    /// Initial output width in pixels
    #[serde(default = "default_output_width")]
    pub width: u32,

    /// Initial output height in pixels
    #[serde(default = "default_output_height")]
    pub height: u32,

    /// Advertised refresh rate in millihertz
    #[serde(default = "default_refresh_mhz")]
    pub refresh_mhz: u32,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            width: default_output_width(),
            height: default_output_height(),
            refresh_mhz: default_refresh_mhz(),
        }
    }
}

fn default_output_width() -> u32 {
    1280
}

fn default_output_height() -> u32 {
    720
}

fn default_refresh_mhz() -> u32 {
    60_000
}

/// Repaint synchronization configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RepaintConfig {
    /// Upper bound in milliseconds before a pending repaint is finished
    /// without the host's post-render hook
    #[serde(default = "default_fallback_ms")]
    pub fallback_ms: u64,
}

impl Default for RepaintConfig {
    fn default() -> Self {
        Self {
            fallback_ms: default_fallback_ms(),
        }
    }
}

fn default_fallback_ms() -> u64 {
    33
}

/// Input forwarding configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InputConfig {
    /// Seat name advertised to clients
    #[serde(default = "default_seat_name")]
    pub seat_name: String,

    /// Subtracted from host key codes before forwarding (X11 to evdev offset)
    #[serde(default = "default_keycode_offset")]
    pub keycode_offset: u32,
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            seat_name: default_seat_name(),
            keycode_offset: default_keycode_offset(),
        }
    }
}

fn default_seat_name() -> String {
    "seat0".to_string()
}

fn default_keycode_offset() -> u32 {
    8
}

/// Listening socket configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SocketConfig {
    /// Export the bound socket name as WAYLAND_DISPLAY for child processes
    #[serde(default = "default_set_env")]
    pub set_env: bool,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            set_env: default_set_env(),
        }
    }
}

fn default_set_env() -> bool {
    true
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    /// Default log filter when RUST_LOG is unset (error/warn/info/debug/trace)
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl AlcoveConfig {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        // Expand ~ to home directory
        let expanded_path = if path.to_string_lossy().starts_with('~') {
            let home = std::env::var("HOME").context("Failed to get HOME environment variable")?;
            Path::new(&home).join(path.strip_prefix("~").unwrap_or(path))
        } else {
            path.to_path_buf()
        };

        let contents = fs::read_to_string(&expanded_path)
            .with_context(|| format!("Failed to read config file: {}", expanded_path.display()))?;

        let config: AlcoveConfig = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", expanded_path.display()))?;

        config.validate()?;

        Ok(config)
    }

    /// Load configuration from a file, falling back to defaults when absent
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Self {
        match Self::load(path.as_ref()) {
            Ok(config) => config,
            Err(e) => {
                log::warn!(
                    "Using default configuration ({}: {})",
                    path.as_ref().display(),
                    e
                );
                Self::default()
            }
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.output.width == 0 || self.output.height == 0 {
            anyhow::bail!("Invalid output size: width and height must be non-zero");
        }

        if self.output.refresh_mhz == 0 {
            anyhow::bail!("Invalid refresh_mhz: must be non-zero");
        }

        if self.repaint.fallback_ms == 0 {
            anyhow::bail!("Invalid fallback_ms: must be at least 1");
        }

        if self.input.seat_name.is_empty() {
            anyhow::bail!("Invalid seat_name: must not be empty");
        }

        let valid_levels = ["off", "error", "warn", "info", "debug", "trace"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            anyhow::bail!("Invalid log level: {}", self.logging.level);
        }

        Ok(())
    }

    /// Save configuration to a TOML file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let contents = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        fs::write(path, contents).context("Failed to write configuration file")?;

        Ok(())
    }
}

#[cfg(test)]
mod tests;
