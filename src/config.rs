//! # Host Configuration
//!
//! Serial link, job streaming and interpreter options, loaded from a single TOML file.
//!
//! ## Example: TOML Configuration
//!
//! ```toml
//! [machine]
//! port = "/dev/ttyUSB0"
//! baud = 115200
//!
//! [streamer]
//! poll_interval_ms = 200
//! settings_refresh_delay_ms = 500
//! ack_timeout_ms = 0
//!
//! [interpreter]
//! arc_segment_length = 0.5
//! min_arc_segments = 6
//! max_arc_segments = 10000
//! ```
//!
//! Every section and field is optional; missing values fall back to the defaults above.

// src/config.rs - Single configuration file
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::gcode::interpreter::InterpreterConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Main configuration struct for the machine link, the job streamer and the interpreter.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub machine: MachineConfig,
    #[serde(default)]
    pub streamer: StreamerConfig,
    #[serde(default)]
    pub interpreter: InterpreterConfig,
}

/// Serial port of the GRBL controller.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MachineConfig {
    #[serde(default)]
    pub port: String,
    #[serde(default = "default_baud")]
    pub baud: u32,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            port: "".to_string(),
            baud: default_baud(),
        }
    }
}

/// Status polling and job streaming timings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StreamerConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_settings_refresh_delay_ms")]
    pub settings_refresh_delay_ms: u64,
    /// 0 waits forever for each acknowledgment.
    #[serde(default)]
    pub ack_timeout_ms: u64,
}

impl Default for StreamerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            settings_refresh_delay_ms: default_settings_refresh_delay_ms(),
            ack_timeout_ms: 0,
        }
    }
}

impl StreamerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn settings_refresh_delay(&self) -> Duration {
        Duration::from_millis(self.settings_refresh_delay_ms)
    }

    pub fn ack_timeout(&self) -> Option<Duration> {
        (self.ack_timeout_ms > 0).then(|| Duration::from_millis(self.ack_timeout_ms))
    }
}

impl Config {
    /// Validate value ranges that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.machine.baud == 0 {
            return Err(ConfigError::Invalid("machine.baud must be > 0".to_string()));
        }
        if self.streamer.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid("streamer.poll_interval_ms must be > 0".to_string()));
        }
        if !(self.interpreter.arc_segment_length > 0.0) {
            return Err(ConfigError::Invalid("interpreter.arc_segment_length must be > 0".to_string()));
        }
        if self.interpreter.min_arc_segments == 0 {
            return Err(ConfigError::Invalid("interpreter.min_arc_segments must be >= 1".to_string()));
        }
        if self.interpreter.max_arc_segments < self.interpreter.min_arc_segments {
            return Err(ConfigError::Invalid(
                "interpreter.max_arc_segments must be >= min_arc_segments".to_string(),
            ));
        }
        Ok(())
    }
}

// Default value functions
fn default_baud() -> u32 { 115200 }
fn default_poll_interval_ms() -> u64 { 200 }
fn default_settings_refresh_delay_ms() -> u64 { 500 }

/// Load configuration from a TOML file at the given path.
pub fn load_config(path: &str) -> Result<Config, ConfigError> {
    let config: Config = match std::fs::read_to_string(path) {
        Ok(contents) => match toml::from_str(&contents) {
            Ok(config) => config,
            Err(e) => {
                tracing::error!("Failed to parse config TOML: {}", e);
                return Err(ConfigError::Toml(e));
            }
        },
        Err(e) => {
            tracing::error!("Failed to read config file '{}': {}", path, e);
            return Err(ConfigError::Io(e));
        }
    };
    config.validate()?;
    Ok(config)
}
