//! # Configuration Management Module
//!
//! Settings for the recorder service, stored as TOML.
//! Handles loading, saving, and providing defaults for configuration options.
//!
//! ## Settings
//! - `data_dir`: root directory for per-test CSV and archive output
//! - `bind_address`: address the HTTP façade listens on
//! - `device_name_filter`: substring a device's advertised name must contain
//! - `service_uuid` / `characteristic_uuid`: GATT location of the IMU payload
//! - `scan_timeout_secs`: default discovery window
//! - `poll_interval_ms`: delay between characteristic reads
//! - `retry_backoff_ms`: pause after a failed read before retrying
//!
//! ## Storage Location
//! `$IMU_RECORDER_CONFIG` when set, otherwise:
//! - macOS: ~/Library/Application Support/imu-recorder/config.toml
//! - Linux: ~/.config/imu-recorder/config.toml
//! - Windows: %APPDATA%\imu-recorder\config.toml

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use crate::error::ConfigError;

const CONFIG_ENV_VAR: &str = "IMU_RECORDER_CONFIG";
const MIN_POLL_INTERVAL_MS: u64 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub data_dir: PathBuf,
    pub bind_address: String,
    pub device_name_filter: String,
    pub service_uuid: String,
    pub characteristic_uuid: String,
    pub scan_timeout_secs: u64,
    pub poll_interval_ms: u64,
    pub retry_backoff_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            bind_address: "0.0.0.0:8000".to_string(),
            device_name_filter: "ArduinoIMU".to_string(),
            service_uuid: "19b10000-e8f2-537e-4f6c-d104768a1214".to_string(),
            characteristic_uuid: "19b10001-e8f2-537e-4f6c-d104768a1214".to_string(),
            scan_timeout_secs: 5,
            poll_interval_ms: 100,
            retry_backoff_ms: 1000,
        }
    }
}

impl Config {
    /// Get the path to the config file
    pub fn config_path() -> PathBuf {
        if let Some(path) = std::env::var_os(CONFIG_ENV_VAR) {
            return PathBuf::from(path);
        }

        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("imu-recorder")
            .join("config.toml")
    }

    /// Load config from the default location, creating it if missing
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::config_path())
    }

    /// Load config from `path`, or write and return the defaults if it doesn't exist
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        match fs::read_to_string(path) {
            Ok(contents) => {
                let config = toml::from_str(&contents)
                    .map_err(ConfigError::ParseFailed)?;
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let config = Self::default();
                config.save_to(path)?;
                Ok(config)
            }
            Err(e) => Err(ConfigError::ReadFailed(e)),
        }
    }

    /// Save config to `path`
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(ConfigError::WriteFailed)?;
        }

        let toml_string = toml::to_string_pretty(self)
            .map_err(ConfigError::SerializeFailed)?;
        fs::write(path, toml_string)
            .map_err(ConfigError::WriteFailed)?;

        Ok(())
    }

    pub fn scan_timeout(&self) -> Duration {
        Duration::from_secs(self.scan_timeout_secs)
    }

    /// Never zero; a tokio interval cannot tick with no period.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(MIN_POLL_INTERVAL_MS))
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}
