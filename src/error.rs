//! # Error Types Module
//!
//! Centralized error handling for the recorder.
//! One error type per concern, with context and error chaining.
//!
//! ## Error Types
//! - `ConnectionError`: device connect, transport and registry failures
//! - `ScanError`: Bluetooth device discovery errors
//! - `ConfigError`: configuration file I/O and parsing errors
//! - `ParseError`: payloads that cannot be decoded at all
//! - `ExportError`: CSV and archive writing failures
//! - `SessionError`: lifecycle failures reported to callers
//!
//! ## Propagation
//! Transport and parse faults stay inside the device streaming task and are
//! only logged. Export faults surface through `SessionError::Export` to the
//! caller of the lifecycle transition that triggered them.

use std::fmt;
use std::path::PathBuf;

/// Errors that can occur while connecting to or reading from a device
#[derive(Debug)]
pub enum ConnectionError {
    /// Bluetooth adapter not found or not available
    NoAdapter,
    /// No peripheral with this address was seen
    DeviceNotFound(String),
    /// Failed to connect to specific device
    DeviceConnection { device_id: String, reason: String },
    /// The IMU characteristic is not exposed by the device
    CharacteristicMissing { device_id: String },
    /// No live connection exists for this address
    NotConnected(String),
    /// A read on a live connection failed
    Transport { device_id: String, reason: String },
}

impl ConnectionError {
    pub fn status_tag(&self) -> &'static str {
        match self {
            ConnectionError::NotConnected(_) => "not_connected",
            ConnectionError::DeviceNotFound(_) => "not_found",
            _ => "connection_failed",
        }
    }
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionError::NoAdapter => {
                write!(f, "No Bluetooth adapter found. Please ensure Bluetooth is enabled.")
            }
            ConnectionError::DeviceNotFound(address) => {
                write!(f, "Device {} was not found", address)
            }
            ConnectionError::DeviceConnection { device_id, reason } => {
                write!(f, "Failed to connect to device {}: {}", device_id, reason)
            }
            ConnectionError::CharacteristicMissing { device_id } => {
                write!(f, "Device {} does not expose the IMU characteristic", device_id)
            }
            ConnectionError::NotConnected(address) => {
                write!(f, "Not connected to {}", address)
            }
            ConnectionError::Transport { device_id, reason } => {
                write!(f, "Read from device {} failed: {}", device_id, reason)
            }
        }
    }
}

impl std::error::Error for ConnectionError {}

/// Errors that can occur during configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// Failed to read config file
    ReadFailed(std::io::Error),
    /// Failed to write config file
    WriteFailed(std::io::Error),
    /// Failed to parse config file
    ParseFailed(toml::de::Error),
    /// Failed to serialize config
    SerializeFailed(toml::ser::Error),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::ReadFailed(e) => {
                write!(f, "Failed to read config file: {}", e)
            }
            ConfigError::WriteFailed(e) => {
                write!(f, "Failed to write config file: {}", e)
            }
            ConfigError::ParseFailed(e) => {
                write!(f, "Failed to parse config file: {}", e)
            }
            ConfigError::SerializeFailed(e) => {
                write!(f, "Failed to serialize config: {}", e)
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::ReadFailed(e) => Some(e),
            ConfigError::WriteFailed(e) => Some(e),
            ConfigError::ParseFailed(e) => Some(e),
            ConfigError::SerializeFailed(e) => Some(e),
        }
    }
}

/// Errors that can occur during device scanning
#[derive(Debug, Clone)]
pub enum ScanError {
    /// Bluetooth manager initialization failed
    ManagerInit(String),
    /// No Bluetooth adapters available
    NoAdapters,
    /// Scan operation failed
    ScanFailed(String),
}

impl fmt::Display for ScanError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScanError::ManagerInit(msg) => {
                write!(f, "Failed to initialize Bluetooth manager: {}", msg)
            }
            ScanError::NoAdapters => {
                write!(f, "No Bluetooth adapters found")
            }
            ScanError::ScanFailed(msg) => {
                write!(f, "Scan operation failed: {}", msg)
            }
        }
    }
}

impl std::error::Error for ScanError {}

/// A payload that could not be decoded into a sample at all.
///
/// Malformed individual fields never produce this; they fall back to zero.
#[derive(Debug)]
pub enum ParseError {
    Empty,
    InvalidUtf8(std::str::Utf8Error),
    InvalidJson(serde_json::Error),
    NotAnObject,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::Empty => write!(f, "Payload is empty"),
            ParseError::InvalidUtf8(e) => write!(f, "Payload is not valid UTF-8: {}", e),
            ParseError::InvalidJson(e) => write!(f, "Payload is not valid JSON: {}", e),
            ParseError::NotAnObject => write!(f, "JSON payload is not an object"),
        }
    }
}

impl std::error::Error for ParseError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ParseError::InvalidUtf8(e) => Some(e),
            ParseError::InvalidJson(e) => Some(e),
            _ => None,
        }
    }
}

/// Errors raised while persisting exercise data
#[derive(Debug)]
pub enum ExportError {
    /// Failed to create the per-test directory
    CreateDir { path: PathBuf, source: std::io::Error },
    /// CSV serialization failed
    Csv(csv::Error),
    /// Plain file I/O failed (rename, copy, flush)
    Io(std::io::Error),
    /// Archive could not be assembled
    Archive(zip::result::ZipError),
    /// The background writer is gone
    WorkerUnavailable,
}

impl fmt::Display for ExportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExportError::CreateDir { path, source } => {
                write!(f, "Failed to create directory {}: {}", path.display(), source)
            }
            ExportError::Csv(e) => write!(f, "Failed to write CSV: {}", e),
            ExportError::Io(e) => write!(f, "Export I/O failed: {}", e),
            ExportError::Archive(e) => write!(f, "Failed to build archive: {}", e),
            ExportError::WorkerUnavailable => write!(f, "Export worker is not running"),
        }
    }
}

impl std::error::Error for ExportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ExportError::CreateDir { source, .. } => Some(source),
            ExportError::Csv(e) => Some(e),
            ExportError::Io(e) => Some(e),
            ExportError::Archive(e) => Some(e),
            ExportError::WorkerUnavailable => None,
        }
    }
}

impl From<csv::Error> for ExportError {
    fn from(e: csv::Error) -> Self {
        ExportError::Csv(e)
    }
}

impl From<std::io::Error> for ExportError {
    fn from(e: std::io::Error) -> Self {
        ExportError::Io(e)
    }
}

impl From<zip::result::ZipError> for ExportError {
    fn from(e: zip::result::ZipError) -> Self {
        ExportError::Archive(e)
    }
}

/// Failures of lifecycle transitions, reported to the caller
#[derive(Debug)]
pub enum SessionError {
    /// Unknown test id (or no archive for it)
    NotFound(String),
    /// The test already ended
    Closed(String),
    /// Persisting the flush or archive failed; state was left untouched
    Export(ExportError),
}

impl SessionError {
    /// Stable tag for user-visible responses
    pub fn status_tag(&self) -> &'static str {
        match self {
            SessionError::NotFound(_) => "not_found",
            SessionError::Closed(_) => "session_closed",
            SessionError::Export(_) => "export_failed",
        }
    }
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::NotFound(test_id) => write!(f, "Test {} not found", test_id),
            SessionError::Closed(test_id) => write!(f, "Test {} is already closed", test_id),
            SessionError::Export(e) => write!(f, "Export failed: {}", e),
        }
    }
}

impl std::error::Error for SessionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SessionError::Export(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ExportError> for SessionError {
    fn from(e: ExportError) -> Self {
        SessionError::Export(e)
    }
}
