//! Interface between the recorder and whatever transport delivers payloads.
//!
//! The BLE implementation lives in [`crate::ble`]; tests drive the
//! connection manager with scripted adapters instead.

use crate::error::{ConnectionError, ScanError};
use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;

/// A device seen during discovery
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiscoveredDevice {
    pub address: String,
    pub display_name: String,
    pub signal_strength: Option<i16>,
}

impl DiscoveredDevice {
    pub fn new(address: String, display_name: String, signal_strength: Option<i16>) -> Self {
        Self {
            address,
            display_name,
            signal_strength,
        }
    }
}

#[async_trait]
pub trait DeviceAdapter: Send + Sync {
    /// Look for IMU devices for up to `timeout`. An empty result is not an error.
    async fn discover(&self, timeout: Duration) -> Result<Vec<DiscoveredDevice>, ScanError>;

    /// Open a payload stream to the device at `address`.
    async fn connect(&self, address: &str) -> Result<Box<dyn PayloadStream>, ConnectionError>;
}

/// Live, ordered sequence of raw payloads from one device
#[async_trait]
pub trait PayloadStream: Send {
    /// Wait for the next payload.
    ///
    /// `Ok(None)` means the device went away and the stream is finished.
    /// `Err` is a transient read failure; the caller may retry.
    async fn next_payload(&mut self) -> Result<Option<Vec<u8>>, ConnectionError>;

    /// Release the underlying link. Called once when the stream is retired.
    async fn disconnect(&mut self);
}
