//! # Bluetooth LE Transport Module
//!
//! btleplug-backed [`DeviceAdapter`] for the IMU boards.
//!
//! ## Protocol
//! The board exposes one GATT characteristic holding its latest reading as a
//! short text or JSON payload. There is no notification stream, so the link
//! is polled at `poll_interval_ms` (10 Hz by default) until the peripheral
//! reports it is no longer connected.

use crate::config::Config;
use crate::device::{DeviceAdapter, DiscoveredDevice, PayloadStream};
use crate::error::{ConnectionError, ScanError};
use async_trait::async_trait;
use btleplug::api::{Central, Characteristic, Manager as _, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Manager, Peripheral};
use std::time::Duration;
use tokio::time::{Interval, MissedTickBehavior};

pub struct BleAdapter {
    name_filter: String,
    service_uuid: String,
    characteristic_uuid: String,
    poll_interval: Duration,
    connect_scan_window: Duration,
}

impl BleAdapter {
    pub fn new(config: &Config) -> Self {
        Self {
            name_filter: config.device_name_filter.clone(),
            service_uuid: config.service_uuid.to_ascii_lowercase(),
            characteristic_uuid: config.characteristic_uuid.to_ascii_lowercase(),
            poll_interval: config.poll_interval(),
            connect_scan_window: config.scan_timeout(),
        }
    }

    async fn central() -> Result<Adapter, ScanError> {
        let manager = Manager::new()
            .await
            .map_err(|e| ScanError::ManagerInit(e.to_string()))?;

        let adapters = manager
            .adapters()
            .await
            .map_err(|e| ScanError::ScanFailed(e.to_string()))?;

        adapters.into_iter().next().ok_or(ScanError::NoAdapters)
    }

    async fn scan(central: &Adapter, window: Duration) -> Result<Vec<Peripheral>, ScanError> {
        central
            .start_scan(ScanFilter::default())
            .await
            .map_err(|e| ScanError::ScanFailed(format!("Failed to start scan: {}", e)))?;

        tokio::time::sleep(window).await;

        central
            .stop_scan()
            .await
            .map_err(|e| ScanError::ScanFailed(format!("Failed to stop scan: {}", e)))?;

        central
            .peripherals()
            .await
            .map_err(|e| ScanError::ScanFailed(format!("Failed to get peripherals: {}", e)))
    }

    async fn find_peripheral(central: &Adapter, address: &str) -> Option<Peripheral> {
        let peripherals = central.peripherals().await.ok()?;
        peripherals
            .into_iter()
            .find(|p| address_matches(&p.address().to_string(), address))
    }

    fn find_characteristic(&self, peripheral: &Peripheral) -> Option<Characteristic> {
        peripheral.characteristics().into_iter().find(|c| {
            c.uuid.to_string() == self.characteristic_uuid
                && c.service_uuid.to_string() == self.service_uuid
        })
    }
}

#[async_trait]
impl DeviceAdapter for BleAdapter {
    async fn discover(&self, timeout: Duration) -> Result<Vec<DiscoveredDevice>, ScanError> {
        let central = Self::central().await?;
        let peripherals = Self::scan(&central, timeout).await?;

        let mut devices = Vec::new();
        for peripheral in peripherals {
            if let Ok(Some(props)) = peripheral.properties().await {
                if let Some(local_name) = props.local_name {
                    if name_matches(&local_name, &self.name_filter) {
                        devices.push(DiscoveredDevice::new(
                            peripheral.address().to_string(),
                            local_name,
                            props.rssi,
                        ));
                    }
                }
            }
        }

        log::info!("Discovered {} IMU device(s)", devices.len());
        Ok(devices)
    }

    async fn connect(&self, address: &str) -> Result<Box<dyn PayloadStream>, ConnectionError> {
        let central = Self::central().await.map_err(|_| ConnectionError::NoAdapter)?;

        let peripheral = match Self::find_peripheral(&central, address).await {
            Some(p) => p,
            None => {
                // Not seen yet in this process; give it one scan window
                log::debug!("Device {} not cached, scanning", address);
                Self::scan(&central, self.connect_scan_window)
                    .await
                    .map_err(|e| ConnectionError::DeviceConnection {
                        device_id: address.to_string(),
                        reason: e.to_string(),
                    })?;
                Self::find_peripheral(&central, address)
                    .await
                    .ok_or_else(|| ConnectionError::DeviceNotFound(address.to_string()))?
            }
        };

        let link_error = |e: btleplug::Error| ConnectionError::DeviceConnection {
            device_id: address.to_string(),
            reason: e.to_string(),
        };

        peripheral.connect().await.map_err(link_error)?;
        peripheral.discover_services().await.map_err(link_error)?;

        let Some(characteristic) = self.find_characteristic(&peripheral) else {
            let _ = peripheral.disconnect().await;
            return Err(ConnectionError::CharacteristicMissing {
                device_id: address.to_string(),
            });
        };

        log::info!("Connected to {}", address);

        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        Ok(Box::new(BlePayloadStream {
            address: address.to_string(),
            peripheral,
            characteristic,
            interval,
        }))
    }
}

struct BlePayloadStream {
    address: String,
    peripheral: Peripheral,
    characteristic: Characteristic,
    interval: Interval,
}

impl BlePayloadStream {
    fn transport_error(&self, e: btleplug::Error) -> ConnectionError {
        ConnectionError::Transport {
            device_id: self.address.clone(),
            reason: e.to_string(),
        }
    }
}

#[async_trait]
impl PayloadStream for BlePayloadStream {
    async fn next_payload(&mut self) -> Result<Option<Vec<u8>>, ConnectionError> {
        match self.peripheral.is_connected().await {
            Ok(true) => {}
            Ok(false) => return Ok(None),
            Err(e) => return Err(self.transport_error(e)),
        }

        self.interval.tick().await;

        match self.peripheral.read(&self.characteristic).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) => Err(self.transport_error(e)),
        }
    }

    async fn disconnect(&mut self) {
        if let Err(e) = self.peripheral.disconnect().await {
            log::warn!("Error disconnecting {}: {}", self.address, e);
        }
    }
}

fn name_matches(local_name: &str, filter: &str) -> bool {
    local_name.to_lowercase().contains(&filter.to_lowercase())
}

fn address_matches(a: &str, b: &str) -> bool {
    a.trim().eq_ignore_ascii_case(b.trim())
}
