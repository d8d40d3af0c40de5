//! # Connection Management Module
//!
//! Owns the live device connections and the task that drains each one.
//!
//! ## Key Components
//! - `ConnectionManager`: registry keyed by device address
//! - one streaming task per device: read payload → parse → stamp → append
//! - per-connection atomic stop flags for prompt, clean disconnection
//!
//! ## Fault Isolation
//! Read and parse failures never leave the streaming task. They are logged
//! and the task backs off for `retry_backoff_ms` before reading again. The
//! task only ends when the device goes away or a stop is requested.

use crate::device::{DeviceAdapter, DiscoveredDevice, PayloadStream};
use crate::error::{ConnectionError, ScanError};
use crate::parser::parse_payload;
use crate::sample::SampleClock;
use crate::session::{normalize_address, SessionStore};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

const STOP_POLL_INTERVAL: Duration = Duration::from_millis(50);

type Registry = Arc<Mutex<HashMap<String, DeviceConnection>>>;

struct DeviceConnection {
    id: u64,
    connected_at: DateTime<Utc>,
    should_stop: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionInfo {
    pub address: String,
    pub connected_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectResponse {
    pub status: &'static str,
    pub message: String,
}

/// Manages the connection lifecycle for IMU devices.
///
/// Each connection gets its own streaming task and stop flag. The task
/// removes its registry entry itself when the device goes away.
pub struct ConnectionManager {
    adapter: Arc<dyn DeviceAdapter>,
    store: Arc<SessionStore>,
    clock: Arc<SampleClock>,
    retry_backoff: Duration,
    connections: Registry,
    next_id: AtomicU64,
}

impl ConnectionManager {
    pub fn new(
        adapter: Arc<dyn DeviceAdapter>,
        store: Arc<SessionStore>,
        retry_backoff: Duration,
    ) -> Self {
        Self {
            adapter,
            store,
            clock: Arc::new(SampleClock::new()),
            retry_backoff,
            connections: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
        }
    }

    pub async fn discover(&self, timeout: Duration) -> Result<Vec<DiscoveredDevice>, ScanError> {
        self.adapter.discover(timeout).await
    }

    /// Connect to `address` and start streaming its payloads into the store.
    ///
    /// Connecting to an address that already has a live connection succeeds
    /// without touching it.
    pub async fn connect(&self, address: &str) -> Result<ConnectResponse, ConnectionError> {
        let address = normalize_address(address);

        if self.is_connected(&address) {
            return Ok(already_connected(&address));
        }

        log::info!("Connecting to device: {}", address);
        let stream = self.adapter.connect(&address).await?;

        // Someone else may have connected while we were waiting on the link
        let rejected = {
            let mut connections = lock(&self.connections);
            if connections.contains_key(&address) {
                Some(stream)
            } else {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                let should_stop = Arc::new(AtomicBool::new(false));
                let task = StreamTask {
                    id,
                    address: address.clone(),
                    store: self.store.clone(),
                    clock: self.clock.clone(),
                    retry_backoff: self.retry_backoff,
                    should_stop: should_stop.clone(),
                    registry: self.connections.clone(),
                };

                connections.insert(
                    address.clone(),
                    DeviceConnection {
                        id,
                        connected_at: Utc::now(),
                        should_stop,
                        task: tokio::spawn(run_stream(task, stream)),
                    },
                );
                None
            }
        };

        if let Some(mut stream) = rejected {
            stream.disconnect().await;
            return Ok(already_connected(&address));
        }

        Ok(ConnectResponse {
            status: "connected",
            message: format!("Connected to {}", address),
        })
    }

    /// Stop streaming from `address` and wait for its task to wind down.
    pub async fn disconnect(&self, address: &str) -> Result<ConnectResponse, ConnectionError> {
        let address = normalize_address(address);

        let connection = lock(&self.connections)
            .remove(&address)
            .ok_or_else(|| ConnectionError::NotConnected(address.clone()))?;

        log::info!("Disconnect requested for {}", address);
        connection.should_stop.store(true, Ordering::Relaxed);
        if let Err(e) = connection.task.await {
            log::warn!("Streaming task for {} ended abnormally: {}", address, e);
        }

        Ok(ConnectResponse {
            status: "disconnected",
            message: format!("Disconnected from {}", address),
        })
    }

    /// Stop every streaming task. Used on process shutdown.
    pub async fn shutdown(&self) {
        let connections: Vec<(String, DeviceConnection)> = lock(&self.connections).drain().collect();

        for (_, connection) in &connections {
            connection.should_stop.store(true, Ordering::Relaxed);
        }
        for (address, connection) in connections {
            if let Err(e) = connection.task.await {
                log::warn!("Streaming task for {} ended abnormally: {}", address, e);
            }
        }

        log::info!("Connection manager shut down");
    }

    pub fn is_connected(&self, address: &str) -> bool {
        lock(&self.connections).contains_key(&normalize_address(address))
    }

    pub fn connected_devices(&self) -> Vec<ConnectionInfo> {
        let mut devices: Vec<ConnectionInfo> = lock(&self.connections)
            .iter()
            .map(|(address, connection)| ConnectionInfo {
                address: address.clone(),
                connected_at: connection.connected_at,
            })
            .collect();
        devices.sort_by(|a, b| a.address.cmp(&b.address));
        devices
    }
}

fn lock(registry: &Registry) -> std::sync::MutexGuard<'_, HashMap<String, DeviceConnection>> {
    registry.lock().unwrap_or_else(|e| e.into_inner())
}

fn already_connected(address: &str) -> ConnectResponse {
    ConnectResponse {
        status: "already_connected",
        message: format!("Already connected to {}", address),
    }
}

struct StreamTask {
    id: u64,
    address: String,
    store: Arc<SessionStore>,
    clock: Arc<SampleClock>,
    retry_backoff: Duration,
    should_stop: Arc<AtomicBool>,
    registry: Registry,
}

async fn wait_for_stop(should_stop: &AtomicBool) {
    while !should_stop.load(Ordering::Relaxed) {
        tokio::time::sleep(STOP_POLL_INTERVAL).await;
    }
}

/// Sleep for `backoff` unless a stop arrives first. Returns true if stopped.
async fn back_off(backoff: Duration, should_stop: &AtomicBool) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(backoff) => false,
        _ = wait_for_stop(should_stop) => true,
    }
}

async fn run_stream(task: StreamTask, mut stream: Box<dyn PayloadStream>) {
    let mut received = 0u64;

    loop {
        let next = tokio::select! {
            result = stream.next_payload() => result,
            _ = wait_for_stop(&task.should_stop) => {
                log::debug!("Stopping stream for {}", task.address);
                break;
            }
        };

        match next {
            Ok(Some(bytes)) => match parse_payload(&bytes, task.clock.now()) {
                Ok(sample) => {
                    let delivered = task.store.append_sample(&task.address, sample);
                    received += 1;
                    log::trace!("Sample from {} delivered to {} test(s)", task.address, delivered);
                }
                Err(e) => {
                    log::warn!("Discarding payload from {}: {}", task.address, e);
                    if back_off(task.retry_backoff, &task.should_stop).await {
                        break;
                    }
                }
            },
            Ok(None) => {
                log::info!("Device {} disconnected", task.address);
                break;
            }
            Err(e) => {
                log::warn!("{}; retrying in {:?}", e, task.retry_backoff);
                if back_off(task.retry_backoff, &task.should_stop).await {
                    break;
                }
            }
        }
    }

    stream.disconnect().await;

    // Only drop our own entry; a reconnect may already have replaced it
    let mut connections = lock(&task.registry);
    if connections.get(&task.address).map(|c| c.id) == Some(task.id) {
        connections.remove(&task.address);
    }
    drop(connections);

    log::info!("Stream for {} closed after {} samples", task.address, received);
}
