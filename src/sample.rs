//! # Sample Types
//!
//! One IMU reading as it comes off the wire, before unit conversion.
//! Timestamps are assigned on receipt by [`SampleClock`], which never runs
//! backwards even if the wall clock does.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Mutex;

/// Three sensor axes in whatever unit the producer reported
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Vector3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Vector3 {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    pub fn scaled(&self, factor: f64) -> Self {
        Self::new(self.x * factor, self.y * factor, self.z * factor)
    }
}

/// One raw reading as received from a device.
///
/// Accelerometer values are in g and gyroscope values in deg/s until the
/// buffer is flushed through [`crate::units::convert_samples`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Sample {
    pub acc: Vector3,
    pub gyr: Vector3,
    pub mag: Option<Vector3>,
    /// Percent, 0-100
    pub battery: u8,
    pub timestamp: DateTime<Utc>,
}

/// Wall clock that never runs backwards within the process.
///
/// Receipt timestamps from concurrent device tasks are taken from one shared
/// clock; if the system clock steps back, the last issued instant is reused.
#[derive(Debug, Default)]
pub struct SampleClock {
    last: Mutex<Option<DateTime<Utc>>>,
}

impl SampleClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn now(&self) -> DateTime<Utc> {
        let now = Utc::now();
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        let stamped = match *last {
            Some(prev) if prev > now => prev,
            _ => now,
        };
        *last = Some(stamped);
        stamped
    }
}
