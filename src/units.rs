//! Raw-to-SI conversion applied once per flush.
//!
//! Raw samples and converted rows are distinct types, so a converted batch
//! cannot be fed through the converter again.

use crate::sample::{Sample, Vector3};
use chrono::{DateTime, Utc};

/// Standard gravity, m/s² per g
pub const STANDARD_GRAVITY: f64 = 9.80665;

/// rad/s per deg/s
pub const DEG_TO_RAD: f64 = std::f64::consts::PI / 180.0;

/// A sample in export units: acceleration in m/s², angular rate in rad/s.
/// Magnetometer and battery are passed through untouched.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConvertedRow {
    pub acc: Vector3,
    pub gyr: Vector3,
    pub mag: Option<Vector3>,
    pub battery: u8,
    pub timestamp: DateTime<Utc>,
}

impl From<&Sample> for ConvertedRow {
    fn from(sample: &Sample) -> Self {
        Self {
            acc: sample.acc.scaled(STANDARD_GRAVITY),
            gyr: sample.gyr.scaled(DEG_TO_RAD),
            mag: sample.mag,
            battery: sample.battery,
            timestamp: sample.timestamp,
        }
    }
}

/// Convert a buffered batch, preserving order.
pub fn convert_samples(samples: &[Sample]) -> Vec<ConvertedRow> {
    samples.iter().map(ConvertedRow::from).collect()
}
