//! IMU test recorder.
//!
//! Collects readings from BLE inertial sensors, groups them into tests made
//! of named exercises, and exports each exercise as CSV with the whole test
//! bundled into one zip archive.

pub mod ble;
pub mod config;
pub mod connection;
pub mod device;
pub mod error;
pub mod export;
pub mod http;
pub mod lifecycle;
pub mod parser;
pub mod sample;
pub mod session;
pub mod units;

pub use config::Config;
pub use connection::ConnectionManager;
pub use export::ExportPipeline;
pub use lifecycle::LifecycleController;
pub use session::SessionStore;
