//! # beaconwatch-core
//!
//! Core logic for the beaconwatch BLE presence daemon.
//!
//! This crate provides:
//! - RSSI smoothing with a scalar Kalman filter
//! - Log-distance path-loss distance estimation
//! - Debounced per-device presence tracking
//! - Resilient publishing of presence messages to a message bus
//! - A calibration mode for deriving per-device constants
//!
//! ## Architecture
//!
//! The crate is organized into the following modules:
//!
//! - [`filter`] - One-dimensional Kalman filter over RSSI samples
//! - [`distance`] - Path-loss distance and calibration estimates
//! - [`discovery`] - The BLE discovery seam and per-window collection
//! - [`tracker`] - Device registry and miss-count debouncing
//! - [`bus`] - The message bus seam
//! - [`publisher`] - Topic routing, retry, circuit breaking and queueing
//! - [`runner`] - The scan-evaluate-publish loop
//! - [`calibrator`] - Live measured-power and exponent estimates
//! - [`config`] - Configuration loading and validation
//! - [`shutdown`] - Cooperative shutdown token
//! - [`error`] - Unified error types for the crate
//! - [`types`] - Device ids, observations and presence messages
//!
//! Hardware and network access live behind the [`discovery::ObservationSource`]
//! and [`bus::MessageBus`] traits; the `beaconwatch` binary provides the BlueZ
//! and MQTT implementations.

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![warn(missing_docs)]

pub mod bus;
pub mod calibrator;
pub mod config;
pub mod discovery;
pub mod distance;
pub mod error;
pub mod filter;
pub mod publisher;
pub mod runner;
pub mod shutdown;
pub mod tracker;
pub mod types;

#[cfg(test)]
mod mock;

// Re-export primary types for convenience
pub use bus::{BusError, BusResult, MessageBus, QualityOfService};
pub use calibrator::{CalibrationReading, Calibrator};
pub use config::{
    Calibration, CalibrateConfig, Config, ConfigError, ConfigResult, DeviceConfig, MqttConfig,
    PublisherConfig, ScannerConfig,
};
pub use discovery::{collect_cycle, ObservationSource, ScanCycle, ScanError, ScanResult};
pub use distance::{distance_meters, UNKNOWN_DISTANCE};
pub use error::{BeaconError, Error, Result, EXIT_CONFIG, EXIT_FAILURE, EXIT_OK};
pub use filter::{FilterBank, RssiFilter};
pub use publisher::{PublishOutcome, Publisher, RetryPolicy};
pub use runner::{run_scan, RunStats, ScanSettings};
pub use shutdown::{Shutdown, ShutdownTrigger};
pub use tracker::{PresenceState, PresenceTracker};
pub use types::{is_valid_device_id, DeviceId, Emission, Observation, PresenceMessage};
