//! # beaconwatch
//!
//! Adapters and wiring for the beaconwatch BLE presence daemon.
//!
//! This library provides the BlueZ observation source, the MQTT message bus,
//! logging and signal setup, and the command-line definition used by the
//! `beaconwatch` binary.

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]

pub mod app;
pub mod cli;
pub mod logging;
pub mod mqtt;
pub mod scanner;
pub mod signals;
