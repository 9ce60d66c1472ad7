//! # beaconwatch
//!
//! BLE presence daemon: smooths beacon RSSI, debounces presence and publishes
//! it to MQTT.
//!
//! ## Running
//!
//! ```bash
//! # Track configured devices
//! beaconwatch --config /etc/beaconwatch/config.yaml scan
//!
//! # Derive calibration constants for one beacon
//! beaconwatch calibrate -d AA:BB:CC:DD:EE:FF
//!
//! # Under systemd, with JSON log files
//! beaconwatch --log-dir /var/log/beaconwatch
//! ```

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]

use std::process::ExitCode;

use beaconwatch::{app, cli::Cli, logging};
use beaconwatch_core::{EXIT_FAILURE, EXIT_OK};
use clap::Parser;
use tracing::{error, info};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = logging::init(cli.verbose, cli.log_dir.as_deref()) {
        eprintln!("Failed to initialize logging: {e:#}");
        return exit_code(EXIT_FAILURE);
    }

    info!(version = env!("CARGO_PKG_VERSION"), "Starting beaconwatch");

    match app::run(cli).await {
        Ok(()) => {
            info!("Shutdown complete");
            exit_code(EXIT_OK)
        }
        Err(e) => {
            error!(code = e.error_code(), "{e}");
            exit_code(e.exit_code())
        }
    }
}

fn exit_code(code: i32) -> ExitCode {
    u8::try_from(code).map_or(ExitCode::FAILURE, ExitCode::from)
}
