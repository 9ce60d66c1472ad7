//! Command-line arguments.

use std::path::PathBuf;

use beaconwatch_core::DeviceId;
use clap::{Parser, Subcommand};

/// Publish debounced BLE presence to MQTT
#[derive(Parser, Debug)]
#[command(name = "beaconwatch")]
#[command(author, version, about = "Publish debounced BLE beacon presence to MQTT")]
#[command(propagate_version = true)]
pub struct Cli {
    /// Configuration file (defaults to ./config.yaml, then the system config dir)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Log at debug level
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Also write JSON logs to daily files in this directory
    #[arg(long, global = true)]
    pub log_dir: Option<PathBuf>,

    /// Mode to run in (defaults to `scan`)
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Operating modes
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Track configured devices and publish their presence
    #[command(visible_alias = "s")]
    Scan,

    /// Print live path-loss estimates for nearby devices
    #[command(visible_alias = "c")]
    Calibrate {
        /// Only calibrate these devices (MAC address or UUID, repeatable)
        #[arg(short = 'd', long = "device", value_parser = parse_device_id)]
        devices: Vec<DeviceId>,
    },
}

impl Cli {
    /// The selected mode, falling back to `scan`.
    #[must_use]
    pub fn mode(&self) -> Command {
        self.command.clone().unwrap_or(Command::Scan)
    }
}

fn parse_device_id(value: &str) -> Result<DeviceId, String> {
    DeviceId::parse(value).ok_or_else(|| format!("'{value}' is not a MAC address or UUID"))
}
