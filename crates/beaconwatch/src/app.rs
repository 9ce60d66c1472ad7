//! Wiring of configuration, adapters and the core loops.

use std::io::Write;
use std::path::Path;

use beaconwatch_core::config::default_config_path;
use beaconwatch_core::shutdown::{self, Shutdown};
use beaconwatch_core::{
    run_scan, CalibrationReading, Calibrator, Config, DeviceId, ObservationSource,
    PresenceTracker, Publisher, Result, ScanSettings,
};
use tracing::{debug, info, warn};

use crate::cli::{Cli, Command};
use crate::mqtt::MqttBus;
use crate::scanner::BluezSource;
use crate::signals;

/// Run the mode selected on the command line until shutdown.
///
/// # Errors
///
/// Returns an error if the configuration cannot be loaded or the Bluetooth
/// adapter cannot be opened. Failures after startup are handled in place.
pub async fn run(cli: Cli) -> Result<()> {
    let path = cli.config.clone().unwrap_or_else(default_config_path);
    let config = load_config(&path)?;

    let (trigger, shutdown) = shutdown::channel();
    signals::setup_signal_handlers(trigger);

    let mut source = BluezSource::open(config.scanner.adapter.as_deref()).await?;

    match cli.mode() {
        Command::Scan => scan(&config, &mut source, shutdown).await,
        Command::Calibrate { devices } => {
            calibrate(&config, devices, &mut source, shutdown).await;
        }
    }
    Ok(())
}

fn load_config(path: &Path) -> Result<Config> {
    let config = Config::load(path)?;
    info!(
        path = %path.display(),
        devices = config.devices.len(),
        broker = %config.mqtt.broker,
        "Configuration loaded"
    );
    Ok(config)
}

async fn scan<S>(config: &Config, source: &mut S, shutdown: Shutdown)
where
    S: ObservationSource + ?Sized,
{
    let mut tracker =
        PresenceTracker::new(config.devices.clone(), config.status_interval_threshold);
    let mut publisher = Publisher::new(
        MqttBus::new(&config.mqtt),
        config.mqtt.topic.clone(),
        config.mqtt.quality_of_service(),
        config.publisher.retry_policy(),
        shutdown.clone(),
    )
    .with_change_suppression(config.publisher.suppress_unchanged);

    let settings = ScanSettings {
        window: config.scan_window(),
        buffer: config.scanner.observation_buffer,
    };
    let stats = run_scan(source, &mut tracker, &mut publisher, settings, shutdown).await;
    debug!(?stats, "Scan statistics");

    if let Err(e) = publisher.close().await {
        warn!(error = %e, "Failed to disconnect from broker");
    }
}

async fn calibrate<S>(config: &Config, devices: Vec<DeviceId>, source: &mut S, shutdown: Shutdown)
where
    S: ObservationSource + ?Sized,
{
    let mut calibrator = Calibrator::new(devices)
        .with_window(config.calibration_window())
        .with_buffer(config.scanner.observation_buffer);

    info!(
        window_secs = config.calibration_window().as_secs(),
        "Calibrating, place each beacon one meter from the adapter"
    );
    calibrator.run(source, shutdown, print_readings).await;
}

fn print_readings(readings: &[CalibrationReading]) {
    let mut stdout = std::io::stdout().lock();
    for reading in readings {
        debug!(device = %reading.id, observed_at = %reading.observed_at, "{reading}");
        if writeln!(stdout, "{}", reading.timestamped()).is_err() {
            return;
        }
    }
    let _ = stdout.flush();
}
