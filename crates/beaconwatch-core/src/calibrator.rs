//! Calibration mode: live path-loss estimates for any nearby device.
//!
//! Place a beacon one meter from the receiver and watch its line settle; the
//! `MR` column is then a good `measured_power` for the device, and `N` a
//! starting `path_loss_exponent`. The calibrator never publishes and keeps
//! no presence state.

use std::collections::HashSet;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::discovery::{collect_cycle, ObservationSource, ScanCycle};
use crate::distance::{calibration_distance, calibration_exponent};
use crate::error::BeaconError;
use crate::filter::FilterBank;
use crate::shutdown::Shutdown;
use crate::types::{DeviceId, Observation};

/// Default calibration window.
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(10);

/// One device's estimate for one window.
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationReading {
    /// Device the reading is for.
    pub id: DeviceId,
    /// Advertised name, if any.
    pub name: Option<String>,
    /// Raw RSSI retained for the window.
    pub rssi: i16,
    /// Smoothed RSSI, the live estimate of the power at one meter.
    pub measured_power: f64,
    /// Live path-loss exponent estimate.
    pub path_loss_exponent: f64,
    /// Distance from the two estimates, `-1` when undefined.
    pub distance: f64,
    /// When the window closed.
    pub observed_at: DateTime<Utc>,
}

impl fmt::Display for CalibrationReading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}), RSSI={} dB, MR={:.4}, N={:.8}, Distance={:.2}",
            self.id,
            self.name.as_deref().unwrap_or("None"),
            self.rssi,
            self.measured_power,
            self.path_loss_exponent,
            self.distance
        )
    }
}

impl CalibrationReading {
    /// The reading prefixed with the wall-clock time its window closed.
    #[must_use]
    pub fn timestamped(&self) -> String {
        format!("[{}] {self}", self.observed_at.format("%H:%M:%S"))
    }
}

/// Smooths every discovered device and derives calibration estimates.
#[derive(Debug)]
pub struct Calibrator {
    allow: HashSet<DeviceId>,
    filters: FilterBank,
    window: Duration,
    buffer: usize,
}

impl Calibrator {
    /// Calibrate every device in range, or only `allow` when non-empty.
    #[must_use]
    pub fn new(allow: impl IntoIterator<Item = DeviceId>) -> Self {
        Self {
            allow: allow.into_iter().collect(),
            filters: FilterBank::new(),
            window: DEFAULT_WINDOW,
            buffer: crate::discovery::DEFAULT_OBSERVATION_BUFFER,
        }
    }

    /// Use a different discovery window.
    #[must_use]
    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    /// Use a different observation channel capacity.
    #[must_use]
    pub fn with_buffer(mut self, buffer: usize) -> Self {
        self.buffer = buffer;
        self
    }

    /// Whether `id` passes the allow-list.
    #[must_use]
    pub fn accepts(&self, id: &DeviceId) -> bool {
        self.allow.is_empty() || self.allow.contains(id)
    }

    /// Number of devices seen so far.
    #[must_use]
    pub fn device_count(&self) -> usize {
        self.filters.len()
    }

    /// Fold one closed window into the filters and return a reading per
    /// accepted device, ordered by id.
    pub fn process(&mut self, cycle: ScanCycle) -> Vec<CalibrationReading> {
        let observed_at = Utc::now();
        let mut readings = Vec::with_capacity(cycle.len());
        for observation in cycle.into_sorted() {
            if self.accepts(&observation.id) {
                readings.push(self.reading(observation, observed_at));
            }
        }
        readings
    }

    fn reading(
        &mut self,
        observation: Observation,
        observed_at: DateTime<Utc>,
    ) -> CalibrationReading {
        let rssi = f64::from(observation.rssi);
        let smoothed_magnitude = self.filters.observe(&observation.id, rssi.abs());
        let measured_power = -smoothed_magnitude;
        let path_loss_exponent = calibration_exponent(measured_power, rssi);
        let distance = calibration_distance(rssi, measured_power, path_loss_exponent);

        CalibrationReading {
            id: observation.id,
            name: observation.name,
            rssi: observation.rssi,
            measured_power,
            path_loss_exponent,
            distance,
            observed_at,
        }
    }

    /// Run windows back to back until shutdown, handing each window's
    /// readings to `report`.
    ///
    /// A failed window is logged and retried after the same delay.
    pub async fn run<S, F>(&mut self, source: &mut S, mut shutdown: Shutdown, mut report: F)
    where
        S: ObservationSource + ?Sized,
        F: FnMut(&[CalibrationReading]) + Send,
    {
        while !shutdown.is_requested() {
            let allow = &self.allow;
            let collected = collect_cycle(source, self.window, self.buffer, |observation| {
                allow.is_empty() || allow.contains(&observation.id)
            })
            .await;

            match collected {
                Ok(cycle) => {
                    let readings = self.process(cycle);
                    debug!(
                        devices = readings.len(),
                        known = self.device_count(),
                        "Calibration window complete"
                    );
                    report(&readings);
                }
                Err(e) => {
                    let e = BeaconError::from(e);
                    warn!(code = e.error_code(), error = %e, "Calibration scan failed");
                    if !shutdown.sleep(self.window).await {
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::float_cmp)]
mod tests {
    use super::*;
    use crate::distance::UNKNOWN_DISTANCE;
    use crate::mock::ScriptedSource;
    use crate::shutdown;

    fn cycle(entries: &[(&str, i16)]) -> ScanCycle {
        let mut cycle = ScanCycle::new();
        for (id, rssi) in entries {
            cycle.record(Observation::new(id, *rssi).with_name("Tile"));
        }
        cycle
    }

    #[test]
    fn test_first_window_seeds_with_magnitude() {
        let mut calibrator = Calibrator::new([]);
        let readings = calibrator.process(cycle(&[("AA:BB:CC:DD:EE:FF", -63)]));

        let reading = &readings[0];
        assert_eq!(reading.measured_power, -63.0);
        assert_eq!(reading.path_loss_exponent, 2.0);
        assert_eq!(reading.distance, 1.0);
    }

    #[test]
    fn test_estimates_follow_smoothed_power() {
        let mut calibrator = Calibrator::new([]);
        calibrator.process(cycle(&[("AA:BB:CC:DD:EE:FF", -63)]));
        let readings = calibrator.process(cycle(&[("AA:BB:CC:DD:EE:FF", -60)]));

        let reading = &readings[0];
        assert!((reading.measured_power - -61.496_259_351_620_95).abs() < 1e-9);
        assert!((reading.path_loss_exponent - 2.064_981_717_990_511).abs() < 1e-9);
        assert!((reading.distance - 0.846_333_006_658_663_7).abs() < 1e-9);
        assert_eq!(
            reading.to_string(),
            "aa:bb:cc:dd:ee:ff (Tile), RSSI=-60 dB, MR=-61.4963, N=2.06498172, Distance=0.85"
        );
    }

    #[test]
    fn test_allow_list_filters_devices() {
        let mut calibrator = Calibrator::new([DeviceId::new("11:22:33:44:55:66")]);
        let readings = calibrator.process(cycle(&[
            ("AA:BB:CC:DD:EE:FF", -50),
            ("11:22:33:44:55:66", -70),
        ]));

        assert_eq!(readings.len(), 1);
        assert_eq!(readings[0].id, DeviceId::new("11:22:33:44:55:66"));
        assert_eq!(calibrator.device_count(), 1);
    }

    #[test]
    fn test_every_device_is_calibrated_without_allow_list() {
        let mut calibrator = Calibrator::new([]);
        let readings = calibrator.process(cycle(&[
            ("AA:BB:CC:DD:EE:FF", -50),
            ("11:22:33:44:55:66", -70),
        ]));
        assert_eq!(readings.len(), 2);
        assert!(readings.iter().all(|r| r.distance != UNKNOWN_DISTANCE));
    }

    #[test]
    fn test_unnamed_device_display() {
        let mut calibrator = Calibrator::new([]);
        let mut window = ScanCycle::new();
        window.record(Observation::new("AA:BB:CC:DD:EE:FF", -63));

        let line = calibrator.process(window)[0].to_string();
        assert!(line.starts_with("aa:bb:cc:dd:ee:ff (None), RSSI=-63 dB"));
    }

    #[test]
    fn test_window_readings_share_close_time() {
        let mut calibrator = Calibrator::new([]);
        let before = Utc::now();
        let readings = calibrator.process(cycle(&[
            ("AA:BB:CC:DD:EE:FF", -50),
            ("11:22:33:44:55:66", -70),
        ]));
        let after = Utc::now();

        assert_eq!(readings[0].observed_at, readings[1].observed_at);
        assert!(readings[0].observed_at >= before && readings[0].observed_at <= after);
    }

    #[test]
    fn test_timestamped_line() {
        let mut calibrator = Calibrator::new([]);
        let mut reading = calibrator
            .process(cycle(&[("AA:BB:CC:DD:EE:FF", -63)]))
            .remove(0);
        reading.observed_at = DateTime::parse_from_rfc3339("2024-05-01T18:04:09Z")
            .unwrap()
            .with_timezone(&Utc);

        assert_eq!(
            reading.timestamped(),
            "[18:04:09] aa:bb:cc:dd:ee:ff (Tile), RSSI=-63 dB, MR=-63.0000, N=2.00000000, \
             Distance=1.00"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_reports_each_window_until_shutdown() {
        let (trigger, token) = shutdown::channel();
        let mut source = ScriptedSource::new(vec![
            vec![Observation::new("AA:BB:CC:DD:EE:FF", -63)],
            vec![Observation::new("AA:BB:CC:DD:EE:FF", -60)],
        ]);
        let mut calibrator = Calibrator::new([]).with_window(Duration::from_secs(1));
        let mut windows = Vec::new();

        calibrator
            .run(&mut source, token, |readings| {
                windows.push(readings.len());
                if windows.len() == 2 {
                    trigger.trigger();
                }
            })
            .await;

        assert_eq!(windows, [1, 1]);
        assert_eq!(source.scans, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_survives_failed_windows() {
        let (trigger, token) = shutdown::channel();
        let mut source = ScriptedSource::failing();
        let mut calibrator = Calibrator::new([]).with_window(Duration::from_secs(1));

        let stop = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(3500)).await;
            trigger.trigger();
        });
        calibrator.run(&mut source, token, |_| {}).await;
        stop.await.unwrap();

        assert!(source.scans >= 3);
    }
}
