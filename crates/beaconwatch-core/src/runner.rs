//! The scan loop: one window, one evaluation, one round of publishing.
//!
//! ```text
//! ┌──────────────┐ bounded channel ┌────────────┐  Emission  ┌───────────┐
//! │ BLE discovery│ ──────────────▶ │  tracker   │ ─────────▶ │ publisher │
//! └──────────────┘  (one window)   └────────────┘            └───────────┘
//! ```
//!
//! Shutdown is checked between cycles only; a cycle that has started runs to
//! the end of its publishing round.

use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::bus::MessageBus;
use crate::discovery::{collect_cycle, ObservationSource, DEFAULT_OBSERVATION_BUFFER};
use crate::error::BeaconError;
use crate::publisher::{PublishOutcome, Publisher};
use crate::shutdown::Shutdown;
use crate::tracker::PresenceTracker;

/// Scan loop timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanSettings {
    /// Length of one discovery window.
    pub window: Duration,
    /// Capacity of the observation channel.
    pub buffer: usize,
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(10),
            buffer: DEFAULT_OBSERVATION_BUFFER,
        }
    }
}

/// Counters accumulated over a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunStats {
    /// Windows evaluated.
    pub cycles: u64,
    /// Windows lost to discovery errors.
    pub failed_scans: u64,
    /// Messages delivered.
    pub delivered: u64,
    /// Messages skipped by change suppression.
    pub suppressed: u64,
    /// Messages left queued (breaker open or shutdown).
    pub queued: u64,
}

impl RunStats {
    fn record(&mut self, outcome: PublishOutcome) {
        match outcome {
            PublishOutcome::Delivered => self.delivered += 1,
            PublishOutcome::Suppressed => self.suppressed += 1,
            PublishOutcome::Queued | PublishOutcome::Cancelled => self.queued += 1,
        }
    }
}

/// Scan, evaluate and publish until shutdown is requested.
pub async fn run_scan<S, B>(
    source: &mut S,
    tracker: &mut PresenceTracker,
    publisher: &mut Publisher<B>,
    settings: ScanSettings,
    mut shutdown: Shutdown,
) -> RunStats
where
    S: ObservationSource + ?Sized,
    B: MessageBus,
{
    let mut stats = RunStats::default();
    info!(
        devices = tracker.devices().len(),
        window_secs = settings.window.as_secs(),
        "Scanning"
    );

    while !shutdown.is_requested() {
        let registry = &*tracker;
        let collected = collect_cycle(source, settings.window, settings.buffer, |observation| {
            registry.is_tracked(&observation.id)
        })
        .await;

        let cycle = match collected {
            Ok(cycle) => cycle,
            Err(e) => {
                stats.failed_scans += 1;
                let e = BeaconError::from(e);
                warn!(
                    code = e.error_code(),
                    recoverable = e.is_recoverable(),
                    error = %e,
                    "Scan window failed, skipping evaluation"
                );
                if !shutdown.sleep(settings.window).await {
                    break;
                }
                continue;
            }
        };

        stats.cycles += 1;
        let emissions = tracker.evaluate(&cycle);
        debug!(
            cycle = stats.cycles,
            seen = cycle.len(),
            emissions = emissions.len(),
            "Cycle evaluated"
        );

        for emission in &emissions {
            match publisher.publish(emission).await {
                Ok(outcome) => stats.record(outcome),
                Err(e) => {
                    let e = BeaconError::from(e);
                    error!(
                        device = %emission.device,
                        code = e.error_code(),
                        error = %e,
                        "Dropping unencodable message"
                    );
                }
            }
        }
    }

    info!(
        cycles = stats.cycles,
        delivered = stats.delivered,
        queued = stats.queued,
        "Scan loop stopped"
    );
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::QualityOfService;
    use crate::config::{Calibration, DeviceConfig};
    use crate::mock::{RecordingBus, ScriptedSource};
    use crate::publisher::RetryPolicy;
    use crate::shutdown;
    use crate::types::{DeviceId, Observation};
    use serde_json::json;

    fn keys() -> DeviceConfig {
        DeviceConfig {
            id: DeviceId::new("AA:BB:CC:DD:EE:FF"),
            subtopic: "keys".into(),
            payload: json!({"name": "keys"}),
            calibration: Calibration {
                measured_power: -59.0,
                path_loss_exponent: 2.0,
            },
        }
    }

    fn policy() -> RetryPolicy {
        RetryPolicy {
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            ..RetryPolicy::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounced_presence_reaches_the_bus() {
        let (trigger, token) = shutdown::channel();
        let keys_seen = || vec![Observation::new("aa:bb:cc:dd:ee:ff", -65)];
        let mut source = ScriptedSource::new(vec![
            vec![],
            vec![],
            vec![],
            keys_seen(),
            vec![Observation::new("01:02:03:04:05:06", -30)],
        ])
        .stop_when_exhausted(trigger);
        let mut tracker = PresenceTracker::new(vec![keys()], 3);
        let mut publisher = Publisher::new(
            RecordingBus::new(),
            "home/presence",
            QualityOfService::AtLeastOnce,
            policy(),
            token.clone(),
        );

        let stats = run_scan(
            &mut source,
            &mut tracker,
            &mut publisher,
            ScanSettings::default(),
            token,
        )
        .await;

        assert_eq!(stats.cycles, 5);
        assert_eq!(stats.delivered, 2);
        let delivered = &publisher.bus().delivered;
        assert_eq!(delivered.len(), 2);
        assert!(delivered.iter().all(|d| d.topic == "home/presence/keys"));
        assert_eq!(
            delivered[0].payload,
            json!({"detected": false, "distance": -1.0, "rssi": null, "payload": {"name": "keys"}})
        );
        assert_eq!(
            delivered[1].payload,
            json!({"detected": true, "distance": 2.0, "rssi": -65, "payload": {"name": "keys"}})
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_scan_does_not_count_as_absence() {
        let (trigger, token) = shutdown::channel();
        let mut source = ScriptedSource::failing();
        let mut tracker = PresenceTracker::new(vec![keys()], 1);
        let mut publisher = Publisher::new(
            RecordingBus::new(),
            "home/presence",
            QualityOfService::AtLeastOnce,
            policy(),
            token.clone(),
        );

        let stop = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(25)).await;
            trigger.trigger();
        });
        let stats = run_scan(
            &mut source,
            &mut tracker,
            &mut publisher,
            ScanSettings::default(),
            token,
        )
        .await;
        stop.await.unwrap();

        assert_eq!(stats.cycles, 0);
        assert_eq!(stats.failed_scans, 3);
        assert!(publisher.bus().delivered.is_empty());
        assert_eq!(tracker.state(&DeviceId::new("AA:BB:CC:DD:EE:FF")).unwrap().miss_count, 0);
    }

    #[tokio::test]
    async fn test_does_not_start_after_shutdown() {
        let (trigger, token) = shutdown::channel();
        trigger.trigger();
        let mut source = ScriptedSource::new(vec![vec![]]);
        let mut tracker = PresenceTracker::new(vec![keys()], 1);
        let mut publisher = Publisher::new(
            RecordingBus::new(),
            "home/presence",
            QualityOfService::AtLeastOnce,
            policy(),
            token.clone(),
        );

        let stats = run_scan(
            &mut source,
            &mut tracker,
            &mut publisher,
            ScanSettings::default(),
            token,
        )
        .await;

        assert_eq!(stats, RunStats::default());
        assert_eq!(source.scans, 0);
    }
}
