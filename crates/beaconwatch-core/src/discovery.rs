//! BLE discovery seam and per-window observation collection.
//!
//! This module provides:
//! - [`ObservationSource`], implemented by the BLE adapter in the binary and by
//!   scripted sources in tests
//! - [`ScanCycle`], the observations retained for one scan window
//! - [`collect_cycle`], which runs one window through a bounded channel
//!
//! A source owns the scan window: it streams observations into the channel and
//! returns once discovery has stopped. Dropping the sender is what closes the
//! window, so a cycle is only evaluated after every write for it has landed.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::types::{DeviceId, Observation};

/// Default capacity of the per-window observation channel.
pub const DEFAULT_OBSERVATION_BUFFER: usize = 256;

/// Errors raised by discovery adapters.
#[derive(Debug, Error)]
pub enum ScanError {
    /// No Bluetooth adapter was found.
    #[error("No Bluetooth adapter found")]
    AdapterNotFound,

    /// The adapter is present but powered off.
    #[error("Bluetooth adapter is powered off")]
    AdapterPoweredOff,

    /// The Bluetooth stack could not be opened.
    #[error("Failed to initialize Bluetooth session: {message}")]
    SessionInitFailed {
        /// Underlying error message.
        message: String,
    },

    /// Discovery failed while the window was open.
    #[error("Device discovery failed: {message}")]
    DiscoveryFailed {
        /// Underlying error message.
        message: String,
    },

    /// Discovery is not available in this build.
    #[error("Bluetooth discovery unsupported: {reason}")]
    Unsupported {
        /// Why discovery is unavailable.
        reason: String,
    },
}

/// Result type for discovery operations.
pub type ScanResult<T> = std::result::Result<T, ScanError>;

/// Something that can listen for advertisements for a bounded window.
#[async_trait]
pub trait ObservationSource: Send {
    /// Listen for `window`, sending every advertisement seen into `sink`.
    ///
    /// Implementations must stop discovery before returning and must not keep
    /// a clone of `sink` past the window.
    async fn scan(&mut self, window: Duration, sink: mpsc::Sender<Observation>) -> ScanResult<()>;
}

/// Observations retained for one scan window, at most one per device.
#[derive(Debug, Default, Clone)]
pub struct ScanCycle {
    observations: HashMap<DeviceId, Observation>,
}

impl ScanCycle {
    /// Create an empty cycle.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Retain `observation`, replacing any earlier sample for the same device.
    pub fn record(&mut self, observation: Observation) {
        self.observations.insert(observation.id.clone(), observation);
    }

    /// The retained observation for `id`, if it was seen this window.
    #[must_use]
    pub fn get(&self, id: &DeviceId) -> Option<&Observation> {
        self.observations.get(id)
    }

    /// Number of distinct devices seen.
    #[must_use]
    pub fn len(&self) -> usize {
        self.observations.len()
    }

    /// Whether nothing was seen.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }

    /// Retained observations ordered by device id.
    #[must_use]
    pub fn into_sorted(self) -> Vec<Observation> {
        let mut observations: Vec<Observation> = self.observations.into_values().collect();
        observations.sort_by(|a, b| a.id.cmp(&b.id));
        observations
    }
}

/// Run one scan window and collect what it produced.
///
/// Observations rejected by `accept` are dropped on arrival.
///
/// # Errors
///
/// Returns the source's error if discovery failed. The partial cycle is
/// discarded in that case.
pub async fn collect_cycle<S, F>(
    source: &mut S,
    window: Duration,
    buffer: usize,
    mut accept: F,
) -> ScanResult<ScanCycle>
where
    S: ObservationSource + ?Sized,
    F: FnMut(&Observation) -> bool + Send,
{
    let (sink, mut inbox) = mpsc::channel(buffer.max(1));

    let drain = async move {
        let mut cycle = ScanCycle::new();
        while let Some(observation) = inbox.recv().await {
            if accept(&observation) {
                trace!(device = %observation.id, rssi = observation.rssi, "Observation recorded");
                cycle.record(observation);
            } else {
                trace!(device = %observation.id, "Ignoring untracked device");
            }
        }
        cycle
    };

    let (scanned, cycle) = tokio::join!(source.scan(window, sink), drain);
    scanned?;

    debug!(devices = cycle.len(), "Scan window closed");
    Ok(cycle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::ScriptedSource;

    #[test]
    fn test_last_observation_in_window_wins() {
        let mut cycle = ScanCycle::new();
        cycle.record(Observation::new("AA:BB:CC:DD:EE:FF", -80));
        cycle.record(Observation::new("aa:bb:cc:dd:ee:ff", -62));

        assert_eq!(cycle.len(), 1);
        let kept = cycle.get(&DeviceId::new("AA:BB:CC:DD:EE:FF")).unwrap();
        assert_eq!(kept.rssi, -62);
    }

    #[test]
    fn test_into_sorted_orders_by_id() {
        let mut cycle = ScanCycle::new();
        cycle.record(Observation::new("22:22:22:22:22:22", -50));
        cycle.record(Observation::new("11:11:11:11:11:11", -60));

        let ids: Vec<String> = cycle
            .into_sorted()
            .into_iter()
            .map(|o| o.id.to_string())
            .collect();
        assert_eq!(ids, ["11:11:11:11:11:11", "22:22:22:22:22:22"]);
    }

    #[tokio::test]
    async fn test_collect_cycle_filters_and_keeps_last() {
        let mut source = ScriptedSource::new(vec![vec![
            Observation::new("AA:BB:CC:DD:EE:FF", -80),
            Observation::new("11:22:33:44:55:66", -40),
            Observation::new("AA:BB:CC:DD:EE:FF", -70),
        ]]);
        let tracked = DeviceId::new("aa:bb:cc:dd:ee:ff");

        let cycle = collect_cycle(&mut source, Duration::ZERO, 1, |o| o.id == tracked)
            .await
            .unwrap();

        assert_eq!(cycle.len(), 1);
        assert_eq!(cycle.get(&tracked).unwrap().rssi, -70);
    }

    #[tokio::test]
    async fn test_collect_cycle_propagates_scan_failure() {
        let mut source = ScriptedSource::failing();
        let result = collect_cycle(&mut source, Duration::ZERO, 8, |_| true).await;
        assert!(matches!(result, Err(ScanError::DiscoveryFailed { .. })));
    }
}
