//! Per-device presence debouncing.
//!
//! Each scan cycle every registered device is either seen or not:
//!
//! - **Seen**: the device is reported as detected, with a distance from its
//!   calibration constants and the raw sample. Every detected cycle is
//!   reported, and the miss counter resets.
//! - **Not seen**: the miss counter grows. Once it reaches the threshold an
//!   absence message is reported and the counter resets, so continued
//!   absence is re-announced every `threshold` cycles rather than once.
//!
//! A single missed advertisement therefore never flips a device to absent,
//! while a lost absence message is repeated soon after.

use std::collections::HashMap;

use tracing::{debug, info};

use crate::config::DeviceConfig;
use crate::discovery::ScanCycle;
use crate::distance::{distance_meters, round_to_centimeters};
use crate::filter::FilterBank;
use crate::types::{DeviceId, Emission, PresenceMessage};

/// Debounce state of one device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PresenceState {
    /// Consecutive cycles without an observation, below the threshold.
    pub miss_count: u32,
    /// Status of the last emitted message, `None` before the first one.
    pub last_emitted: Option<bool>,
}

impl PresenceState {
    /// Whether the device currently counts as present.
    #[must_use]
    pub const fn is_detected(&self) -> bool {
        matches!(self.last_emitted, Some(true))
    }
}

/// Registry of tracked devices and their presence state.
#[derive(Debug)]
pub struct PresenceTracker {
    devices: Vec<DeviceConfig>,
    states: HashMap<DeviceId, PresenceState>,
    filters: FilterBank,
    threshold: u32,
}

impl PresenceTracker {
    /// Track `devices`, reporting absence after `threshold` missed cycles.
    ///
    /// A zero threshold is treated as one.
    #[must_use]
    pub fn new(devices: Vec<DeviceConfig>, threshold: u32) -> Self {
        let states = devices
            .iter()
            .map(|device| (device.id.clone(), PresenceState::default()))
            .collect();
        Self {
            devices,
            states,
            filters: FilterBank::new(),
            threshold: threshold.max(1),
        }
    }

    /// Whether `id` is in the registry.
    #[must_use]
    pub fn is_tracked(&self, id: &DeviceId) -> bool {
        self.states.contains_key(id)
    }

    /// Tracked devices in registry order.
    #[must_use]
    pub fn devices(&self) -> &[DeviceConfig] {
        &self.devices
    }

    /// Current state of `id`, if tracked.
    #[must_use]
    pub fn state(&self, id: &DeviceId) -> Option<PresenceState> {
        self.states.get(id).copied()
    }

    /// Consecutive missed cycles of `id` since its last emission, if tracked.
    #[must_use]
    pub fn miss_count(&self, id: &DeviceId) -> Option<u32> {
        self.states.get(id).map(|state| state.miss_count)
    }

    /// Smoothed RSSI of `id`, once it has been seen.
    #[must_use]
    pub fn smoothed_rssi(&self, id: &DeviceId) -> Option<f64> {
        self.filters.estimate(id)
    }

    /// Evaluate one closed scan window and return the messages to publish,
    /// in registry order.
    ///
    /// Observations of devices outside the registry are ignored.
    pub fn evaluate(&mut self, cycle: &ScanCycle) -> Vec<Emission> {
        let mut emissions = Vec::new();

        for device in &self.devices {
            let Some(state) = self.states.get_mut(&device.id) else {
                continue;
            };

            if let Some(observation) = cycle.get(&device.id) {
                let rssi = f64::from(observation.rssi);
                let smoothed = self.filters.observe(&device.id, rssi);
                let distance = round_to_centimeters(distance_meters(
                    rssi,
                    device.calibration.measured_power,
                    device.calibration.path_loss_exponent,
                ));

                if state.last_emitted != Some(true) {
                    info!(
                        device = %device.id,
                        subtopic = %device.subtopic,
                        distance,
                        "Device detected"
                    );
                }
                debug!(
                    device = %device.id,
                    rssi = observation.rssi,
                    smoothed,
                    distance,
                    "Device detected at distance"
                );

                state.miss_count = 0;
                state.last_emitted = Some(true);
                emissions.push(Emission {
                    device: device.id.clone(),
                    subtopic: device.subtopic.clone(),
                    message: PresenceMessage::detected(
                        distance,
                        observation.rssi,
                        device.payload.clone(),
                    ),
                });
                continue;
            }

            state.miss_count += 1;
            if state.miss_count >= self.threshold {
                if state.last_emitted != Some(false) {
                    info!(device = %device.id, subtopic = %device.subtopic, "Device not detected");
                }
                state.miss_count = 0;
                state.last_emitted = Some(false);
                emissions.push(Emission {
                    device: device.id.clone(),
                    subtopic: device.subtopic.clone(),
                    message: PresenceMessage::not_detected(device.payload.clone()),
                });
            } else {
                debug!(
                    device = %device.id,
                    subtopic = %device.subtopic,
                    misses = state.miss_count,
                    threshold = self.threshold,
                    "Device not detected, waiting for more confirmations"
                );
            }
        }

        emissions
    }
}
