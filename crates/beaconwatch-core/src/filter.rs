//! Single-state recursive filter for smoothing RSSI.
//!
//! RSSI readings from a stationary beacon jump by several dB between
//! advertisements. The filter keeps one scalar estimate per device and
//! blends each new reading into it:
//!
//! ```text
//! x' = A·x                      (no control input)
//! p' = A·p·A + Q
//! y  = z - C·x'
//! s  = C·p'·C + R
//! k  = p'·C / s
//! x  = x' + k·y
//! p  = (1 - k·C)·p'
//! ```
//!
//! With `A = C = 1`, `Q = 0.005` and `R = 1` the gain settles low, so a
//! single outlier moves the estimate by a fraction of a dB. The update order
//! above is kept literally so estimates are reproducible bit for bit.

use std::collections::HashMap;

use crate::types::DeviceId;

/// Process noise used for RSSI smoothing.
pub const PROCESS_NOISE: f64 = 0.005;

/// Measurement noise used for RSSI smoothing.
pub const MEASUREMENT_NOISE: f64 = 1.0;

/// Covariance the filter starts from after seeding.
pub const INITIAL_COVARIANCE: f64 = 1.0;

const A: f64 = 1.0;
const C: f64 = 1.0;

/// Recursive estimator of a single scalar.
#[derive(Debug, Clone, PartialEq)]
pub struct RssiFilter {
    process_noise: f64,
    measurement_noise: f64,
    estimate: f64,
    covariance: f64,
}

impl RssiFilter {
    /// Start a filter from its first raw sample.
    ///
    /// The first sample is taken as-is; smoothing starts with the next
    /// [`step`](Self::step).
    #[must_use]
    pub const fn seeded(first: f64) -> Self {
        Self::with_noise(first, PROCESS_NOISE, MEASUREMENT_NOISE)
    }

    /// Start a filter with explicit noise parameters.
    #[must_use]
    pub const fn with_noise(first: f64, process_noise: f64, measurement_noise: f64) -> Self {
        Self {
            process_noise,
            measurement_noise,
            estimate: first,
            covariance: INITIAL_COVARIANCE,
        }
    }

    /// Fold one measurement into the estimate.
    pub fn step(&mut self, measurement: f64) {
        let predicted_estimate = A * self.estimate;
        let predicted_covariance = A * self.covariance * A + self.process_noise;

        let innovation = measurement - C * predicted_estimate;
        let innovation_covariance = C * predicted_covariance * C + self.measurement_noise;

        let gain = predicted_covariance * C / innovation_covariance;
        self.estimate = predicted_estimate + gain * innovation;
        self.covariance = (1.0 - gain * C) * predicted_covariance;
    }

    /// Current smoothed value.
    #[must_use]
    pub const fn current_estimate(&self) -> f64 {
        self.estimate
    }

    /// Current estimate covariance.
    #[must_use]
    pub const fn covariance(&self) -> f64 {
        self.covariance
    }
}

/// Filters keyed by device, created on first observation and kept for the
/// lifetime of the bank.
#[derive(Debug, Default)]
pub struct FilterBank {
    filters: HashMap<DeviceId, RssiFilter>,
}

impl FilterBank {
    /// Create an empty bank.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one sample for `id` and return the device's current estimate.
    ///
    /// The first sample for a device seeds its filter unsmoothed.
    pub fn observe(&mut self, id: &DeviceId, sample: f64) -> f64 {
        self.filters
            .entry(id.clone())
            .and_modify(|filter| filter.step(sample))
            .or_insert_with(|| RssiFilter::seeded(sample))
            .current_estimate()
    }

    /// Current estimate for `id`, if it has ever been observed.
    #[must_use]
    pub fn estimate(&self, id: &DeviceId) -> Option<f64> {
        self.filters.get(id).map(RssiFilter::current_estimate)
    }

    /// Number of devices with a filter.
    #[must_use]
    pub fn len(&self) -> usize {
        self.filters.len()
    }

    /// Whether no device has been observed yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::float_cmp)]
mod tests {
    use super::*;

    #[test]
    fn test_first_sample_is_not_smoothed() {
        let filter = RssiFilter::seeded(-70.0);
        assert_eq!(filter.current_estimate(), -70.0);
        assert_eq!(filter.covariance(), 1.0);
    }

    #[test]
    fn test_estimates_match_reference_sequence() {
        let mut filter = RssiFilter::seeded(-70.0);
        let samples = [-72.0, -68.0, -75.0, -71.0, -69.0];
        let expected = [
            -71.002_493_765_586_04,
            -69.993_360_982_111_07,
            -71.266_761_840_093_52,
            -71.211_826_290_046_87,
            -70.826_544_470_950_44,
        ];

        for (sample, want) in samples.iter().zip(expected) {
            filter.step(*sample);
            assert_eq!(filter.current_estimate(), want);
        }
        assert_eq!(filter.covariance(), 0.174_191_716_967_190_63);
    }

    #[test]
    fn test_constant_input_is_a_fixed_point() {
        let mut filter = RssiFilter::seeded(-60.0);
        for _ in 0..50 {
            filter.step(-60.0);
        }
        assert_eq!(filter.current_estimate(), -60.0);
    }

    #[test]
    fn test_outlier_is_damped() {
        let mut filter = RssiFilter::seeded(-60.0);
        for _ in 0..20 {
            filter.step(-60.0);
        }
        filter.step(-90.0);
        let moved = (filter.current_estimate() + 60.0).abs();
        assert!(moved < 5.0, "estimate moved {moved} dB on one outlier");
    }

    #[test]
    fn test_bank_seeds_then_steps() {
        let mut bank = FilterBank::new();
        let id = DeviceId::new("AA:BB:CC:DD:EE:FF");
        assert!(bank.is_empty());

        assert_eq!(bank.observe(&id, -70.0), -70.0);
        assert_eq!(bank.observe(&id, -72.0), -71.002_493_765_586_04);
        assert_eq!(bank.len(), 1);
        assert_eq!(
            bank.estimate(&DeviceId::new("aa:bb:cc:dd:ee:ff")),
            Some(-71.002_493_765_586_04)
        );
        assert_eq!(bank.estimate(&DeviceId::new("11:22:33:44:55:66")), None);
    }
}
