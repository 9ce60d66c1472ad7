//! RSSI to distance conversion using the log-distance path-loss model.
//!
//! ```text
//! d = 10 ^ ((MR - RSSI) / (10 · N))
//! ```
//!
//! `MR` is the RSSI measured at one meter and `N` the path-loss exponent
//! (2 in free space, 2.7 to 4 indoors). Tracked devices use their configured
//! constants with the raw sample. Calibration mode derives both from a
//! smoothed signal instead.

use std::f64::consts::LOG10_E;

/// Distance reported when it cannot be estimated.
pub const UNKNOWN_DISTANCE: f64 = -1.0;

/// Distance in meters for a raw RSSI sample.
///
/// Returns [`UNKNOWN_DISTANCE`] for a zero exponent.
#[must_use]
pub fn distance_meters(rssi: f64, measured_power: f64, path_loss_exponent: f64) -> f64 {
    if path_loss_exponent == 0.0 {
        return UNKNOWN_DISTANCE;
    }
    10f64.powf((measured_power - rssi) / (10.0 * path_loss_exponent))
}

/// Live path-loss exponent estimate used while calibrating.
///
/// The expression reduces to `2 + |MR - RSSI| · 0.0434`, so it never strays
/// far from free-space propagation. Operators should treat the value as a
/// starting point and confirm it against a measured distance.
#[must_use]
pub fn calibration_exponent(smoothed_power: f64, rssi: f64) -> f64 {
    2.0 + ((smoothed_power - rssi) * LOG10_E / 10.0).abs()
}

/// Distance derived from the smoothed signal and the live exponent.
///
/// Returns [`UNKNOWN_DISTANCE`] for a zero exponent.
#[must_use]
pub fn calibration_distance(rssi: f64, smoothed_power: f64, path_loss_exponent: f64) -> f64 {
    distance_meters(rssi, smoothed_power, path_loss_exponent)
}

/// Round a distance to two decimals for publishing. The unknown sentinel is
/// returned unchanged.
#[must_use]
pub fn round_to_centimeters(distance: f64) -> f64 {
    if distance < 0.0 {
        return UNKNOWN_DISTANCE;
    }
    (distance * 100.0).round() / 100.0
}
