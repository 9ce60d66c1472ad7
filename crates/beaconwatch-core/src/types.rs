//! Shared types passed between discovery, tracking and publishing.

use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::distance::UNKNOWN_DISTANCE;

static MAC_ADDRESS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[0-9a-f]{2}(:[0-9a-f]{2}){5}$").expect("MAC address pattern is valid")
});

/// Returns `true` if `value` is a Bluetooth MAC address or a platform UUID
/// identifier (the form CoreBluetooth reports instead of a MAC).
#[must_use]
pub fn is_valid_device_id(value: &str) -> bool {
    let normalized = value.trim().to_ascii_lowercase();
    MAC_ADDRESS.is_match(&normalized) || uuid::Uuid::parse_str(&normalized).is_ok()
}

/// Case-insensitive identifier of a BLE device.
///
/// The inner string is always lowercase, so derived `Eq`/`Hash` compare ids
/// the way scanners and config files may spell them differently.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct DeviceId(String);

impl DeviceId {
    /// Normalize an identifier as reported by a scanner.
    pub fn new(value: impl AsRef<str>) -> Self {
        Self(value.as_ref().trim().to_ascii_lowercase())
    }

    /// Parse an identifier from configuration, rejecting anything that is not
    /// a MAC address or UUID.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        is_valid_device_id(value).then(|| Self::new(value))
    }

    /// The normalized (lowercase) identifier.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for DeviceId {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl From<DeviceId> for String {
    fn from(value: DeviceId) -> Self {
        value.0
    }
}

/// One advertisement seen during a scan window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
    /// Device that advertised.
    pub id: DeviceId,
    /// Raw signal strength in dBm.
    pub rssi: i16,
    /// Advertised local name, if any.
    pub name: Option<String>,
}

impl Observation {
    /// Create an observation.
    pub fn new(id: impl AsRef<str>, rssi: i16) -> Self {
        Self {
            id: DeviceId::new(id),
            rssi,
            name: None,
        }
    }

    /// Attach the advertised name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// Presence report published for one device.
///
/// Serializes to `{"detected", "distance", "rssi", "payload"}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceMessage {
    /// Whether the device was seen this cycle.
    pub detected: bool,
    /// Estimated distance in meters, `-1` when unknown.
    pub distance: f64,
    /// Raw RSSI of the retained sample, `null` when not detected.
    pub rssi: Option<i16>,
    /// Opaque value from the device configuration, forwarded verbatim.
    pub payload: serde_json::Value,
}

impl PresenceMessage {
    /// Message for a device seen at `rssi` and estimated `distance`.
    #[must_use]
    pub fn detected(distance: f64, rssi: i16, payload: serde_json::Value) -> Self {
        Self {
            detected: true,
            distance,
            rssi: Some(rssi),
            payload,
        }
    }

    /// Message for a device whose absence has been confirmed.
    #[must_use]
    pub fn not_detected(payload: serde_json::Value) -> Self {
        Self {
            detected: false,
            distance: UNKNOWN_DISTANCE,
            rssi: None,
            payload,
        }
    }
}

/// A message the tracker decided to emit, addressed to a device subtopic.
#[derive(Debug, Clone, PartialEq)]
pub struct Emission {
    /// Device the message is about.
    pub device: DeviceId,
    /// Subtopic below the configured base topic.
    pub subtopic: String,
    /// The message itself.
    pub message: PresenceMessage,
}
