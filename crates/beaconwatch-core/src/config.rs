//! Application configuration management.
//!
//! Handles loading and validating beaconwatch configuration:
//! - MQTT broker connection and base topic
//! - Scan window length and absence confirmation threshold
//! - Publisher retry policy
//! - The registry of tracked devices and their calibration constants
//!
//! The file may be YAML or TOML (chosen by extension). Any key can be
//! overridden from the environment as `BEACONWATCH__SECTION__KEY`, e.g.
//! `BEACONWATCH__MQTT__BROKER=10.0.0.2`.
//!
//! Keys of the original `config.yaml` layout are accepted as aliases
//! (`address`, `topic`, `ble.MR`, `ble.N`), so existing files load unchanged.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::bus::QualityOfService;
use crate::discovery::DEFAULT_OBSERVATION_BUFFER;
use crate::publisher::RetryPolicy;
use crate::types::{is_valid_device_id, DeviceId};

/// File looked up in the working directory when no path is given.
pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";

/// Prefix of environment variables overriding file values.
pub const ENV_PREFIX: &str = "BEACONWATCH";

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Configuration file not found.
    #[error("Configuration file not found: {}", .0.display())]
    NotFound(PathBuf),

    /// The file could not be read or deserialized.
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    /// A single field failed validation.
    #[error("Invalid value for '{field}': {message}")]
    ValidationError {
        /// Dotted path of the offending field.
        field: String,
        /// What is wrong with it.
        message: String,
    },

    /// Several fields failed validation.
    #[error("Configuration has {} errors", .0.len())]
    MultipleValidationErrors(Vec<ConfigError>),
}

/// Result type for configuration operations.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Broker connection.
    pub mqtt: MqttConfig,

    /// Scan window length in seconds.
    #[serde(default = "default_interval")]
    pub interval: u64,

    /// Consecutive missed cycles before absence is reported.
    #[serde(default = "default_threshold", alias = "absence_threshold")]
    pub status_interval_threshold: u32,

    /// Delivery policy.
    #[serde(default)]
    pub publisher: PublisherConfig,

    /// Discovery settings.
    #[serde(default)]
    pub scanner: ScannerConfig,

    /// Calibration mode settings.
    #[serde(default)]
    pub calibrate: CalibrateConfig,

    /// Devices to track, in publishing order.
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

/// MQTT broker connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    /// Broker host name or address.
    pub broker: String,

    /// Broker port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Client identifier presented to the broker.
    #[serde(default = "default_client_id")]
    pub client_id: String,

    /// Optional user name.
    #[serde(default)]
    pub username: Option<String>,

    /// Optional password, never written back out.
    #[serde(default, skip_serializing)]
    pub password: Option<String>,

    /// Base topic; device subtopics are appended as `{topic}/{subtopic}`.
    pub topic: String,

    /// MQTT QoS level (0, 1 or 2).
    #[serde(default = "default_qos")]
    pub qos: u8,

    /// Keep-alive interval in seconds.
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
}

impl MqttConfig {
    /// QoS as a typed value, falling back to at-least-once for an invalid
    /// level (rejected by validation anyway).
    #[must_use]
    pub fn quality_of_service(&self) -> QualityOfService {
        QualityOfService::from_level(self.qos).unwrap_or_default()
    }

    /// Credentials, when both user name and password are set.
    #[must_use]
    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (&self.username, &self.password) {
            (Some(user), Some(password)) => Some((user.as_str(), password.as_str())),
            _ => None,
        }
    }
}

/// Publisher retry and suppression policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PublisherConfig {
    /// Fixed delay between connection attempts, in seconds.
    pub reconnect_delay_secs: u64,
    /// Publish attempts per message before the breaker opens; 0 retries forever.
    pub max_attempts: u32,
    /// First retry delay in milliseconds, doubled per attempt.
    pub initial_backoff_ms: u64,
    /// Upper bound of the retry delay in milliseconds.
    pub max_backoff_ms: u64,
    /// How long the breaker stays open, in seconds.
    pub breaker_cooldown_secs: u64,
    /// Messages kept while the broker is unreachable.
    pub pending_capacity: usize,
    /// Skip sends whose detected status equals the last delivered one.
    pub suppress_unchanged: bool,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            reconnect_delay_secs: policy.reconnect_delay.as_secs(),
            max_attempts: policy.max_attempts,
            initial_backoff_ms: duration_millis(policy.initial_backoff),
            max_backoff_ms: duration_millis(policy.max_backoff),
            breaker_cooldown_secs: policy.breaker_cooldown.as_secs(),
            pending_capacity: policy.pending_capacity,
            suppress_unchanged: false,
        }
    }
}

impl PublisherConfig {
    /// The retry policy these settings describe.
    #[must_use]
    pub const fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            reconnect_delay: Duration::from_secs(self.reconnect_delay_secs),
            max_attempts: self.max_attempts,
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
            breaker_cooldown: Duration::from_secs(self.breaker_cooldown_secs),
            pending_capacity: self.pending_capacity,
        }
    }
}

/// Discovery settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScannerConfig {
    /// Adapter name such as `hci0`; the default adapter when unset.
    pub adapter: Option<String>,
    /// Capacity of the per-window observation channel.
    pub observation_buffer: usize,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            adapter: None,
            observation_buffer: DEFAULT_OBSERVATION_BUFFER,
        }
    }
}

/// Calibration mode settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrateConfig {
    /// Discovery window in seconds.
    pub window_secs: u64,
}

impl Default for CalibrateConfig {
    fn default() -> Self {
        Self { window_secs: 10 }
    }
}

/// One tracked device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// MAC address or platform identifier.
    #[serde(alias = "address")]
    pub id: DeviceId,

    /// Subtopic below the base topic.
    #[serde(default, alias = "topic")]
    pub subtopic: String,

    /// Opaque value forwarded in every message.
    #[serde(default)]
    pub payload: serde_json::Value,

    /// Distance model constants.
    #[serde(alias = "ble")]
    pub calibration: Calibration,
}

/// Path-loss model constants for one device.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Calibration {
    /// RSSI expected at one meter.
    #[serde(alias = "MR", alias = "mr")]
    pub measured_power: f64,

    /// Environment path-loss exponent.
    #[serde(alias = "N", alias = "n")]
    pub path_loss_exponent: f64,
}

impl Config {
    /// Load configuration from `path`, apply environment overrides and
    /// validate the result.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::NotFound`] if the file does not exist, a load
    /// error if it cannot be parsed, or validation errors.
    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }

        let config: Self = config::Config::builder()
            .add_source(config::File::from(path))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Scan window length.
    #[must_use]
    pub const fn scan_window(&self) -> Duration {
        Duration::from_secs(self.interval)
    }

    /// Calibration window length.
    #[must_use]
    pub const fn calibration_window(&self) -> Duration {
        Duration::from_secs(self.calibrate.window_secs)
    }

    /// Validate every field, reporting all problems at once.
    ///
    /// # Errors
    ///
    /// Returns a single [`ConfigError::ValidationError`] or
    /// [`ConfigError::MultipleValidationErrors`].
    pub fn validate(&self) -> ConfigResult<()> {
        let mut errors = Vec::new();
        let mut invalid = |field: String, message: &str| {
            errors.push(ConfigError::ValidationError {
                field,
                message: message.to_string(),
            });
        };

        if self.mqtt.broker.trim().is_empty() {
            invalid("mqtt.broker".into(), "must not be empty");
        }
        if self.mqtt.port == 0 {
            invalid("mqtt.port".into(), "must be between 1 and 65535");
        }
        if self.mqtt.topic.trim().is_empty() {
            invalid("mqtt.topic".into(), "must not be empty");
        }
        if self.mqtt.client_id.trim().is_empty() {
            invalid("mqtt.client_id".into(), "must not be empty");
        }
        if QualityOfService::from_level(self.mqtt.qos).is_none() {
            invalid("mqtt.qos".into(), "must be 0, 1 or 2");
        }
        if self.interval == 0 {
            invalid("interval".into(), "must be at least one second");
        }
        if self.status_interval_threshold == 0 {
            invalid("status_interval_threshold".into(), "must be a positive integer");
        }
        if self.publisher.pending_capacity == 0 {
            invalid("publisher.pending_capacity".into(), "must be at least 1");
        }
        if self.scanner.observation_buffer == 0 {
            invalid("scanner.observation_buffer".into(), "must be at least 1");
        }
        if self.calibrate.window_secs == 0 {
            invalid("calibrate.window_secs".into(), "must be at least one second");
        }

        let mut seen = HashSet::new();
        for (index, device) in self.devices.iter().enumerate() {
            if !is_valid_device_id(device.id.as_str()) {
                invalid(
                    format!("devices[{index}].id"),
                    "must be a MAC address (AA:BB:CC:DD:EE:FF) or UUID",
                );
            } else if !seen.insert(&device.id) {
                invalid(format!("devices[{index}].id"), "is listed more than once");
            }
            if !device.calibration.measured_power.is_finite() {
                invalid(
                    format!("devices[{index}].calibration.measured_power"),
                    "must be a finite number",
                );
            }
            let exponent = device.calibration.path_loss_exponent;
            if !exponent.is_finite() || exponent <= 0.0 {
                invalid(
                    format!("devices[{index}].calibration.path_loss_exponent"),
                    "must be a positive number",
                );
            }
        }

        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(ConfigError::MultipleValidationErrors(errors)),
        }
    }
}

/// Where to look for the configuration file when none is given.
///
/// Prefers `./config.yaml`; otherwise `/etc/beaconwatch/config.yaml` on Linux
/// and the platform config directory elsewhere.
#[must_use]
pub fn default_config_path() -> PathBuf {
    let local = PathBuf::from(DEFAULT_CONFIG_FILE);
    if local.is_file() {
        return local;
    }

    #[cfg(target_os = "linux")]
    {
        PathBuf::from("/etc/beaconwatch").join(DEFAULT_CONFIG_FILE)
    }
    #[cfg(not(target_os = "linux"))]
    {
        directories::ProjectDirs::from("", "", "beaconwatch")
            .map_or(local, |dirs| dirs.config_dir().join(DEFAULT_CONFIG_FILE))
    }
}

const fn default_interval() -> u64 {
    10
}

const fn default_threshold() -> u32 {
    3
}

const fn default_port() -> u16 {
    1883
}

const fn default_qos() -> u8 {
    1
}

const fn default_keep_alive() -> u64 {
    30
}

fn default_client_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("beaconwatch-{}", &id[..8])
}

fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
