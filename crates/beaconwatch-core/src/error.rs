//! Unified error types for the beaconwatch core library.
//!
//! This module provides a unified error type [`BeaconError`] that covers every
//! failure mode across the daemon. Each module also has its own specific error
//! type ([`ConfigError`](crate::config::ConfigError),
//! [`BusError`](crate::bus::BusError), [`ScanError`](crate::discovery::ScanError))
//! for internal use.
//!
//! # Design Principles
//!
//! - **Specific variants**: Each error variant captures exactly one failure mode
//! - **Actionable messages**: Error messages guide users toward resolution
//! - **Exit-code ready**: Errors know which process exit code they map to
//!
//! # Example
//!
//! ```rust
//! use beaconwatch_core::error::{BeaconError, Result};
//! use std::path::PathBuf;
//!
//! fn require_config(path: &PathBuf) -> Result<()> {
//!     if !path.exists() {
//!         return Err(BeaconError::ConfigNotFound(path.clone()));
//!     }
//!     Ok(())
//! }
//! ```

use std::path::PathBuf;
use thiserror::Error;

/// Process exit code for a normal (or gracefully interrupted) run.
pub const EXIT_OK: i32 = 0;

/// Process exit code for a missing or invalid configuration.
pub const EXIT_CONFIG: i32 = 1;

/// Process exit code for any other fatal startup failure.
pub const EXIT_FAILURE: i32 = 2;

/// The unified error type for all beaconwatch operations.
#[derive(Debug, Error)]
pub enum BeaconError {
    // =========================================================================
    // BLUETOOTH ERRORS
    // =========================================================================
    /// No Bluetooth adapter was found on this system.
    #[error(
        "No Bluetooth adapter found. Ensure Bluetooth hardware is present and drivers are loaded."
    )]
    BluetoothAdapterNotFound,

    /// The Bluetooth adapter exists but is powered off.
    #[error("Bluetooth adapter is powered off. Run 'bluetoothctl power on' to enable.")]
    BluetoothAdapterPoweredOff,

    /// BLE discovery failed.
    #[error("Bluetooth scan failed: {0}")]
    BluetoothScanFailed(String),

    /// Discovery is not available in this build or on this platform.
    #[error("Bluetooth discovery is not supported: {0}")]
    BluetoothUnsupported(String),

    // =========================================================================
    // MESSAGE BUS ERRORS
    // =========================================================================
    /// The broker could not be reached or refused the connection.
    #[error("MQTT connection failed: {0}")]
    BusConnectionFailed(String),

    /// The broker was reachable but the publish was rejected.
    #[error("MQTT publish failed: {0}")]
    BusPublishFailed(String),

    /// A presence message could not be encoded.
    #[error("Failed to encode presence message: {0}")]
    MessageEncoding(String),

    // =========================================================================
    // CONFIGURATION ERRORS
    // =========================================================================
    /// The configuration file was not found at the expected path.
    #[error(
        "Configuration file not found at: {}. Copy config.yaml.dist and edit it, then run again.",
        .0.display()
    )]
    ConfigNotFound(PathBuf),

    /// The configuration file exists but could not be parsed.
    #[error("Failed to parse configuration: {0}")]
    ConfigParseError(String),

    /// The configuration was parsed but contains invalid values.
    #[error("Configuration validation failed: {0}")]
    ConfigValidationError(String),
}

/// A specialized [`Result`] type for beaconwatch operations.
pub type Result<T> = std::result::Result<T, BeaconError>;

/// Short alias for [`BeaconError`].
pub type Error = BeaconError;

impl BeaconError {
    /// Returns `true` if this error is related to configuration.
    #[inline]
    #[must_use]
    pub const fn is_config_error(&self) -> bool {
        matches!(
            self,
            Self::ConfigNotFound(_) | Self::ConfigParseError(_) | Self::ConfigValidationError(_)
        )
    }

    /// Returns `true` if this error is likely recoverable by retrying later.
    #[inline]
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::BluetoothScanFailed(_) | Self::BusConnectionFailed(_) | Self::BusPublishFailed(_)
        )
    }

    /// Returns the process exit code this error should terminate with.
    #[inline]
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        if self.is_config_error() {
            EXIT_CONFIG
        } else {
            EXIT_FAILURE
        }
    }

    /// Returns a machine-readable error code for structured logs.
    #[inline]
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::BluetoothAdapterNotFound => "BLUETOOTH_ADAPTER_NOT_FOUND",
            Self::BluetoothAdapterPoweredOff => "BLUETOOTH_ADAPTER_POWERED_OFF",
            Self::BluetoothScanFailed(_) => "BLUETOOTH_SCAN_FAILED",
            Self::BluetoothUnsupported(_) => "BLUETOOTH_UNSUPPORTED",
            Self::BusConnectionFailed(_) => "BUS_CONNECTION_FAILED",
            Self::BusPublishFailed(_) => "BUS_PUBLISH_FAILED",
            Self::MessageEncoding(_) => "MESSAGE_ENCODING",
            Self::ConfigNotFound(_) => "CONFIG_NOT_FOUND",
            Self::ConfigParseError(_) => "CONFIG_PARSE_ERROR",
            Self::ConfigValidationError(_) => "CONFIG_VALIDATION_ERROR",
        }
    }
}

// =============================================================================
// CONVERSIONS FROM MODULE-SPECIFIC ERRORS
// =============================================================================

impl From<crate::config::ConfigError> for BeaconError {
    fn from(err: crate::config::ConfigError) -> Self {
        use crate::config::ConfigError;
        match err {
            ConfigError::NotFound(path) => Self::ConfigNotFound(path),
            ConfigError::Load(e) => Self::ConfigParseError(e.to_string()),
            ConfigError::ValidationError { field, message } => {
                Self::ConfigValidationError(format!("{field}: {message}"))
            }
            ConfigError::MultipleValidationErrors(errors) => {
                let messages: Vec<String> = errors.into_iter().map(|e| e.to_string()).collect();
                Self::ConfigValidationError(messages.join("; "))
            }
        }
    }
}

impl From<crate::bus::BusError> for BeaconError {
    fn from(err: crate::bus::BusError) -> Self {
        use crate::bus::BusError;
        match err {
            BusError::ConnectionFailed { message } => Self::BusConnectionFailed(message),
            BusError::Disconnected => Self::BusConnectionFailed("not connected".to_string()),
            BusError::PublishRejected { topic, message } => {
                Self::BusPublishFailed(format!("{topic}: {message}"))
            }
            BusError::Serialize(e) => Self::MessageEncoding(e.to_string()),
        }
    }
}

impl From<crate::discovery::ScanError> for BeaconError {
    fn from(err: crate::discovery::ScanError) -> Self {
        use crate::discovery::ScanError;
        match err {
            ScanError::AdapterNotFound => Self::BluetoothAdapterNotFound,
            ScanError::AdapterPoweredOff => Self::BluetoothAdapterPoweredOff,
            ScanError::SessionInitFailed { message } | ScanError::DiscoveryFailed { message } => {
                Self::BluetoothScanFailed(message)
            }
            ScanError::Unsupported { reason } => Self::BluetoothUnsupported(reason),
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_classification() {
        assert!(BeaconError::ConfigNotFound(PathBuf::from("/test")).is_config_error());
        assert!(BeaconError::ConfigParseError("syntax error".into()).is_config_error());
        assert!(BeaconError::ConfigValidationError("invalid value".into()).is_config_error());

        assert!(!BeaconError::BluetoothAdapterNotFound.is_config_error());
    }

    #[test]
    fn test_recoverable_errors() {
        assert!(BeaconError::BusConnectionFailed("refused".into()).is_recoverable());
        assert!(BeaconError::BluetoothScanFailed("timeout".into()).is_recoverable());
        assert!(!BeaconError::BluetoothAdapterNotFound.is_recoverable());
        assert!(!BeaconError::ConfigNotFound(PathBuf::new()).is_recoverable());
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(BeaconError::ConfigNotFound(PathBuf::new()).exit_code(), EXIT_CONFIG);
        assert_eq!(
            BeaconError::ConfigValidationError("bad".into()).exit_code(),
            EXIT_CONFIG
        );
        assert_eq!(
            BeaconError::BluetoothAdapterNotFound.exit_code(),
            EXIT_FAILURE
        );
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(
            BeaconError::BluetoothAdapterNotFound.error_code(),
            "BLUETOOTH_ADAPTER_NOT_FOUND"
        );
        assert_eq!(
            BeaconError::ConfigNotFound(PathBuf::new()).error_code(),
            "CONFIG_NOT_FOUND"
        );
        assert_eq!(
            BeaconError::BusPublishFailed(String::new()).error_code(),
            "BUS_PUBLISH_FAILED"
        );
    }

    #[test]
    fn test_from_scan_error() {
        let err: BeaconError = crate::discovery::ScanError::DiscoveryFailed {
            message: "org.bluez.Error.NotReady".into(),
        }
        .into();
        assert_eq!(err.error_code(), "BLUETOOTH_SCAN_FAILED");
        assert!(err.is_recoverable());

        let err: BeaconError = crate::discovery::ScanError::AdapterNotFound.into();
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_from_bus_error() {
        let err: BeaconError = crate::bus::BusError::PublishRejected {
            topic: "home/presence".into(),
            message: "queue full".into(),
        }
        .into();
        assert!(matches!(err, BeaconError::BusPublishFailed(ref m) if m.contains("home/presence")));

        let err: BeaconError = crate::bus::BusError::Disconnected.into();
        assert_eq!(err.error_code(), "BUS_CONNECTION_FAILED");

        let encoding = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err: BeaconError = crate::bus::BusError::Serialize(encoding).into();
        assert_eq!(err.error_code(), "MESSAGE_ENCODING");
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_error_display_messages() {
        let err = BeaconError::BluetoothAdapterNotFound;
        assert!(format!("{err}").contains("No Bluetooth adapter found"));

        let err = BeaconError::ConfigNotFound(PathBuf::from("config.yaml"));
        assert!(format!("{err}").contains("config.yaml"));
    }

    #[test]
    fn test_error_is_send_and_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<BeaconError>();
        assert_sync::<BeaconError>();
    }
}
