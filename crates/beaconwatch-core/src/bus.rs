//! Message bus seam.
//!
//! The publisher only needs to connect, ask whether it is connected, and
//! publish bytes on a topic. The MQTT implementation lives in the binary
//! crate; tests use an in-memory bus.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised by message bus implementations.
#[derive(Debug, Error)]
pub enum BusError {
    /// The broker could not be reached or refused the handshake.
    #[error("Connection to broker failed: {message}")]
    ConnectionFailed {
        /// Underlying error message.
        message: String,
    },

    /// An operation needed a connection and there was none.
    #[error("Not connected to broker")]
    Disconnected,

    /// The broker was reachable but did not accept the message.
    #[error("Publish to '{topic}' rejected: {message}")]
    PublishRejected {
        /// Topic the message was sent to.
        topic: String,
        /// Underlying error message.
        message: String,
    },

    /// The message could not be encoded.
    #[error("Failed to serialize message: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Result type for bus operations.
pub type BusResult<T> = std::result::Result<T, BusError>;

/// Delivery guarantee requested for a publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum QualityOfService {
    /// Fire and forget (MQTT QoS 0).
    AtMostOnce,
    /// Acknowledged delivery, duplicates possible (MQTT QoS 1).
    #[default]
    AtLeastOnce,
    /// Exactly-once handshake (MQTT QoS 2).
    ExactlyOnce,
}

impl QualityOfService {
    /// Map an MQTT QoS level (0, 1 or 2).
    #[must_use]
    pub const fn from_level(level: u8) -> Option<Self> {
        match level {
            0 => Some(Self::AtMostOnce),
            1 => Some(Self::AtLeastOnce),
            2 => Some(Self::ExactlyOnce),
            _ => None,
        }
    }

    /// The MQTT QoS level.
    #[must_use]
    pub const fn level(self) -> u8 {
        match self {
            Self::AtMostOnce => 0,
            Self::AtLeastOnce => 1,
            Self::ExactlyOnce => 2,
        }
    }
}

/// A publish/subscribe transport.
#[async_trait]
pub trait MessageBus: Send {
    /// Establish the broker connection. Called only when
    /// [`is_connected`](Self::is_connected) is `false`.
    async fn connect(&mut self) -> BusResult<()>;

    /// Whether the last known connection state is up.
    fn is_connected(&self) -> bool;

    /// Publish `payload` on `topic`.
    async fn publish(&mut self, topic: &str, payload: Vec<u8>, qos: QualityOfService)
        -> BusResult<()>;

    /// Close the connection.
    async fn disconnect(&mut self) -> BusResult<()>;
}
