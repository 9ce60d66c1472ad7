//! In-memory collaborators for tests.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::bus::{BusError, BusResult, MessageBus, QualityOfService};
use crate::discovery::{ObservationSource, ScanError, ScanResult};
use crate::shutdown::ShutdownTrigger;
use crate::types::Observation;

/// Source replaying one batch of observations per window.
///
/// Windows past the end of the script see nothing.
#[derive(Debug, Default)]
pub struct ScriptedSource {
    windows: VecDeque<Vec<Observation>>,
    fail: bool,
    stop: Option<ShutdownTrigger>,
    pub scans: usize,
}

impl ScriptedSource {
    pub fn new(windows: Vec<Vec<Observation>>) -> Self {
        Self {
            windows: windows.into(),
            ..Self::default()
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    /// Fire `trigger` once the last scripted window has been replayed.
    pub fn stop_when_exhausted(mut self, trigger: ShutdownTrigger) -> Self {
        self.stop = Some(trigger);
        self
    }
}

#[async_trait]
impl ObservationSource for ScriptedSource {
    async fn scan(&mut self, _window: Duration, sink: mpsc::Sender<Observation>) -> ScanResult<()> {
        self.scans += 1;
        if self.fail {
            return Err(ScanError::DiscoveryFailed {
                message: "adapter went away".into(),
            });
        }
        for observation in self.windows.pop_front().unwrap_or_default() {
            if sink.send(observation).await.is_err() {
                break;
            }
        }
        if self.windows.is_empty() {
            if let Some(trigger) = &self.stop {
                trigger.trigger();
            }
        }
        Ok(())
    }
}

/// A message the bus accepted.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivered {
    pub topic: String,
    pub payload: serde_json::Value,
    pub qos: QualityOfService,
}

/// Bus that records deliveries and fails on demand.
#[derive(Debug, Default)]
pub struct RecordingBus {
    pub delivered: Vec<Delivered>,
    pub publish_attempts: usize,
    pub connect_attempts: usize,
    pub disconnects: usize,
    /// Remaining publish calls to reject.
    pub failing_publishes: usize,
    /// Remaining connect calls to refuse.
    pub failing_connects: usize,
    connected: bool,
}

impl RecordingBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rejecting(publishes: usize) -> Self {
        Self {
            failing_publishes: publishes,
            ..Self::default()
        }
    }

    pub fn refusing(connects: usize) -> Self {
        Self {
            failing_connects: connects,
            ..Self::default()
        }
    }

    pub fn drop_connection(&mut self) {
        self.connected = false;
    }
}

#[async_trait]
impl MessageBus for RecordingBus {
    async fn connect(&mut self) -> BusResult<()> {
        self.connect_attempts += 1;
        if self.failing_connects > 0 {
            self.failing_connects -= 1;
            return Err(BusError::ConnectionFailed {
                message: "connection refused".into(),
            });
        }
        self.connected = true;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn publish(
        &mut self,
        topic: &str,
        payload: Vec<u8>,
        qos: QualityOfService,
    ) -> BusResult<()> {
        self.publish_attempts += 1;
        if !self.connected {
            return Err(BusError::Disconnected);
        }
        if self.failing_publishes > 0 {
            self.failing_publishes -= 1;
            return Err(BusError::PublishRejected {
                topic: topic.to_string(),
                message: "broker busy".into(),
            });
        }
        self.delivered.push(Delivered {
            topic: topic.to_string(),
            payload: serde_json::from_slice(&payload)?,
            qos,
        });
        Ok(())
    }

    async fn disconnect(&mut self) -> BusResult<()> {
        self.disconnects += 1;
        self.connected = false;
        Ok(())
    }
}
