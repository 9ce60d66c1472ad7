//! Reliable delivery of presence messages.
//!
//! Delivery discipline:
//! - The bus connection is established lazily before every attempt; a refused
//!   handshake is retried on a fixed delay until it succeeds or shutdown is
//!   requested.
//! - A rejected publish is retried with exponential backoff, up to
//!   [`RetryPolicy::max_attempts`] times (`0` retries forever).
//! - When attempts run out the circuit breaker opens for
//!   [`RetryPolicy::breaker_cooldown`]; messages arriving meanwhile are queued
//!   instead of sent.
//! - Nothing is dropped silently. Undelivered messages wait in a bounded
//!   queue and go out, oldest first, ahead of the next new message. When the
//!   queue is full the oldest entry is evicted with a warning.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::bus::{BusResult, MessageBus, QualityOfService};
use crate::error::BeaconError;
use crate::shutdown::Shutdown;
use crate::types::{DeviceId, Emission};

/// Retry, breaker and queueing limits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Fixed delay between connection attempts.
    pub reconnect_delay: Duration,
    /// Publish attempts per message before giving up; `0` never gives up.
    pub max_attempts: u32,
    /// Delay after the first failed attempt.
    pub initial_backoff: Duration,
    /// Upper bound for the doubled delay.
    pub max_backoff: Duration,
    /// How long the breaker stays open once tripped.
    pub breaker_cooldown: Duration,
    /// Capacity of the undelivered message queue.
    pub pending_capacity: usize,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            reconnect_delay: Duration::from_secs(5),
            max_attempts: 5,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            breaker_cooldown: Duration::from_secs(60),
            pending_capacity: 256,
        }
    }
}

impl RetryPolicy {
    /// Delay before retrying after the `attempt`-th failure (1-based).
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.initial_backoff
            .saturating_mul(1 << exponent)
            .min(self.max_backoff)
    }
}

/// What happened to a message handed to [`Publisher::publish`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Delivered to the bus, together with everything queued before it.
    Delivered,
    /// Skipped because the status equals the newest queued or delivered one.
    Suppressed,
    /// Kept in the pending queue for a later attempt.
    Queued,
    /// Shutdown interrupted delivery; the message is still queued.
    Cancelled,
}

#[derive(Debug, Clone)]
struct PendingMessage {
    device: DeviceId,
    subtopic: String,
    topic: String,
    detected: bool,
    payload: Vec<u8>,
}

enum Attempt {
    Delivered,
    Exhausted,
    Cancelled,
}

/// Publishes presence messages on a [`MessageBus`].
pub struct Publisher<B> {
    bus: B,
    base_topic: String,
    qos: QualityOfService,
    policy: RetryPolicy,
    suppress_unchanged: bool,
    last_delivered: HashMap<(DeviceId, String), bool>,
    pending: VecDeque<PendingMessage>,
    breaker_open_until: Option<Instant>,
    shutdown: Shutdown,
}

impl<B: MessageBus> Publisher<B> {
    /// Create a publisher for messages below `base_topic`.
    pub fn new(
        bus: B,
        base_topic: impl Into<String>,
        qos: QualityOfService,
        policy: RetryPolicy,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            bus,
            base_topic: base_topic.into(),
            qos,
            policy,
            suppress_unchanged: false,
            last_delivered: HashMap::new(),
            pending: VecDeque::new(),
            breaker_open_until: None,
            shutdown,
        }
    }

    /// Skip messages whose detected status equals the newest one queued or
    /// delivered for the same device and subtopic.
    #[must_use]
    pub fn with_change_suppression(mut self, enabled: bool) -> Self {
        self.suppress_unchanged = enabled;
        self
    }

    /// Full topic for a device subtopic.
    #[must_use]
    pub fn topic_for(&self, subtopic: &str) -> String {
        if subtopic.is_empty() {
            self.base_topic.clone()
        } else {
            format!("{}/{}", self.base_topic, subtopic)
        }
    }

    /// Number of messages waiting for delivery.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// The underlying bus.
    pub const fn bus(&self) -> &B {
        &self.bus
    }

    /// Mutable access to the underlying bus.
    pub fn bus_mut(&mut self) -> &mut B {
        &mut self.bus
    }

    /// Deliver `emission`, after anything still queued.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Serialize`](crate::bus::BusError::Serialize) if the
    /// message cannot be encoded. Transport failures are never returned; they
    /// are retried or queued.
    pub async fn publish(&mut self, emission: &Emission) -> BusResult<PublishOutcome> {
        let detected = emission.message.detected;
        let key = (emission.device.clone(), emission.subtopic.clone());

        if self.suppress_unchanged && self.latest_status(&key) == Some(detected) {
            info!(
                device = %emission.device,
                subtopic = %emission.subtopic,
                "No changes for device"
            );
            return Ok(PublishOutcome::Suppressed);
        }

        let message = PendingMessage {
            device: emission.device.clone(),
            subtopic: emission.subtopic.clone(),
            topic: self.topic_for(&emission.subtopic),
            detected,
            payload: serde_json::to_vec(&emission.message)?,
        };
        self.enqueue(message);

        if self.breaker_is_open() {
            debug!(pending = self.pending.len(), "Circuit breaker open, message queued");
            return Ok(PublishOutcome::Queued);
        }

        Ok(self.flush().await)
    }

    /// Disconnect from the bus, reporting anything left undelivered.
    ///
    /// # Errors
    ///
    /// Returns the bus error if disconnecting fails.
    pub async fn close(&mut self) -> BusResult<()> {
        if !self.pending.is_empty() {
            warn!(
                pending = self.pending.len(),
                "Shutting down with undelivered presence messages"
            );
        }
        if self.bus.is_connected() {
            self.bus.disconnect().await?;
            info!("Disconnected from broker");
        }
        Ok(())
    }

    /// Newest status for a device subtopic, queued or delivered.
    fn latest_status(&self, key: &(DeviceId, String)) -> Option<bool> {
        self.pending
            .iter()
            .rev()
            .find(|m| m.device == key.0 && m.subtopic == key.1)
            .map(|m| m.detected)
            .or_else(|| self.last_delivered.get(key).copied())
    }

    fn enqueue(&mut self, message: PendingMessage) {
        if self.pending.len() >= self.policy.pending_capacity.max(1) {
            if let Some(evicted) = self.pending.pop_front() {
                warn!(
                    device = %evicted.device,
                    topic = %evicted.topic,
                    detected = evicted.detected,
                    "Pending queue full, evicting oldest undelivered message"
                );
            }
        }
        self.pending.push_back(message);
    }

    fn breaker_is_open(&mut self) -> bool {
        match self.breaker_open_until {
            Some(until) if Instant::now() < until => true,
            Some(_) => {
                info!("Circuit breaker closed, resuming delivery");
                self.breaker_open_until = None;
                false
            }
            None => false,
        }
    }

    async fn flush(&mut self) -> PublishOutcome {
        while let Some(message) = self.pending.pop_front() {
            match self.deliver(&message).await {
                Attempt::Delivered => {
                    self.last_delivered
                        .insert((message.device, message.subtopic), message.detected);
                }
                Attempt::Exhausted => {
                    self.pending.push_front(message);
                    self.breaker_open_until = Some(Instant::now() + self.policy.breaker_cooldown);
                    warn!(
                        pending = self.pending.len(),
                        cooldown_secs = self.policy.breaker_cooldown.as_secs(),
                        "Publish attempts exhausted, circuit breaker open"
                    );
                    return PublishOutcome::Queued;
                }
                Attempt::Cancelled => {
                    self.pending.push_front(message);
                    return PublishOutcome::Cancelled;
                }
            }
        }
        PublishOutcome::Delivered
    }

    async fn deliver(&mut self, message: &PendingMessage) -> Attempt {
        let mut attempt = 0u32;
        loop {
            if !self.ensure_connected().await {
                return Attempt::Cancelled;
            }

            attempt += 1;
            match self
                .bus
                .publish(&message.topic, message.payload.clone(), self.qos)
                .await
            {
                Ok(()) => {
                    debug!(
                        topic = %message.topic,
                        detected = message.detected,
                        attempt,
                        "Presence message published"
                    );
                    return Attempt::Delivered;
                }
                Err(e) => {
                    let e = BeaconError::from(e);
                    warn!(
                        topic = %message.topic,
                        attempt,
                        code = e.error_code(),
                        error = %e,
                        "Publish failed"
                    );
                    if self.policy.max_attempts != 0 && attempt >= self.policy.max_attempts {
                        return Attempt::Exhausted;
                    }
                    if !self.shutdown.sleep(self.policy.backoff(attempt)).await {
                        return Attempt::Cancelled;
                    }
                }
            }
        }
    }

    /// Connect if needed, retrying on a fixed delay. Returns `false` if
    /// shutdown was requested before a connection was made.
    async fn ensure_connected(&mut self) -> bool {
        while !self.bus.is_connected() {
            match self.bus.connect().await {
                Ok(()) => info!("Connected to broker"),
                Err(e) => {
                    let e = BeaconError::from(e);
                    warn!(
                        code = e.error_code(),
                        error = %e,
                        retry_in_secs = self.policy.reconnect_delay.as_secs(),
                        "Broker connection failed"
                    );
                    if !self.shutdown.sleep(self.policy.reconnect_delay).await {
                        return false;
                    }
                }
            }
        }
        true
    }
}
