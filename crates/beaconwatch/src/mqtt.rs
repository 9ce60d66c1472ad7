//! MQTT message bus backed by rumqttc.
//!
//! rumqttc splits a connection into an [`AsyncClient`] handle and an
//! [`EventLoop`] that must be polled for anything to happen. Each call to
//! [`MessageBus::connect`] starts a fresh event loop on its own task; the task
//! reports the link state through a `watch` channel and exits on the first
//! connection error. Reconnect pacing is left to the publisher.
//!
//! A publish only succeeds once the broker has it: for QoS 0 when the packet
//! is written, for QoS 1 on PUBACK and for QoS 2 on PUBCOMP. Anything still
//! unacknowledged when the link drops is reported as a failure so the
//! publisher sends it again on the next connection.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use beaconwatch_core::{BusError, BusResult, MessageBus, MqttConfig, QualityOfService};
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS,
};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// How long to wait for the broker's CONNACK.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// How long a publish may wait for its acknowledgement.
pub const ACK_TIMEOUT: Duration = Duration::from_secs(10);

/// How long a clean disconnect may take before the event loop is dropped.
const DISCONNECT_GRACE: Duration = Duration::from_secs(2);

/// Capacity of the client's request channel.
const REQUEST_CAPACITY: usize = 64;

/// Shortest keep-alive interval offered to the broker.
const MIN_KEEP_ALIVE_SECS: u64 = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
enum LinkState {
    Connecting,
    Connected,
    Failed(String),
    Closed,
}

/// Completed once the broker has taken the matching publish.
type AckWaiter = oneshot::Sender<()>;

/// [`MessageBus`] over an MQTT broker connection.
pub struct MqttBus {
    options: MqttOptions,
    connect_timeout: Duration,
    ack_timeout: Duration,
    client: Option<AsyncClient>,
    waiters: Option<mpsc::UnboundedSender<AckWaiter>>,
    driver: Option<JoinHandle<()>>,
    link: watch::Receiver<LinkState>,
}

impl MqttBus {
    /// Build a bus from broker settings. Nothing is opened until
    /// [`MessageBus::connect`].
    #[must_use]
    pub fn new(config: &MqttConfig) -> Self {
        let (_, link) = watch::channel(LinkState::Closed);
        Self {
            options: mqtt_options(config),
            connect_timeout: CONNECT_TIMEOUT,
            ack_timeout: ACK_TIMEOUT,
            client: None,
            waiters: None,
            driver: None,
            link,
        }
    }

    /// Use a different CONNACK timeout.
    #[must_use]
    pub const fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Use a different acknowledgement timeout.
    #[must_use]
    pub const fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    fn teardown(&mut self) {
        self.client = None;
        self.waiters = None;
        if let Some(driver) = self.driver.take() {
            driver.abort();
        }
    }
}

impl Drop for MqttBus {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl std::fmt::Debug for MqttBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (host, port) = self.options.broker_address();
        f.debug_struct("MqttBus")
            .field("broker", &format!("{host}:{port}"))
            .field("client_id", &self.options.client_id())
            .field("link", &*self.link.borrow())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl MessageBus for MqttBus {
    async fn connect(&mut self) -> BusResult<()> {
        if self.is_connected() {
            return Ok(());
        }
        self.teardown();

        let (host, port) = self.options.broker_address();
        debug!(broker = %host, port, "Connecting to MQTT broker");

        let (client, eventloop) = AsyncClient::new(self.options.clone(), REQUEST_CAPACITY);
        let (state_tx, mut link) = watch::channel(LinkState::Connecting);
        let (waiters_tx, waiters_rx) = mpsc::unbounded_channel();
        self.driver = Some(tokio::spawn(drive(eventloop, state_tx, waiters_rx)));
        self.client = Some(client);
        self.waiters = Some(waiters_tx);

        let settled = {
            let waited = tokio::time::timeout(
                self.connect_timeout,
                link.wait_for(|state| *state != LinkState::Connecting),
            )
            .await;
            match waited {
                Ok(Ok(state)) => state.clone(),
                Ok(Err(_)) => LinkState::Failed("connection task ended".to_string()),
                Err(_) => LinkState::Failed(format!(
                    "no CONNACK within {}s",
                    self.connect_timeout.as_secs()
                )),
            }
        };
        self.link = link;

        match settled {
            LinkState::Connected => {
                debug!(broker = %host, port, "CONNACK received");
                Ok(())
            }
            LinkState::Failed(message) => {
                self.teardown();
                Err(BusError::ConnectionFailed { message })
            }
            LinkState::Connecting | LinkState::Closed => {
                self.teardown();
                Err(BusError::ConnectionFailed {
                    message: "connection closed during handshake".to_string(),
                })
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.client.is_some() && *self.link.borrow() == LinkState::Connected
    }

    async fn publish(
        &mut self,
        topic: &str,
        payload: Vec<u8>,
        qos: QualityOfService,
    ) -> BusResult<()> {
        if !self.is_connected() {
            return Err(BusError::Disconnected);
        }
        let (Some(client), Some(waiters)) = (self.client.as_ref(), self.waiters.as_ref()) else {
            return Err(BusError::Disconnected);
        };

        // requests reach the event loop in order, so waiters are registered in the same order
        let (ack_tx, ack_rx) = oneshot::channel();
        waiters.send(ack_tx).map_err(|_| BusError::Disconnected)?;
        client
            .publish(topic, to_qos(qos), false, payload)
            .await
            .map_err(|e| BusError::PublishRejected {
                topic: topic.to_string(),
                message: e.to_string(),
            })?;

        match tokio::time::timeout(self.ack_timeout, ack_rx).await {
            Ok(Ok(())) => {
                trace!(topic, "Publish acknowledged");
                Ok(())
            }
            Ok(Err(_)) => Err(BusError::Disconnected),
            Err(_) => Err(BusError::PublishRejected {
                topic: topic.to_string(),
                message: format!("no acknowledgement within {}s", self.ack_timeout.as_secs()),
            }),
        }
    }

    async fn disconnect(&mut self) -> BusResult<()> {
        self.waiters = None;
        if let Some(client) = self.client.take() {
            if *self.link.borrow() == LinkState::Connected {
                if let Err(e) = client.disconnect().await {
                    debug!(error = %e, "Disconnect request not sent");
                }
            }
        }

        if let Some(mut driver) = self.driver.take() {
            if tokio::time::timeout(DISCONNECT_GRACE, &mut driver).await.is_err() {
                driver.abort();
            }
        }
        Ok(())
    }
}

async fn drive(
    mut eventloop: EventLoop,
    state: watch::Sender<LinkState>,
    mut waiters: mpsc::UnboundedReceiver<AckWaiter>,
) {
    let mut unacked: HashMap<u16, AckWaiter> = HashMap::new();
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                if ack.code == ConnectReturnCode::Success {
                    state.send_replace(LinkState::Connected);
                } else {
                    state.send_replace(LinkState::Failed(format!(
                        "broker refused connection: {:?}",
                        ack.code
                    )));
                    return;
                }
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                warn!("Broker closed the connection");
                state.send_replace(LinkState::Failed("broker closed the connection".to_string()));
                return;
            }
            Ok(Event::Outgoing(Outgoing::Publish(pkid))) => {
                if let Ok(waiter) = waiters.try_recv() {
                    if pkid == 0 {
                        let _ = waiter.send(());
                    } else {
                        unacked.insert(pkid, waiter);
                    }
                }
            }
            Ok(Event::Incoming(Packet::PubAck(ack))) => acknowledge(&mut unacked, ack.pkid),
            Ok(Event::Incoming(Packet::PubComp(comp))) => acknowledge(&mut unacked, comp.pkid),
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                state.send_replace(LinkState::Closed);
                return;
            }
            Ok(event) => trace!(?event, "MQTT event"),
            Err(e) => {
                if *state.borrow() == LinkState::Connected {
                    warn!(error = %e, "MQTT connection lost");
                }
                state.send_replace(LinkState::Failed(e.to_string()));
                return;
            }
        }
    }
}

fn acknowledge(unacked: &mut HashMap<u16, AckWaiter>, pkid: u16) {
    if let Some(waiter) = unacked.remove(&pkid) {
        let _ = waiter.send(());
    }
}

fn mqtt_options(config: &MqttConfig) -> MqttOptions {
    let mut options = MqttOptions::new(&config.client_id, &config.broker, config.port);
    options.set_keep_alive(Duration::from_secs(
        config.keep_alive_secs.max(MIN_KEEP_ALIVE_SECS),
    ));
    options.set_clean_session(true);
    if let Some((username, password)) = config.credentials() {
        options.set_credentials(username, password);
    }
    options
}

const fn to_qos(qos: QualityOfService) -> QoS {
    match qos {
        QualityOfService::AtMostOnce => QoS::AtMostOnce,
        QualityOfService::AtLeastOnce => QoS::AtLeastOnce,
        QualityOfService::ExactlyOnce => QoS::ExactlyOnce,
    }
}
