//! MQTT transport over rumqttc.
//!
//! `connect` drives the event loop inline until the broker's CONNACK arrives,
//! then hands the loop to a background task. That task forwards every
//! incoming PUBLISH into the inbound channel, restores subscriptions after a
//! reconnect and backs off briefly on connection errors. The client side of
//! rumqttc queues publishes without waiting for delivery.

use super::{InboundMessage, PubSubTransport, TransportConfig, TransportState};
use crate::cli::QosLevel;
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use rumqttc::{AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Capacity of the request queue between client handles and the event loop
const REQUEST_CHANNEL_CAPACITY: usize = 64;

/// Pause after a connection error before polling again
const RECONNECT_BACKOFF: Duration = Duration::from_millis(250);

/// How long `disconnect` waits for the event loop to wind down
const DISCONNECT_GRACE: Duration = Duration::from_secs(2);

const MAX_KEEPALIVE: Duration = Duration::from_secs(u16::MAX as u64);

impl From<QosLevel> for QoS {
    fn from(level: QosLevel) -> Self {
        match level {
            QosLevel::AtMostOnce => QoS::AtMostOnce,
            QosLevel::AtLeastOnce => QoS::AtLeastOnce,
            QosLevel::ExactlyOnce => QoS::ExactlyOnce,
        }
    }
}

/// MQTT transport implementation
pub struct MqttTransport {
    client: Option<AsyncClient>,
    state: Arc<Mutex<TransportState>>,
    subscriptions: Arc<Mutex<Vec<(String, QoS)>>>,
    event_task: Mutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl Default for MqttTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MqttTransport {
    /// Create a new, unconnected MQTT transport
    pub fn new() -> Self {
        Self {
            client: None,
            state: Arc::new(Mutex::new(TransportState::Uninitialized)),
            subscriptions: Arc::new(Mutex::new(Vec::new())),
            event_task: Mutex::new(None),
            cancel: CancellationToken::new(),
        }
    }

    fn client(&self) -> Result<&AsyncClient> {
        self.client
            .as_ref()
            .ok_or_else(|| anyhow!("MQTT transport is not connected"))
    }

    fn set_state(&self, state: TransportState) {
        *self.state.lock() = state;
    }
}

/// Build client options from the shared transport configuration
pub fn mqtt_options(config: &TransportConfig) -> MqttOptions {
    let mut options = MqttOptions::new(&config.client_id, &config.host, config.port);

    // rumqttc rejects keepalives between zero and one second, and the wire
    // field holds at most u16::MAX seconds
    let keepalive = if config.keepalive.is_zero() {
        Duration::ZERO
    } else {
        config
            .keepalive
            .clamp(Duration::from_secs(1), MAX_KEEPALIVE)
    };
    options.set_keep_alive(keepalive);
    options.set_clean_session(true);
    options.set_max_packet_size(config.max_packet_size, config.max_packet_size);

    if let Some((username, password)) = config.credentials() {
        options.set_credentials(username, password);
    }

    options
}

/// Poll until the broker accepts the session
async fn wait_for_connack(eventloop: &mut EventLoop) -> Result<()> {
    loop {
        match eventloop.poll().await.context("MQTT connection failed")? {
            Event::Incoming(Packet::ConnAck(ack)) => {
                if ack.code != ConnectReturnCode::Success {
                    bail!("Broker refused connection: {:?}", ack.code);
                }
                return Ok(());
            }
            event => trace!("Event before CONNACK: {:?}", event),
        }
    }
}

/// Mark the session live again and re-issue every remembered subscription
///
/// Sessions are clean, so the broker forgets subscriptions across reconnects.
/// Returns how many SUBSCRIBE requests were queued.
fn on_reconnect(
    client: &AsyncClient,
    state: &Mutex<TransportState>,
    subscriptions: &Mutex<Vec<(String, QoS)>>,
) -> usize {
    *state.lock() = TransportState::Connected;

    let remembered = subscriptions.lock().clone();
    let mut queued = 0;
    for (topic, qos) in remembered {
        match client.try_subscribe(topic.clone(), qos) {
            Ok(()) => queued += 1,
            Err(e) => warn!("Failed to restore subscription to {}: {}", topic, e),
        }
    }
    queued
}

/// Background loop forwarding broker traffic until disconnect or cancellation
async fn drive_event_loop(
    mut eventloop: EventLoop,
    client: AsyncClient,
    inbound: mpsc::Sender<InboundMessage>,
    state: Arc<Mutex<TransportState>>,
    subscriptions: Arc<Mutex<Vec<(String, QoS)>>>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = eventloop.poll() => event,
        };

        match event {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let message = InboundMessage::new(publish.topic, publish.payload);
                if inbound.send(message).await.is_err() {
                    debug!("Inbound receiver dropped, stopping MQTT event loop");
                    break;
                }
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("Reconnected to MQTT broker");
                let restored = on_reconnect(&client, &state, &subscriptions);
                debug!("Restored {} subscriptions", restored);
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!("DISCONNECT sent, stopping MQTT event loop");
                break;
            }
            Ok(event) => trace!("MQTT event: {:?}", event),
            Err(e) => {
                warn!("MQTT connection error: {}", e);
                *state.lock() = TransportState::Reconnecting;
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(RECONNECT_BACKOFF) => {}
                }
            }
        }
    }

    *state.lock() = TransportState::Disconnected;
}

#[async_trait]
impl PubSubTransport for MqttTransport {
    async fn connect(&mut self, config: &TransportConfig) -> Result<mpsc::Receiver<InboundMessage>> {
        debug!(
            "Connecting to MQTT broker at {}:{} as {}",
            config.host, config.port, config.client_id
        );
        self.set_state(TransportState::Connecting);

        let (client, mut eventloop) = AsyncClient::new(mqtt_options(config), REQUEST_CHANNEL_CAPACITY);

        let connected = tokio::time::timeout(config.connect_timeout, wait_for_connack(&mut eventloop))
            .await
            .map_err(|_| {
                anyhow!(
                    "Timed out after {:?} connecting to {}:{}",
                    config.connect_timeout,
                    config.host,
                    config.port
                )
            })
            .and_then(|result| result);
        if let Err(e) = connected {
            self.set_state(TransportState::Disconnected);
            return Err(e);
        }

        self.set_state(TransportState::Connected);
        info!("Connected to MQTT broker at {}:{}", config.host, config.port);

        let (tx, rx) = mpsc::channel(config.inbound_capacity.max(1));
        let handle = tokio::spawn(drive_event_loop(
            eventloop,
            client.clone(),
            tx,
            Arc::clone(&self.state),
            Arc::clone(&self.subscriptions),
            self.cancel.clone(),
        ));

        *self.event_task.lock() = Some(handle);
        self.client = Some(client);
        Ok(rx)
    }

    async fn subscribe(&self, topic: &str, qos: QosLevel) -> Result<()> {
        let qos = QoS::from(qos);
        self.client()?
            .subscribe(topic, qos)
            .await
            .with_context(|| format!("Failed to subscribe to {}", topic))?;
        self.subscriptions.lock().push((topic.to_string(), qos));
        debug!("Subscribed to {}", topic);
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: QosLevel) -> Result<()> {
        self.client()?
            .publish(topic, qos.into(), false, payload)
            .await
            .with_context(|| format!("Failed to publish to {}", topic))
    }

    async fn disconnect(&self) -> Result<()> {
        if let Some(client) = &self.client {
            if let Err(e) = client.try_disconnect() {
                debug!("Disconnect request not queued: {}", e);
            }
        }

        let handle = self.event_task.lock().take();
        if let Some(mut handle) = handle {
            if tokio::time::timeout(DISCONNECT_GRACE, &mut handle).await.is_err() {
                warn!("MQTT event loop did not stop within {:?}", DISCONNECT_GRACE);
                self.cancel.cancel();
                handle.abort();
            }
        }

        self.cancel.cancel();
        self.set_state(TransportState::Disconnected);
        info!("Disconnected from MQTT broker");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "MQTT"
    }

    fn state(&self) -> TransportState {
        *self.state.lock()
    }
}
