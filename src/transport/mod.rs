use crate::cli::{QosLevel, TransportKind};
use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::sync::mpsc;

pub mod loopback;
pub mod mqtt;

pub use loopback::LoopbackTransport;
pub use mqtt::MqttTransport;

/// A message delivered by the transport
///
/// `received_at` is captured the moment the transport hands the message over,
/// before it waits in the inbound channel, so queueing inside the harness
/// counts as latency.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Bytes,
    pub received_at: DateTime<Utc>,
}

impl InboundMessage {
    /// Wrap a delivered payload, stamping it with the current time
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self::received_at(topic, payload, Utc::now())
    }

    /// Wrap a delivered payload with an explicit receive time
    pub fn received_at(
        topic: impl Into<String>,
        payload: impl Into<Bytes>,
        received_at: DateTime<Utc>,
    ) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            received_at,
        }
    }
}

/// Connection settings shared by all transports
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub keepalive: Duration,
    pub username: Option<String>,
    pub password: Option<String>,
    pub connect_timeout: Duration,
    pub max_packet_size: usize,
    pub inbound_capacity: usize,
}

impl TransportConfig {
    /// Username and password, only when both are present
    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (self.username.as_deref(), self.password.as_deref()) {
            (Some(username), Some(password)) => Some((username, password)),
            _ => None,
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            host: crate::defaults::BROKER.to_string(),
            port: crate::defaults::PORT,
            client_id: crate::utils::generate_client_id(),
            keepalive: Duration::from_secs(crate::defaults::KEEPALIVE_SECS),
            username: None,
            password: None,
            connect_timeout: crate::defaults::CONNECT_TIMEOUT,
            max_packet_size: crate::defaults::MAX_PACKET_SIZE,
            inbound_capacity: crate::defaults::INBOUND_CHANNEL_CAPACITY,
        }
    }
}

/// Transport state for tracking connection status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Uninitialized,
    Connecting,
    Connected,
    Reconnecting,
    Disconnected,
}

/// Generic publish/subscribe transport interface
///
/// `connect` takes `&mut self` and runs once before the transport is shared;
/// everything after that takes `&self` so the publisher can publish while the
/// transport's own delivery machinery pushes inbound messages concurrently.
#[async_trait]
pub trait PubSubTransport: Send + Sync {
    /// Connect and return the channel inbound messages will be delivered on
    async fn connect(&mut self, config: &TransportConfig) -> Result<mpsc::Receiver<InboundMessage>>;

    /// Subscribe to a topic filter
    async fn subscribe(&self, topic: &str, qos: QosLevel) -> Result<()>;

    /// Publish a payload without waiting for delivery
    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: QosLevel) -> Result<()>;

    /// Close the connection; the inbound channel ends afterwards
    async fn disconnect(&self) -> Result<()>;

    /// Get transport name for identification
    fn name(&self) -> &'static str;

    /// Current connection state
    fn state(&self) -> TransportState;
}

/// Transport factory for creating transport instances
pub struct TransportFactory;

impl TransportFactory {
    /// Create a new, unconnected transport of the given kind
    pub fn create(kind: TransportKind) -> Box<dyn PubSubTransport> {
        match kind {
            TransportKind::Mqtt => Box::new(MqttTransport::new()),
            TransportKind::Loopback => Box::new(LoopbackTransport::new()),
        }
    }
}

/// Match a topic name against an MQTT topic filter
///
/// `+` matches exactly one level, a trailing `#` matches the parent level and
/// everything below it. Topics starting with `$` are not matched by a
/// leading wildcard.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');
    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(f), Some(t)) if f == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}
