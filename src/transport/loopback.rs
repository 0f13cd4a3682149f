use super::{topic_matches, InboundMessage, PubSubTransport, TransportConfig, TransportState};
use crate::cli::QosLevel;
use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// In-process transport that delivers publishes back to its own subscriber
///
/// Stands in for a broker in self-tests: a publish whose topic matches one of
/// the subscribed filters is pushed straight into the inbound channel.
pub struct LoopbackTransport {
    state: Mutex<TransportState>,
    inbound: Mutex<Option<mpsc::Sender<InboundMessage>>>,
    subscriptions: Mutex<Vec<String>>,
}

impl Default for LoopbackTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(TransportState::Uninitialized),
            inbound: Mutex::new(None),
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    fn is_subscribed(&self, topic: &str) -> bool {
        self.subscriptions
            .lock()
            .iter()
            .any(|filter| topic_matches(filter, topic))
    }
}

#[async_trait]
impl PubSubTransport for LoopbackTransport {
    async fn connect(&mut self, config: &TransportConfig) -> Result<mpsc::Receiver<InboundMessage>> {
        let (tx, rx) = mpsc::channel(config.inbound_capacity.max(1));
        *self.inbound.lock() = Some(tx);
        *self.state.lock() = TransportState::Connected;
        debug!("Loopback transport connected as {}", config.client_id);
        Ok(rx)
    }

    async fn subscribe(&self, topic: &str, _qos: QosLevel) -> Result<()> {
        if topic.is_empty() {
            bail!("Cannot subscribe to an empty topic filter");
        }
        self.subscriptions.lock().push(topic.to_string());
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>, _qos: QosLevel) -> Result<()> {
        if self.state() != TransportState::Connected {
            bail!("Loopback transport is not connected");
        }
        if !self.is_subscribed(topic) {
            trace!("No loopback subscriber for {}", topic);
            return Ok(());
        }

        let sender = self
            .inbound
            .lock()
            .clone()
            .ok_or_else(|| anyhow!("Loopback transport is not connected"))?;
        sender
            .send(InboundMessage::new(topic, payload))
            .await
            .map_err(|_| anyhow!("Loopback inbound channel closed"))
    }

    async fn disconnect(&self) -> Result<()> {
        // Dropping the sender ends the inbound stream
        self.inbound.lock().take();
        *self.state.lock() = TransportState::Disconnected;
        debug!("Loopback transport disconnected");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "Loopback"
    }

    fn state(&self) -> TransportState {
        *self.state.lock()
    }
}
