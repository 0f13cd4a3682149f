//! Publisher loop.
//!
//! Emits one envelope per tick at the configured frequency. Ticks come from a
//! `tokio::time::interval` with `MissedTickBehavior::Delay`: when a publish
//! overruns its slot the next tick is scheduled one full period after it, so
//! the loop never bursts to catch up and drifts from wall-clock alignment
//! instead.

use crate::cli::QosLevel;
use crate::envelope::Envelope;
use crate::metrics::StatsAggregator;
use crate::payload::PayloadGenerator;
use crate::records::{RecordLog, TransmissionRecord};
use crate::transport::PubSubTransport;
use crate::utils::{generate_message_id, now_iso, WallClock};
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Publishes synthetic envelopes at a fixed rate
pub struct Publisher {
    transport: Arc<dyn PubSubTransport>,
    generator: PayloadGenerator,
    topic: String,
    qos: QosLevel,
    period: Duration,
    sent: Arc<StatsAggregator>,
    tx_log: Option<Arc<RecordLog>>,
    clock: WallClock,
    max_messages: Option<u64>,
}

impl Publisher {
    /// Create a publisher sending `frequency` messages per second to `topic`
    pub fn new(
        transport: Arc<dyn PubSubTransport>,
        generator: PayloadGenerator,
        topic: impl Into<String>,
        qos: QosLevel,
        frequency: u32,
        sent: Arc<StatsAggregator>,
    ) -> Self {
        Self {
            transport,
            generator,
            topic: topic.into(),
            qos,
            period: tick_period(frequency),
            sent,
            tx_log: None,
            clock: WallClock::new(),
            max_messages: None,
        }
    }

    /// Append a transmission record for every published envelope
    pub fn with_record_log(mut self, tx_log: Arc<RecordLog>) -> Self {
        self.tx_log = Some(tx_log);
        self
    }

    /// Stop cleanly after `limit` messages
    pub fn with_max_messages(mut self, limit: Option<u64>) -> Self {
        self.max_messages = limit;
        self
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Build, publish and account for a single envelope
    ///
    /// The timestamp is taken before the payload is serialized. The size
    /// recorded in the sent-traffic aggregator and the transmission record is
    /// the length of the serialized envelope.
    pub async fn publish_one(&mut self) -> Result<TransmissionRecord> {
        let sent_at = self.clock.now();
        let envelope = Envelope::new(generate_message_id(), sent_at, self.generator.generate());
        let bytes = envelope
            .to_bytes()
            .context("Failed to serialize envelope")?;
        let payload_size = bytes.len();

        self.transport
            .publish(&self.topic, bytes, self.qos)
            .await
            .with_context(|| format!("Publish of message {} failed", envelope.id))?;
        self.sent.record_message(payload_size, None);

        let record = TransmissionRecord {
            time: now_iso(),
            id: envelope.id,
            payload_size,
        };
        if let Some(tx_log) = &self.tx_log {
            if let Err(e) = tx_log.append(&record) {
                warn!("Failed to write transmission record: {:#}", e);
            }
        }

        Ok(record)
    }

    /// Run until cancelled, the message limit is reached, or a publish fails
    ///
    /// Returns the number of envelopes published. A publish failure ends the
    /// loop with that error.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<u64> {
        info!(
            "Publishing to {} every {:?} (QoS {})",
            self.topic, self.period, self.qos
        );

        let mut ticker = tokio::time::interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut published = 0u64;
        loop {
            if let Some(limit) = self.max_messages {
                if published >= limit {
                    info!("Publisher reached its limit of {} messages", limit);
                    break;
                }
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let record = self.publish_one().await?;
            published += 1;
            debug!("Published {} ({} bytes)", record.id, record.payload_size);
        }

        debug!("Publisher stopped after {} messages", published);
        Ok(published)
    }
}

/// Time between ticks for a frequency in messages per second
pub fn tick_period(frequency: u32) -> Duration {
    Duration::from_secs(1) / frequency.max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::DecodedEnvelope;
    use crate::payload::SizeDistribution;
    use crate::transport::{LoopbackTransport, TransportConfig};
    use tempfile::tempdir;

    const TOPIC: &str = "bench/publisher";

    async fn connected_loopback() -> (
        Arc<dyn PubSubTransport>,
        tokio::sync::mpsc::Receiver<crate::transport::InboundMessage>,
    ) {
        let mut transport = LoopbackTransport::new();
        let inbound = transport.connect(&TransportConfig::default()).await.unwrap();
        transport.subscribe(TOPIC, QosLevel::AtMostOnce).await.unwrap();
        let transport: Arc<dyn PubSubTransport> = Arc::new(transport);
        (transport, inbound)
    }

    fn generator() -> PayloadGenerator {
        PayloadGenerator::with_seed(32, SizeDistribution::default(), 11).unwrap()
    }

    #[test]
    fn test_tick_period() {
        assert_eq!(tick_period(10), Duration::from_millis(100));
        assert_eq!(tick_period(1), Duration::from_secs(1));
        assert_eq!(tick_period(1000), Duration::from_millis(1));
        assert_eq!(tick_period(0), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_publish_one_sends_decodable_envelope() {
        let (transport, mut inbound) = connected_loopback().await;
        let sent = Arc::new(StatsAggregator::new());
        let mut publisher = Publisher::new(
            transport,
            generator(),
            TOPIC,
            QosLevel::AtMostOnce,
            10,
            Arc::clone(&sent),
        );

        let record = publisher.publish_one().await.unwrap();
        let message = inbound.recv().await.unwrap();
        let decoded = DecodedEnvelope::from_bytes(&message.payload).unwrap();

        assert_eq!(decoded.id, record.id);
        assert_eq!(record.payload_size, message.payload.len());

        let stats = sent.snapshot_and_reset(1.0);
        assert_eq!(stats.count, 1);
        assert_eq!(stats.total_bytes, record.payload_size as u64);
        assert_eq!(stats.latency_samples, 0);
    }

    #[tokio::test]
    async fn test_run_stops_at_message_limit() {
        let dir = tempdir().unwrap();
        let tx_log = Arc::new(RecordLog::open(dir.path().join("tx.jsonl")).unwrap());
        let (transport, mut inbound) = connected_loopback().await;
        let sent = Arc::new(StatsAggregator::new());

        let publisher = Publisher::new(
            transport,
            generator(),
            TOPIC,
            QosLevel::AtMostOnce,
            200,
            Arc::clone(&sent),
        )
        .with_record_log(Arc::clone(&tx_log))
        .with_max_messages(Some(5));

        let published = publisher.run(CancellationToken::new()).await.unwrap();
        assert_eq!(published, 5);
        assert_eq!(sent.pending(), 5);

        let mut ids = Vec::new();
        while let Ok(message) = inbound.try_recv() {
            ids.push(DecodedEnvelope::from_bytes(&message.payload).unwrap().id);
        }
        assert_eq!(ids.len(), 5);

        tx_log.flush().unwrap();
        let contents = std::fs::read_to_string(tx_log.path()).unwrap();
        let logged: Vec<TransmissionRecord> = contents
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(logged.iter().map(|r| r.id.clone()).collect::<Vec<_>>(), ids);
    }

    #[tokio::test]
    async fn test_run_returns_immediately_when_cancelled() {
        let (transport, _inbound) = connected_loopback().await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let publisher = Publisher::new(
            transport,
            generator(),
            TOPIC,
            QosLevel::AtMostOnce,
            10,
            Arc::new(StatsAggregator::new()),
        );
        assert_eq!(publisher.run(cancel).await.unwrap(), 0);
    }

    /// A failed publish ends the loop with an error and is not counted
    #[tokio::test]
    async fn test_publish_failure_is_fatal() {
        let transport: Arc<dyn PubSubTransport> = Arc::new(LoopbackTransport::new());
        let sent = Arc::new(StatsAggregator::new());
        let publisher = Publisher::new(
            transport,
            generator(),
            TOPIC,
            QosLevel::AtMostOnce,
            10,
            Arc::clone(&sent),
        );

        assert!(publisher.run(CancellationToken::new()).await.is_err());
        assert_eq!(sent.pending(), 0);
    }

    /// The loop publishes on schedule without bursting
    #[tokio::test(start_paused = true)]
    async fn test_run_paces_at_frequency() {
        let (transport, _inbound) = connected_loopback().await;
        let sent = Arc::new(StatsAggregator::new());
        let publisher = Publisher::new(
            transport,
            generator(),
            TOPIC,
            QosLevel::AtMostOnce,
            10,
            Arc::clone(&sent),
        )
        .with_max_messages(Some(4));

        let start = tokio::time::Instant::now();
        publisher.run(CancellationToken::new()).await.unwrap();

        // First tick fires immediately, then one every 100ms
        assert_eq!(start.elapsed(), Duration::from_millis(300));
        assert_eq!(sent.pending(), 4);
    }
}
