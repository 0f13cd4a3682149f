//! Receiver task.
//!
//! Drains the transport's inbound channel, decodes each envelope, computes
//! latency against the receive time captured by the transport and feeds the
//! received-traffic aggregator. Malformed messages never reach the
//! aggregator: each produces exactly one error record and bumps a counter.

use crate::envelope::{DecodedEnvelope, EnvelopeError};
use crate::metrics::StatsAggregator;
use crate::records::{ErrorRecord, ReceptionRecord, RecordLog};
use crate::transport::InboundMessage;
use crate::utils::{format_timestamp, latency_ms};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Measures latency of inbound envelopes
#[derive(Debug)]
pub struct Receiver {
    stats: Arc<StatsAggregator>,
    rx_log: Option<Arc<RecordLog>>,
    malformed: AtomicU64,
}

impl Receiver {
    pub fn new(stats: Arc<StatsAggregator>) -> Self {
        Self {
            stats,
            rx_log: None,
            malformed: AtomicU64::new(0),
        }
    }

    /// Append reception and error records to `rx_log`
    pub fn with_record_log(mut self, rx_log: Arc<RecordLog>) -> Self {
        self.rx_log = Some(rx_log);
        self
    }

    /// Number of inbound messages rejected as malformed so far
    pub fn malformed_count(&self) -> u64 {
        self.malformed.load(Ordering::Relaxed)
    }

    /// Process one inbound message
    ///
    /// On success the message is counted with its raw payload length and
    /// latency, and a reception record is appended. On failure only an error
    /// record is written; the aggregator is left untouched.
    pub fn handle(&self, message: &InboundMessage) -> Result<ReceptionRecord, EnvelopeError> {
        let decoded = match DecodedEnvelope::from_bytes(&message.payload) {
            Ok(decoded) => decoded,
            Err(e) => {
                self.malformed.fetch_add(1, Ordering::Relaxed);
                debug!("Malformed message on {}: {}", message.topic, e);
                self.write_record(&ErrorRecord::new(&e, &message.payload));
                return Err(e);
            }
        };

        let latency = latency_ms(decoded.sent_at, message.received_at);
        let payload_size = message.payload.len();
        self.stats.record_message(payload_size, Some(latency));

        let record = ReceptionRecord {
            time: format_timestamp(message.received_at),
            timestamp: decoded.timestamp,
            id: decoded.id,
            latency_ms: latency,
            payload_size,
        };
        self.write_record(&record);
        Ok(record)
    }

    fn write_record<T: Serialize>(&self, record: &T) {
        if let Some(rx_log) = &self.rx_log {
            if let Err(e) = rx_log.append(record) {
                warn!("Failed to write reception record: {:#}", e);
            }
        }
    }

    /// Drain `inbound` until it closes or `cancel` fires
    ///
    /// Messages already queued when cancellation arrives are still processed.
    /// Returns the number of messages handled, malformed ones included.
    pub async fn run(
        &self,
        mut inbound: mpsc::Receiver<InboundMessage>,
        cancel: CancellationToken,
    ) -> u64 {
        let mut handled = 0u64;
        loop {
            let message = tokio::select! {
                message = inbound.recv() => message,
                _ = cancel.cancelled() => break,
            };
            match message {
                Some(message) => {
                    let _ = self.handle(&message);
                    handled += 1;
                }
                None => {
                    debug!("Inbound channel closed");
                    return handled;
                }
            }
        }

        while let Ok(message) = inbound.try_recv() {
            let _ = self.handle(&message);
            handled += 1;
        }
        trace!("Receiver stopped after {} messages", handled);
        handled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Envelope;
    use crate::utils::generate_message_id;
    use chrono::{Duration as ChronoDuration, TimeZone, Utc};
    use tempfile::tempdir;

    fn read_lines(log: &RecordLog) -> Vec<serde_json::Value> {
        log.flush().unwrap();
        std::fs::read_to_string(log.path())
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    fn receiver_with_log() -> (Receiver, Arc<StatsAggregator>, Arc<RecordLog>, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let log = Arc::new(RecordLog::open(dir.path().join("rx.jsonl")).unwrap());
        let stats = Arc::new(StatsAggregator::new());
        let receiver = Receiver::new(Arc::clone(&stats)).with_record_log(Arc::clone(&log));
        (receiver, stats, log, dir)
    }

    /// A message received immediately after it was stamped shows near-zero latency
    #[test]
    fn test_round_trip_latency_sanity() {
        let (receiver, stats, log, _dir) = receiver_with_log();

        let envelope = Envelope::new(generate_message_id(), Utc::now(), "AAAA".into());
        let message = InboundMessage::new("t", envelope.to_bytes().unwrap());
        let record = receiver.handle(&message).unwrap();

        assert!(record.latency_ms.abs() <= 5.0, "latency was {}", record.latency_ms);
        assert_eq!(record.id, envelope.id);
        assert_eq!(record.timestamp, envelope.timestamp);
        assert_eq!(record.payload_size, message.payload.len());

        let window = stats.snapshot_and_reset(1.0);
        assert_eq!(window.count, 1);
        assert_eq!(window.total_bytes, message.payload.len() as u64);
        assert_eq!(read_lines(&log).len(), 1);
    }

    #[test]
    fn test_latency_uses_transport_receive_time() {
        let (receiver, stats, _log, _dir) = receiver_with_log();

        let sent_at = Utc.with_ymd_and_hms(2026, 10, 18, 12, 0, 0).unwrap();
        let envelope = Envelope::new(generate_message_id(), sent_at, String::new());
        let message = InboundMessage::received_at(
            "t",
            envelope.to_bytes().unwrap(),
            sent_at + ChronoDuration::microseconds(42_500),
        );

        let record = receiver.handle(&message).unwrap();
        assert_eq!(record.latency_ms, 42.5);
        assert_eq!(stats.snapshot_and_reset(1.0).avg_latency_ms, 42.5);
    }

    /// A missing timestamp leaves the count alone and yields exactly one error record
    #[test]
    fn test_malformed_isolation() {
        let (receiver, stats, log, _dir) = receiver_with_log();

        let message = InboundMessage::new("t", br#"{"id":"abc","payload":"AAAA"}"#.to_vec());
        let err = receiver.handle(&message).unwrap_err();
        assert!(matches!(err, EnvelopeError::MissingField("timestamp")));

        assert_eq!(stats.pending(), 0);
        assert_eq!(receiver.malformed_count(), 1);

        let lines = read_lines(&log);
        assert_eq!(lines.len(), 1);
        assert!(lines[0]["error"].as_str().unwrap().contains("timestamp"));
        assert_eq!(lines[0]["raw"], r#"{"id":"abc","payload":"AAAA"}"#);
    }

    #[test]
    fn test_malformed_variants_are_not_counted() {
        let (receiver, stats, log, _dir) = receiver_with_log();

        let bad_payloads: Vec<Vec<u8>> = vec![
            vec![0xff, 0xfe],
            b"not json".to_vec(),
            br#"{"timestamp":"2026-10-18T12:00:00Z"}"#.to_vec(),
            br#"{"id":"x","timestamp":"yesterday"}"#.to_vec(),
        ];
        for payload in bad_payloads {
            assert!(receiver.handle(&InboundMessage::new("t", payload)).is_err());
        }

        assert_eq!(stats.pending(), 0);
        assert_eq!(receiver.malformed_count(), 4);

        let lines = read_lines(&log);
        assert_eq!(lines.len(), 4);
        // Binary payloads carry no raw field
        assert!(lines[0].get("raw").is_none());
        assert!(lines[1].get("raw").is_some());
    }

    /// Envelopes from other publishers may use nanosecond precision and offsets
    #[test]
    fn test_accepts_foreign_timestamp_formats() {
        let receiver = Receiver::new(Arc::new(StatsAggregator::new()));
        let payload = br#"{"id":"ext-1","timestamp":"2026-10-18T14:00:00.123456789+02:00"}"#;

        let record = receiver.handle(&InboundMessage::new("t", payload.to_vec())).unwrap();
        assert_eq!(record.id, "ext-1");
        assert_eq!(record.timestamp, "2026-10-18T14:00:00.123456789+02:00");
    }

    #[tokio::test]
    async fn test_run_drains_channel_until_closed() {
        let stats = Arc::new(StatsAggregator::new());
        let receiver = Receiver::new(Arc::clone(&stats));
        let (tx, rx) = mpsc::channel(16);

        for _ in 0..3 {
            let envelope = Envelope::new(generate_message_id(), Utc::now(), "AA==".into());
            tx.send(InboundMessage::new("t", envelope.to_bytes().unwrap()))
                .await
                .unwrap();
        }
        tx.send(InboundMessage::new("t", b"garbage".to_vec())).await.unwrap();
        drop(tx);

        let handled = receiver.run(rx, CancellationToken::new()).await;
        assert_eq!(handled, 4);
        assert_eq!(stats.pending(), 3);
        assert_eq!(receiver.malformed_count(), 1);
    }

    /// Messages queued before cancellation are still counted
    #[tokio::test]
    async fn test_run_processes_queued_messages_after_cancel() {
        let stats = Arc::new(StatsAggregator::new());
        let receiver = Receiver::new(Arc::clone(&stats));
        let (tx, rx) = mpsc::channel(16);

        for _ in 0..5 {
            let envelope = Envelope::new(generate_message_id(), Utc::now(), String::new());
            tx.send(InboundMessage::new("t", envelope.to_bytes().unwrap()))
                .await
                .unwrap();
        }

        let cancel = CancellationToken::new();
        cancel.cancel();
        assert_eq!(receiver.run(rx, cancel).await, 5);
        assert_eq!(stats.pending(), 5);
        drop(tx);
    }
}
