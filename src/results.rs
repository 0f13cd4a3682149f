use crate::cli::{Mode, TransportKind};
use crate::metrics::{utils::format_latency_ms, WindowStats};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use tracing::debug;

/// Cumulative totals across every reporting window of a run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunTotals {
    pub windows: u64,
    pub received_messages: u64,
    pub received_bytes: u64,
    pub sent_messages: u64,
    pub sent_bytes: u64,
    pub latency_samples: u64,
    pub latency_sum_ms: f64,
    pub min_latency_ms: Option<f64>,
    pub max_latency_ms: Option<f64>,
    pub peak_throughput_mbps: f64,
}

impl RunTotals {
    /// Fold one closed window into the totals
    pub fn absorb(&mut self, received: &WindowStats, sent: Option<&WindowStats>) {
        self.windows += 1;
        self.received_messages += received.count;
        self.received_bytes += received.total_bytes;
        self.latency_samples += received.latency_samples as u64;
        self.latency_sum_ms += received.latency_sum_ms;
        self.peak_throughput_mbps = self.peak_throughput_mbps.max(received.throughput_mbps);

        if received.latency_samples > 0 {
            self.min_latency_ms = Some(
                self.min_latency_ms
                    .map_or(received.min_latency_ms, |min| min.min(received.min_latency_ms)),
            );
            self.max_latency_ms = Some(
                self.max_latency_ms
                    .map_or(received.max_latency_ms, |max| max.max(received.max_latency_ms)),
            );
        }

        if let Some(sent) = sent {
            self.sent_messages += sent.count;
            self.sent_bytes += sent.total_bytes;
        }
    }

    /// Mean latency over every sample of the run; zero without samples
    pub fn average_latency_ms(&self) -> f64 {
        if self.latency_samples == 0 {
            0.0
        } else {
            self.latency_sum_ms / self.latency_samples as f64
        }
    }
}

/// Final summary of one probe run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub version: String,
    pub client_id: String,
    pub transport: TransportKind,
    pub mode: Mode,
    pub topic: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub elapsed_seconds: f64,
    pub published: u64,
    pub malformed: u64,
    pub average_latency_ms: f64,
    pub average_throughput_mbps: f64,
    pub totals: RunTotals,
}

impl RunSummary {
    /// Overall received throughput across the whole run
    pub fn throughput_over(totals: &RunTotals, elapsed_seconds: f64) -> f64 {
        crate::metrics::utils::throughput_mbps(totals.received_bytes, elapsed_seconds)
    }

    /// Write the summary as pretty-printed JSON
    pub fn write_json(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write run summary to {:?}", path))?;
        debug!("Run summary written to {:?}", path);
        Ok(())
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let totals = &self.totals;
        writeln!(
            f,
            "-----------------------------------------------------------------"
        )?;
        writeln!(f, "Run Summary ({} over {})", self.mode, self.transport)?;
        writeln!(f, "  Client ID:          {}", self.client_id)?;
        writeln!(f, "  Topic:              {}", self.topic)?;
        writeln!(f, "  Elapsed:            {:.3} s", self.elapsed_seconds)?;
        if self.mode.publishes() {
            writeln!(
                f,
                "  Sent:               {} messages, {} bytes",
                totals.sent_messages, totals.sent_bytes
            )?;
        }
        writeln!(
            f,
            "  Received:           {} messages, {} bytes",
            totals.received_messages, totals.received_bytes
        )?;
        writeln!(f, "  Malformed:          {}", self.malformed)?;
        writeln!(
            f,
            "  Avg Latency:        {}",
            format_latency_ms(self.average_latency_ms)
        )?;
        if let (Some(min), Some(max)) = (totals.min_latency_ms, totals.max_latency_ms) {
            writeln!(
                f,
                "  Latency Range:      {} .. {}",
                format_latency_ms(min),
                format_latency_ms(max)
            )?;
        }
        writeln!(
            f,
            "  Avg Throughput:     {:.3} Mbps",
            self.average_throughput_mbps
        )?;
        writeln!(
            f,
            "  Peak Throughput:    {:.3} Mbps",
            totals.peak_throughput_mbps
        )?;
        write!(
            f,
            "-----------------------------------------------------------------"
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::StatsAggregator;
    use tempfile::NamedTempFile;

    fn window(samples: &[f64], bytes: usize, seconds: f64) -> WindowStats {
        let aggregator = StatsAggregator::new();
        for &sample in samples {
            aggregator.record_message(bytes, Some(sample));
        }
        aggregator.snapshot_and_reset(seconds)
    }

    fn summary(totals: RunTotals) -> RunSummary {
        RunSummary {
            version: crate::VERSION.to_string(),
            client_id: "mqtt-test-1".into(),
            transport: TransportKind::Loopback,
            mode: Mode::PubSub,
            topic: "test/msg".into(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
            elapsed_seconds: 10.0,
            published: totals.sent_messages,
            malformed: 1,
            average_latency_ms: totals.average_latency_ms(),
            average_throughput_mbps: RunSummary::throughput_over(&totals, 10.0),
            totals,
        }
    }

    #[test]
    fn test_absorb_accumulates_windows() {
        let mut totals = RunTotals::default();
        let sent = window(&[], 0, 5.0);

        totals.absorb(&window(&[2.0, 4.0], 100, 5.0), Some(&sent));
        totals.absorb(&window(&[1.0, 9.0, 5.0], 200, 5.0), None);

        assert_eq!(totals.windows, 2);
        assert_eq!(totals.received_messages, 5);
        assert_eq!(totals.received_bytes, 800);
        assert_eq!(totals.latency_samples, 5);
        assert_eq!(totals.average_latency_ms(), 21.0 / 5.0);
        assert_eq!(totals.min_latency_ms, Some(1.0));
        assert_eq!(totals.max_latency_ms, Some(9.0));
    }

    /// Empty windows count as windows but do not disturb the latency range
    #[test]
    fn test_absorb_empty_window() {
        let mut totals = RunTotals::default();
        totals.absorb(&window(&[], 0, 5.0), None);

        assert_eq!(totals.windows, 1);
        assert_eq!(totals.received_messages, 0);
        assert_eq!(totals.min_latency_ms, None);
        assert_eq!(totals.average_latency_ms(), 0.0);
    }

    #[test]
    fn test_absorb_sent_traffic() {
        let sent = StatsAggregator::new();
        sent.record_message(700, None);
        sent.record_message(700, None);

        let mut totals = RunTotals::default();
        totals.absorb(&window(&[], 0, 5.0), Some(&sent.snapshot_and_reset(5.0)));

        assert_eq!(totals.sent_messages, 2);
        assert_eq!(totals.sent_bytes, 1400);
    }

    #[test]
    fn test_summary_display() {
        let mut totals = RunTotals::default();
        totals.absorb(&window(&[1.5], 1_250_000, 5.0), None);

        let text = summary(totals).to_string();
        assert!(text.contains("Run Summary (pubsub over Loopback)"));
        assert!(text.contains("Received:           1 messages, 1250000 bytes"));
        assert!(text.contains("Avg Latency:        1.50ms"));
        assert!(text.contains("Avg Throughput:     1.000 Mbps"));
        assert!(text.contains("Peak Throughput:    2.000 Mbps"));
    }

    #[test]
    fn test_write_json() {
        let mut totals = RunTotals::default();
        totals.absorb(&window(&[3.0], 10, 1.0), None);
        let summary = summary(totals);

        let file = NamedTempFile::new().unwrap();
        summary.write_json(file.path()).unwrap();

        let written: RunSummary =
            serde_json::from_str(&std::fs::read_to_string(file.path()).unwrap()).unwrap();
        assert_eq!(written.totals, summary.totals);
        assert_eq!(written.transport, TransportKind::Loopback);
        assert_eq!(written.malformed, 1);
    }
}
