//! Reporter loop.
//!
//! Every reporting interval the reporter closes the current window on the
//! received-traffic aggregator (and on the sent-traffic aggregator when the
//! publisher runs), prints one report line and folds the window into the run
//! totals. The first report comes one full interval after start.

use crate::metrics::{StatsAggregator, WindowStats};
use crate::results::RunTotals;
use crate::utils::now_iso;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Format one report line
///
/// `[<now>] Avg Latency: X.XXX ms | Throughput: Y.YYY Mbps | Messages: N`,
/// with ` | Sent: M` appended when sent-traffic statistics are given.
pub fn format_report_line(now: &str, received: &WindowStats, sent: Option<&WindowStats>) -> String {
    let mut line = format!(
        "[{}] Avg Latency: {:.3} ms | Throughput: {:.3} Mbps | Messages: {}",
        now, received.avg_latency_ms, received.throughput_mbps, received.count
    );
    if let Some(sent) = sent {
        line.push_str(&format!(" | Sent: {}", sent.count));
    }
    line
}

/// Periodically drains the aggregators and prints report lines
pub struct Reporter<W: Write> {
    received: Arc<StatsAggregator>,
    sent: Option<Arc<StatsAggregator>>,
    interval: Duration,
    out: W,
    totals: RunTotals,
}

impl<W: Write> Reporter<W> {
    /// Create a reporter writing lines to `out`
    ///
    /// Pass the sent-traffic aggregator only when the publisher is enabled;
    /// its presence adds the `Sent` column.
    pub fn new(
        received: Arc<StatsAggregator>,
        sent: Option<Arc<StatsAggregator>>,
        interval: Duration,
        out: W,
    ) -> Self {
        Self {
            received,
            sent,
            interval,
            out,
            totals: RunTotals::default(),
        }
    }

    pub fn totals(&self) -> &RunTotals {
        &self.totals
    }

    /// Close the current window, print its line and absorb it into the totals
    ///
    /// `window_seconds` is the length used for the throughput figure.
    pub fn report(&mut self, window_seconds: f64) -> String {
        let received = self.received.snapshot_and_reset(window_seconds);
        let sent = self
            .sent
            .as_ref()
            .map(|sent| sent.snapshot_and_reset(window_seconds));

        let line = format_report_line(&now_iso(), &received, sent.as_ref());
        if let Err(e) = writeln!(self.out, "{}", line).and_then(|_| self.out.flush()) {
            warn!("Failed to write report line: {}", e);
        }
        debug!(
            "Window latency p50 {:.3} ms, p99 {:.3} ms, min {:.3} ms, max {:.3} ms over {} samples ({} negative)",
            received.p50_latency_ms,
            received.p99_latency_ms,
            received.min_latency_ms,
            received.max_latency_ms,
            received.latency_samples,
            received.negative_latency_samples
        );

        self.totals.absorb(&received, sent.as_ref());
        line
    }

    /// Drain whatever is left after shutdown
    ///
    /// Uses the real elapsed time since the last report as the window length.
    /// The line is printed only when the partial window saw any traffic, but
    /// the window is always absorbed so the totals stay complete.
    pub fn finish(mut self, partial_window: Duration) -> RunTotals {
        let pending = self.received.pending()
            + self.sent.as_ref().map_or(0, |sent| sent.pending());
        if pending > 0 {
            self.report(partial_window.as_secs_f64());
        } else {
            self.totals.absorb(
                &self.received.snapshot_and_reset(partial_window.as_secs_f64()),
                None,
            );
        }
        self.totals
    }
}

impl<W: Write + Send> Reporter<W> {
    /// Report every interval until `stop` fires, then drain the final window
    ///
    /// An interval too long to schedule never ticks; everything lands in the
    /// final window.
    pub async fn run(mut self, stop: CancellationToken) -> RunTotals {
        let mut window_start = Instant::now();
        let Some(first_tick) = window_start.checked_add(self.interval) else {
            warn!("Stats interval {:?} is out of range, reporting only at shutdown", self.interval);
            stop.cancelled().await;
            return self.finish(window_start.elapsed());
        };

        let mut ticker = tokio::time::interval_at(first_tick, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let window_seconds = self.interval.as_secs_f64();

        loop {
            tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                _ = ticker.tick() => {}
            }
            window_start = Instant::now();
            self.report(window_seconds);
        }

        self.finish(window_start.elapsed())
    }
}
