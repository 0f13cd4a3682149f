use hdrhistogram::Histogram;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Significant figures kept by the latency histogram
const LATENCY_SIGNIFICANT_FIGURES: u8 = 3;

/// Raw accumulation for one reporting window
#[derive(Debug, Default)]
struct StatsWindow {
    message_count: u64,
    total_bytes: u64,
    latency_samples: Vec<f64>,
}

/// Derived statistics for one closed reporting window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowStats {
    pub count: u64,
    pub total_bytes: u64,
    pub window_seconds: f64,
    pub avg_latency_ms: f64,
    pub throughput_mbps: f64,
    pub latency_samples: usize,
    pub latency_sum_ms: f64,
    pub min_latency_ms: f64,
    pub max_latency_ms: f64,
    pub p50_latency_ms: f64,
    pub p99_latency_ms: f64,
    /// Samples below zero (clock skew); left out of the percentiles
    pub negative_latency_samples: u64,
}

impl WindowStats {
    fn from_window(window: StatsWindow, window_seconds: f64) -> Self {
        let StatsWindow {
            message_count,
            total_bytes,
            latency_samples,
        } = window;

        let latency_sum_ms: f64 = latency_samples.iter().sum();
        let avg_latency_ms = if latency_samples.is_empty() {
            0.0
        } else {
            latency_sum_ms / latency_samples.len() as f64
        };

        let min_latency_ms = latency_samples
            .iter()
            .copied()
            .min_by(f64::total_cmp)
            .unwrap_or(0.0);
        let max_latency_ms = latency_samples
            .iter()
            .copied()
            .max_by(f64::total_cmp)
            .unwrap_or(0.0);
        let negative_latency_samples = latency_samples.iter().filter(|l| **l < 0.0).count() as u64;
        let (p50_latency_ms, p99_latency_ms) = match latency_histogram(&latency_samples) {
            Some(histogram) => (
                utils::micros_to_ms(histogram.value_at_quantile(0.50)),
                utils::micros_to_ms(histogram.value_at_quantile(0.99)),
            ),
            None => (0.0, 0.0),
        };

        Self {
            count: message_count,
            total_bytes,
            window_seconds,
            avg_latency_ms,
            throughput_mbps: utils::throughput_mbps(total_bytes, window_seconds),
            latency_samples: latency_samples.len(),
            latency_sum_ms,
            min_latency_ms,
            max_latency_ms,
            p50_latency_ms,
            p99_latency_ms,
            negative_latency_samples,
        }
    }
}

/// Histogram of the non-negative samples in microseconds; `None` when there are none
///
/// Quantiles read back from it are nearest-rank: the smallest recorded value
/// with at least `ceil(q * n)` samples at or below it, to three significant
/// figures.
fn latency_histogram(samples: &[f64]) -> Option<Histogram<u64>> {
    let mut histogram = Histogram::<u64>::new(LATENCY_SIGNIFICANT_FIGURES).ok()?;
    for &latency in samples.iter().filter(|l| **l >= 0.0) {
        histogram.saturating_record(utils::ms_to_micros(latency));
    }
    (histogram.len() > 0).then_some(histogram)
}

/// Concurrency-safe rolling accumulator of count, bytes and latency samples
///
/// Every update is one critical section over the whole window, and
/// `snapshot_and_reset` swaps the window out in a single critical section, so
/// each recorded message lands in exactly one snapshot. The lock is never held
/// across I/O or while computing derived statistics.
#[derive(Debug, Default)]
pub struct StatsAggregator {
    window: Mutex<StatsWindow>,
}

impl StatsAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one message and optionally its latency
    pub fn record_message(&self, byte_size: usize, latency_ms: Option<f64>) {
        let mut window = self.window.lock();
        window.message_count += 1;
        window.total_bytes += byte_size as u64;
        if let Some(latency) = latency_ms {
            window.latency_samples.push(latency);
        }
    }

    /// Take the current window, leaving an empty one, and derive its statistics
    ///
    /// `window_seconds` is the nominal window length used for throughput.
    /// Empty windows produce all-zero statistics.
    pub fn snapshot_and_reset(&self, window_seconds: f64) -> WindowStats {
        let window = std::mem::take(&mut *self.window.lock());
        WindowStats::from_window(window, window_seconds)
    }

    /// Messages recorded in the current window so far
    pub fn pending(&self) -> u64 {
        self.window.lock().message_count
    }
}

/// Utility functions for metrics calculation
pub mod utils {
    /// Throughput in megabits per second; zero for non-positive windows
    pub fn throughput_mbps(total_bytes: u64, window_seconds: f64) -> f64 {
        if window_seconds > 0.0 && window_seconds.is_finite() {
            (total_bytes as f64 * 8.0) / (window_seconds * 1_000_000.0)
        } else {
            0.0
        }
    }

    /// Whole microseconds in a non-negative millisecond latency
    pub fn ms_to_micros(latency_ms: f64) -> u64 {
        // `as` saturates and maps NaN to 0
        (latency_ms * 1_000.0).round() as u64
    }

    pub fn micros_to_ms(micros: u64) -> f64 {
        micros as f64 / 1_000.0
    }

    /// Format a latency in milliseconds for human-readable output
    pub fn format_latency_ms(latency_ms: f64) -> String {
        let magnitude = latency_ms.abs();
        if magnitude < 1.0 {
            format!("{:.2}μs", latency_ms * 1_000.0)
        } else if magnitude < 1_000.0 {
            format!("{:.2}ms", latency_ms)
        } else {
            format!("{:.2}s", latency_ms / 1_000.0)
        }
    }
}
