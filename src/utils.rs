//! # Clock, Identity and Validation Helpers
//!
//! This module provides the small utilities every other part of the harness
//! leans on: wall-clock timestamps in the wire format, unique identifiers,
//! latency arithmetic and input validation.
//!
//! ## Key Functionality Categories
//!
//! - **Timestamps**: ISO-8601 UTC strings with microsecond precision
//! - **Identity**: UUID v4 message and client identifiers
//! - **Latency**: Millisecond differences between two UTC instants
//! - **Validation**: Input parameter validation with clear error messages
//!
//! ## Usage Examples
//!
//! ```rust
//! use mqtt_latency_bench::utils::*;
//!
//! # fn main() -> anyhow::Result<()> {
//! let sent = parse_timestamp("2026-10-18T12:00:00.000000Z")?;
//! let received = parse_timestamp("2026-10-18T12:00:00.012500Z")?;
//! assert_eq!(latency_ms(sent, received), 12.5);
//!
//! validate_frequency(10)?; // OK
//! # Ok(())
//! # }
//! ```

use anyhow::{bail, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use std::sync::atomic::{AtomicI64, Ordering};
use uuid::Uuid;

/// Wall clock whose successive readings never go backwards
///
/// Envelope timestamps come from here. If the system clock is stepped back
/// (NTP correction, manual change), readings hold at the last value handed
/// out until real time catches up, so timestamps on consecutive messages stay
/// ordered.
///
/// ## Thread Safety
///
/// Readings are coordinated through a single atomic and the clock can be
/// shared freely between tasks.
#[derive(Debug, Default)]
pub struct WallClock {
    last_micros: AtomicI64,
}

impl WallClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current UTC instant, never earlier than any previous reading
    pub fn now(&self) -> DateTime<Utc> {
        let micros = Utc::now().timestamp_micros();
        let previous = self.last_micros.fetch_max(micros, Ordering::AcqRel);
        let chosen = micros.max(previous);
        DateTime::<Utc>::from_timestamp_micros(chosen).unwrap_or_else(Utc::now)
    }

    /// Current reading formatted for the wire
    pub fn now_iso(&self) -> String {
        format_timestamp(self.now())
    }
}

/// Format a UTC instant as ISO-8601 with microsecond precision and a `Z` suffix
///
/// ## Examples
///
/// ```rust
/// # use mqtt_latency_bench::utils::{format_timestamp, parse_timestamp};
/// let ts = parse_timestamp("2026-10-18T12:00:00.5Z").unwrap();
/// assert_eq!(format_timestamp(ts), "2026-10-18T12:00:00.500000Z");
/// ```
pub fn format_timestamp(instant: DateTime<Utc>) -> String {
    instant.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Current UTC time formatted for records and report lines
pub fn now_iso() -> String {
    format_timestamp(Utc::now())
}

/// Parse an RFC 3339 timestamp into a UTC instant
///
/// Accepts any fractional precision and either a `Z` suffix or a numeric
/// offset, so envelopes from publishers using nanosecond timestamps decode
/// as well.
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(raw.trim()).map(|dt| dt.with_timezone(&Utc))
}

/// Milliseconds elapsed from `sent` to `received`
///
/// Negative when the receiver's clock is behind the sender's. The value is
/// returned as-is; clock skew is not an error.
pub fn latency_ms(sent: DateTime<Utc>, received: DateTime<Utc>) -> f64 {
    let delta = received.signed_duration_since(sent);
    match delta.num_microseconds() {
        Some(micros) => micros as f64 / 1_000.0,
        // Only reachable for deltas of hundreds of thousands of years
        None => delta.num_milliseconds() as f64,
    }
}

/// Generate a unique message identifier (UUID v4)
pub fn generate_message_id() -> String {
    Uuid::new_v4().to_string()
}

/// Generate a client identifier of the form `mqtt-test-<uuid>`
pub fn generate_client_id() -> String {
    format!("mqtt-test-{}", Uuid::new_v4())
}

/// Validate that a broker port is usable
pub fn validate_port(port: u16) -> Result<()> {
    if port == 0 {
        bail!("Port cannot be 0");
    }
    Ok(())
}

/// Validate the publish frequency in messages per second
pub fn validate_frequency(freq: u32) -> Result<()> {
    if freq == 0 {
        bail!("Frequency must be at least 1 message per second");
    }
    Ok(())
}

/// Validate the target payload size
pub fn validate_message_size(message_size: usize) -> Result<()> {
    if message_size == 0 {
        bail!("Message size cannot be 0");
    }

    // Keep some headroom below the 256 MB MQTT packet ceiling for base64
    // expansion and the envelope fields.
    const MAX_MESSAGE_SIZE: usize = 128 * 1024 * 1024;
    if message_size > MAX_MESSAGE_SIZE {
        bail!(
            "Message size {} exceeds maximum of {} bytes",
            message_size,
            MAX_MESSAGE_SIZE
        );
    }

    Ok(())
}

/// Validate the relative standard deviation of the payload size draw
pub fn validate_size_variance(variance: f64) -> Result<()> {
    if !variance.is_finite() || variance < 0.0 {
        bail!("Size variance must be a finite, non-negative fraction, got {}", variance);
    }
    Ok(())
}

/// Longest accepted reporting window in seconds (one day)
pub const MAX_STATS_INTERVAL_SECS: u64 = 86_400;

/// Validate the reporting window length in seconds
pub fn validate_stats_interval(secs: u64) -> Result<()> {
    if secs == 0 {
        bail!("Stats interval must be at least 1 second");
    }
    if secs > MAX_STATS_INTERVAL_SECS {
        bail!(
            "Stats interval {}s exceeds maximum of {}s",
            secs,
            MAX_STATS_INTERVAL_SECS
        );
    }
    Ok(())
}

/// Validate the keepalive, which MQTT carries as a 16-bit number of seconds
pub fn validate_keepalive(secs: u64) -> Result<()> {
    if secs > u64::from(u16::MAX) {
        bail!("Keepalive {}s exceeds the MQTT maximum of {}s", secs, u16::MAX);
    }
    Ok(())
}

/// Validate an explicit standard deviation of the payload size in bytes
pub fn validate_size_sigma(sigma: f64) -> Result<()> {
    if !sigma.is_finite() || sigma < 0.0 {
        bail!("Size sigma must be a finite, non-negative number of bytes, got {}", sigma);
    }
    Ok(())
}

/// Validate an explicit exponential rate for the payload size (per byte)
pub fn validate_size_rate(rate: f64) -> Result<()> {
    if !rate.is_finite() || rate <= 0.0 {
        bail!("Size rate must be finite and greater than 0, got {}", rate);
    }
    // The mean size 1/rate has to fit the payload limit
    validate_message_size((1.0 / rate).ceil() as usize)
}

/// Validate a topic for publishing
///
/// Publishing to a filter is not allowed in MQTT, so wildcards are rejected
/// whenever the publisher is enabled.
pub fn validate_publish_topic(topic: &str) -> Result<()> {
    if topic.is_empty() {
        bail!("Topic cannot be empty");
    }
    if topic.contains('+') || topic.contains('#') {
        bail!("Cannot publish to wildcard topic '{}'", topic);
    }
    Ok(())
}
