//! Wire envelope exchanged over the transport.
//!
//! Every published message is a JSON object carrying an `id`, the send
//! `timestamp` and a base64 `payload`. Receivers only require `id` and
//! `timestamp`; the payload is opaque and may be absent when the message comes
//! from another publisher.

use crate::utils::{format_timestamp, parse_timestamp};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Message envelope as published on the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: String,
    pub timestamp: String,
    pub payload: String,
}

impl Envelope {
    /// Build an envelope stamped with `sent_at`
    ///
    /// The timestamp is captured by the caller before serialization so that
    /// encoding time is counted as part of the measured latency.
    pub fn new(id: String, sent_at: DateTime<Utc>, payload: String) -> Self {
        Self {
            id,
            timestamp: format_timestamp(sent_at),
            payload,
        }
    }

    /// Serialize the envelope to JSON bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

/// Reasons an inbound message could not be used for measurement
#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("payload is not valid UTF-8: {0}")]
    InvalidUtf8(#[from] std::str::Utf8Error),

    #[error("payload is not a JSON envelope: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("envelope is missing the '{0}' field")]
    MissingField(&'static str),

    #[error("unparsable timestamp '{raw}': {source}")]
    InvalidTimestamp {
        raw: String,
        #[source]
        source: chrono::ParseError,
    },
}

/// Lenient view of an inbound envelope; only the fields the receiver needs
#[derive(Debug, Deserialize)]
struct RawEnvelope {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    timestamp: Option<String>,
}

/// The parts of an inbound envelope needed to compute latency
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedEnvelope {
    pub id: String,
    /// Timestamp exactly as it appeared on the wire
    pub timestamp: String,
    pub sent_at: DateTime<Utc>,
}

impl DecodedEnvelope {
    /// Decode raw transport bytes into an envelope
    ///
    /// ## Errors
    /// - `InvalidUtf8` when the bytes are not text
    /// - `InvalidJson` when the text is not a JSON object of the expected shape
    /// - `MissingField` when `id` or `timestamp` is absent, null or empty
    /// - `InvalidTimestamp` when `timestamp` is not RFC 3339
    pub fn from_bytes(raw: &[u8]) -> Result<Self, EnvelopeError> {
        let text = std::str::from_utf8(raw)?;
        let envelope: RawEnvelope = serde_json::from_str(text)?;

        let timestamp = envelope
            .timestamp
            .filter(|timestamp| !timestamp.is_empty())
            .ok_or(EnvelopeError::MissingField("timestamp"))?;
        let id = envelope
            .id
            .filter(|id| !id.is_empty())
            .ok_or(EnvelopeError::MissingField("id"))?;

        let sent_at = parse_timestamp(&timestamp).map_err(|source| {
            EnvelopeError::InvalidTimestamp {
                raw: timestamp.clone(),
                source,
            }
        })?;

        Ok(Self {
            id,
            timestamp,
            sent_at,
        })
    }
}
