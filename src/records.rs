//! Append-only JSON-lines record logs.
//!
//! One sink per direction: the publisher appends a transmission record per
//! sent envelope, the receiver appends a reception record per measured
//! message, or an error record when an inbound message was malformed. Each
//! record is serialized up front and written with a single `write_all` of one
//! complete line, so concurrent writers never interleave within a line.

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Written once per published envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransmissionRecord {
    pub time: String,
    pub id: String,
    /// Length of the serialized envelope in bytes
    pub payload_size: usize,
}

/// Written once per measured inbound message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReceptionRecord {
    pub time: String,
    pub timestamp: String,
    pub id: String,
    pub latency_ms: f64,
    /// Length of the raw inbound payload in bytes
    pub payload_size: usize,
}

/// Written once per malformed inbound message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<String>,
}

impl ErrorRecord {
    /// Build an error record, keeping the raw payload only when it is text
    pub fn new(error: impl ToString, raw_payload: &[u8]) -> Self {
        Self {
            error: error.to_string(),
            raw: std::str::from_utf8(raw_payload).ok().map(str::to_owned),
        }
    }
}

/// Append-only sink writing one JSON object per line
#[derive(Debug)]
pub struct RecordLog {
    path: PathBuf,
    file: Mutex<File>,
}

impl RecordLog {
    /// Open (or create) `path` for appending
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open record log {:?}", path))?;

        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Serialize `record` and append it as one line
    pub fn append<T: Serialize>(&self, record: &T) -> Result<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let mut file = self.file.lock();
        file.write_all(&line)
            .with_context(|| format!("Failed to append to record log {:?}", self.path))?;
        Ok(())
    }

    /// Flush buffered data and ask the OS to persist it
    pub fn flush(&self) -> Result<()> {
        let mut file = self.file.lock();
        file.flush()?;
        file.sync_data()
            .with_context(|| format!("Failed to sync record log {:?}", self.path))?;
        Ok(())
    }
}

/// Paths of the transmission and reception logs for a prefix
pub fn log_paths(prefix: &str) -> (PathBuf, PathBuf) {
    (
        PathBuf::from(format!("{}_tx.jsonl", prefix)),
        PathBuf::from(format!("{}_rx.jsonl", prefix)),
    )
}
