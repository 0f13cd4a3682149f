//! # MQTT Latency Bench Library
//!
//! A latency and throughput measurement harness for publish/subscribe brokers.
//! The harness publishes synthetic, timestamped envelopes at a controlled rate,
//! receives messages on a subscribed topic, computes end-to-end latency from the
//! embedded send timestamps and reports throughput and latency per window.
//!
//! ## Architecture Overview
//!
//! The library is organized into several key modules:
//!
//! - `engine`: `ProbeRunner` wiring the publisher, receiver and reporter tasks
//! - `cli`: Command-line interface parsing and configuration management
//! - `config`: YAML config file supplying defaults under the command line
//! - `transport`: Pub/sub transport abstraction with MQTT and loopback backends
//! - `metrics`: The window statistics aggregator with atomic snapshot-and-reset
//! - `payload`: Randomized payload generation with size distributions
//! - `envelope`: The wire envelope and its decode errors
//! - `records`: Append-only JSON-lines transmission/reception logs
//! - `results`: Cumulative run totals and the final summary
//! - `utils`: Clock, identity and validation helpers
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use mqtt_latency_bench::{cli::Args, ProbeConfig, ProbeRunner};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let args = Args::default();
//!     let config = ProbeConfig::from_args(&args)?;
//!     let transport = mqtt_latency_bench::transport::TransportFactory::create(config.transport);
//!
//!     let runner = ProbeRunner::new(config);
//!     let summary = runner.run(transport, CancellationToken::new()).await?;
//!     println!("{}", summary);
//!     Ok(())
//! }
//! ```

/// Probe engine
///
/// Contains `ProbeConfig` and `ProbeRunner`, which connect the transport,
/// spawn the three concurrent activities and coordinate shutdown.
pub mod engine;

/// Command-line interface and configuration
///
/// Provides argument parsing using clap. Includes:
/// - Duration parsing with human-readable formats (e.g., "10s", "5m")
/// - Mode, transport, QoS and size distribution selection
pub mod cli;

/// YAML config file merged under the command line
pub mod config;

/// Wire envelope exchanged over the transport
pub mod envelope;

/// Console and file formatting for diagnostic logs
pub mod logging;

/// Statistics aggregation over reporting windows
///
/// The `StatsAggregator` is the only state shared between the receiver,
/// publisher and reporter. All updates go through a single mutex and a
/// window is taken and cleared in one indivisible step.
pub mod metrics;

/// Synthetic payload generation
pub mod payload;

/// Publisher loop emitting envelopes at the target frequency
pub mod publisher;

/// Receiver task decoding inbound envelopes and measuring latency
pub mod receiver;

/// Append-only JSON-lines record logs
pub mod records;

/// Periodic reporting of window statistics
pub mod reporter;

/// Run totals and final summary output
pub mod results;

/// Pub/sub transport implementations and abstractions
///
/// Contains the `PubSubTransport` trait and two implementations:
/// - MQTT via `rumqttc`, driven by a background event-loop task
/// - An in-process loopback used for self-tests
pub mod transport;

pub mod utils;

pub use cli::{Args, LogLevel, Mode, QosLevel, SizeDistributionKind, TransportKind};
pub use config::FileConfig;
pub use engine::{ProbeConfig, ProbeRunner};
pub use envelope::{DecodedEnvelope, Envelope, EnvelopeError};
pub use metrics::{StatsAggregator, WindowStats};
pub use payload::{generate_payload, PayloadGenerator, SizeDistribution};
pub use results::{RunSummary, RunTotals};
pub use transport::{InboundMessage, PubSubTransport, TransportConfig};

/// The current version of the harness
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
///
/// These mirror the command-line defaults and are shared by the CLI and by
/// tests that build configurations directly.
pub mod defaults {
    use std::time::Duration;

    /// Default broker host
    pub const BROKER: &str = "localhost";

    /// Default broker port (plain MQTT)
    pub const PORT: u16 = 1883;

    /// Default topic used for both publishing and subscribing
    pub const TOPIC: &str = "test/msg";

    /// Default publish frequency in messages per second
    pub const FREQUENCY: u32 = 10;

    /// Default target payload size in bytes (before base64 encoding)
    pub const MESSAGE_SIZE: usize = 600;

    /// Default reporting window in seconds
    pub const STATS_INTERVAL_SECS: u64 = 5;

    /// Default standard deviation of the payload size, as a fraction of the target
    pub const SIZE_VARIANCE: f64 = 0.1;

    /// Default prefix for the `_tx.jsonl` / `_rx.jsonl` record logs
    pub const LOG_PREFIX: &str = "mqtt";

    /// Default MQTT keepalive in seconds
    pub const KEEPALIVE_SECS: u64 = 60;

    /// Default time allowed for the broker to acknowledge the connection
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

    /// Default maximum MQTT packet size in both directions
    ///
    /// rumqttc's own default (10 KiB) is too small for larger payload targets.
    pub const MAX_PACKET_SIZE: usize = 1024 * 1024;

    /// Capacity of the channel between the transport event loop and the receiver
    pub const INBOUND_CHANNEL_CAPACITY: usize = 1024;
}
