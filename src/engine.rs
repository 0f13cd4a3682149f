//! # Probe Engine Module
//!
//! This module wires the measurement harness together. `ProbeConfig` is the
//! validated form of the command line; `ProbeRunner` connects the transport,
//! subscribes, and runs the three concurrent activities until shutdown:
//!
//! - **Publisher**: one envelope per tick at the target frequency (pubsub mode)
//! - **Receiver**: drains the transport's inbound channel and measures latency
//! - **Reporter**: closes a statistics window every reporting interval
//!
//! ## Shutdown
//!
//! Any of the following cancels the shared `CancellationToken`: the caller
//! (signals), `--duration` elapsing, the publisher reaching `--max-messages`,
//! or a publish failure. The runner then joins the publisher, stops the
//! receiver once it has drained what is already queued, disconnects the
//! transport, lets the reporter drain the final partial window and flushes
//! the record logs. A publish failure is returned as an error after that
//! cleanup.

use crate::{
    cli::{Args, Mode, QosLevel, SizeDistributionKind, TransportKind},
    metrics::StatsAggregator,
    payload::{PayloadGenerator, SizeDistribution},
    publisher::Publisher,
    receiver::Receiver,
    records::{log_paths, RecordLog},
    reporter::Reporter,
    results::{RunSummary, RunTotals},
    transport::{PubSubTransport, TransportConfig},
    utils,
};
use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;
use std::io::Write;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How long to keep receiving after the publisher reaches its message limit
const SETTLE_GRACE: Duration = Duration::from_millis(500);

/// Validated configuration for one probe run
#[derive(Clone, Debug)]
pub struct ProbeConfig {
    /// Broker host name or address
    pub broker: String,

    /// Broker port
    pub port: u16,

    /// Topic published to and subscribed on
    pub topic: String,

    /// Quality of service for both publish and subscribe
    pub qos: QosLevel,

    /// MQTT client identifier
    pub client_id: String,

    pub username: Option<String>,

    pub password: Option<String>,

    pub keepalive: Duration,

    pub connect_timeout: Duration,

    pub max_packet_size: usize,

    /// Which transport backend to run over
    pub transport: TransportKind,

    /// Pubsub publishes and measures; logger only measures
    pub mode: Mode,

    /// Publish frequency in messages per second
    pub frequency: u32,

    /// Target raw payload size in bytes
    pub message_size: usize,

    pub size_distribution: SizeDistribution,

    /// Seed for reproducible payload sizes and contents
    pub seed: Option<u64>,

    /// Length of one reporting window
    pub stats_interval: Duration,

    /// Prefix of the `_tx.jsonl` and `_rx.jsonl` record logs
    pub log_prefix: String,

    /// Stop publishing after this many messages
    pub max_messages: Option<u64>,

    /// Stop the whole run after this long
    pub duration: Option<Duration>,
}

impl ProbeConfig {
    /// Create and validate a probe configuration from CLI arguments
    ///
    /// Settings left unset (on the command line and in any merged config
    /// file) take their defaults here.
    ///
    /// ## Validation
    /// - Port, frequency and message size are non-zero
    /// - The reporting interval is between 1 second and one day
    /// - Keepalive fits the 16-bit MQTT field
    /// - Size variance and sigma are finite and non-negative; a size rate is
    ///   positive, and each only goes with its own distribution
    /// - The topic is non-empty, and wildcard-free when publishing
    pub fn from_args(args: &Args) -> Result<Self> {
        let port = args.port.unwrap_or(crate::defaults::PORT);
        let frequency = args.freq.unwrap_or(crate::defaults::FREQUENCY);
        let message_size = args.msg_size.unwrap_or(crate::defaults::MESSAGE_SIZE);

        utils::validate_port(port)?;
        utils::validate_frequency(frequency)?;
        utils::validate_message_size(message_size)?;
        utils::validate_size_variance(args.size_variance)?;
        utils::validate_stats_interval(args.stats_interval)?;
        utils::validate_keepalive(args.keepalive)?;
        if args.mode.publishes() {
            utils::validate_publish_topic(&args.topic)?;
        } else if args.topic.is_empty() {
            bail!("Topic cannot be empty");
        }
        if args.username.is_some() != args.password.is_some() {
            warn!("Username and password must be given together; connecting without credentials");
        }

        let size_distribution = size_distribution(args)?;

        Ok(Self {
            broker: args
                .broker
                .clone()
                .unwrap_or_else(|| crate::defaults::BROKER.to_string()),
            port,
            topic: args.topic.clone(),
            qos: args.qos,
            client_id: args
                .client_id
                .clone()
                .unwrap_or_else(utils::generate_client_id),
            username: args.username.clone(),
            password: args.password.clone(),
            keepalive: Duration::from_secs(args.keepalive),
            connect_timeout: args.connect_timeout,
            max_packet_size: args.max_packet_size,
            transport: args.transport,
            mode: args.mode,
            frequency,
            message_size,
            size_distribution,
            seed: args.seed,
            stats_interval: Duration::from_secs(args.stats_interval),
            log_prefix: args
                .log_prefix
                .clone()
                .unwrap_or_else(|| crate::defaults::LOG_PREFIX.to_string()),
            max_messages: args.max_messages,
            duration: args.duration,
        })
    }

    /// Connection settings handed to the transport
    pub fn transport_config(&self) -> TransportConfig {
        TransportConfig {
            host: self.broker.clone(),
            port: self.port,
            client_id: self.client_id.clone(),
            keepalive: self.keepalive,
            username: self.username.clone(),
            password: self.password.clone(),
            connect_timeout: self.connect_timeout,
            max_packet_size: self.max_packet_size,
            inbound_capacity: crate::defaults::INBOUND_CHANNEL_CAPACITY,
        }
    }

    pub fn publishes(&self) -> bool {
        self.mode.publishes()
    }

    fn payload_generator(&self) -> Result<PayloadGenerator> {
        match self.seed {
            Some(seed) => PayloadGenerator::with_seed(self.message_size, self.size_distribution, seed),
            None => PayloadGenerator::new(self.message_size, self.size_distribution),
        }
    }
}

impl std::fmt::Display for ProbeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "-----------------------------------------------------------------"
        )?;
        writeln!(f, "Starting Probe ({} over {})", self.mode, self.transport)?;
        writeln!(f, "  Broker:             {}:{}", self.broker, self.port)?;
        writeln!(f, "  Client ID:          {}", self.client_id)?;
        writeln!(f, "  Topic:              {} (QoS {})", self.topic, self.qos)?;
        if self.publishes() {
            writeln!(f, "  Frequency:          {} msg/s", self.frequency)?;
            writeln!(f, "  Message Size:       {} bytes ({:?})", self.message_size, self.size_distribution)?;
            if let Some(limit) = self.max_messages {
                writeln!(f, "  Message Limit:      {}", limit)?;
            }
        }
        writeln!(f, "  Stats Interval:     {:?}", self.stats_interval)?;
        if let Some(duration) = self.duration {
            writeln!(f, "  Run Duration:       {:?}", duration)?;
        }
        write!(
            f,
            "-----------------------------------------------------------------"
        )
    }
}

/// Payload size distribution from the size flags
fn size_distribution(args: &Args) -> Result<SizeDistribution> {
    match args.size_distribution.unwrap_or(SizeDistributionKind::Normal) {
        SizeDistributionKind::Normal => {
            if args.size_rate.is_some() {
                bail!("--size-rate only applies to the exponential size distribution");
            }
            match args.size_sigma {
                Some(sigma) => {
                    utils::validate_size_sigma(sigma)?;
                    Ok(SizeDistribution::NormalSigma { sigma })
                }
                None => Ok(SizeDistribution::Normal {
                    variance_fraction: args.size_variance,
                }),
            }
        }
        SizeDistributionKind::Exponential => {
            if args.size_sigma.is_some() {
                bail!("--size-sigma only applies to the normal size distribution");
            }
            match args.size_rate {
                Some(rate) => {
                    utils::validate_size_rate(rate)?;
                    Ok(SizeDistribution::ExponentialRate { rate })
                }
                None => Ok(SizeDistribution::Exponential),
            }
        }
    }
}

/// Why the main wait ended
enum StopReason {
    Cancelled,
    DurationElapsed,
    PublisherFinished(Result<u64>),
}

/// Runs one probe against a transport
pub struct ProbeRunner {
    config: ProbeConfig,
}

impl ProbeRunner {
    pub fn new(config: ProbeConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ProbeConfig {
        &self.config
    }

    /// Run with report lines on stdout
    pub async fn run(
        &self,
        transport: Box<dyn PubSubTransport>,
        cancel: CancellationToken,
    ) -> Result<RunSummary> {
        self.run_with_output(transport, cancel, std::io::stdout()).await
    }

    /// Run with report lines written to `out`
    ///
    /// Returns once `cancel` fires, the run duration elapses, the publisher
    /// reaches its message limit or a publish fails.
    pub async fn run_with_output<W>(
        &self,
        mut transport: Box<dyn PubSubTransport>,
        cancel: CancellationToken,
        out: W,
    ) -> Result<RunSummary>
    where
        W: Write + Send + 'static,
    {
        let config = &self.config;
        info!("{}", config);

        let (tx_path, rx_path) = log_paths(&config.log_prefix);
        let rx_log = Arc::new(RecordLog::open(&rx_path)?);
        let tx_log = if config.publishes() {
            Some(Arc::new(RecordLog::open(&tx_path)?))
        } else {
            None
        };
        let generator = if config.publishes() {
            Some(config.payload_generator()?)
        } else {
            None
        };

        let inbound = transport
            .connect(&config.transport_config())
            .await
            .with_context(|| format!("Failed to connect {} transport", transport.name()))?;
        if let Err(e) = transport.subscribe(&config.topic, config.qos).await {
            let _ = transport.disconnect().await;
            return Err(e.context(format!("Failed to subscribe to {}", config.topic)));
        }
        info!("Subscribed to {}", config.topic);

        let transport: Arc<dyn PubSubTransport> = Arc::from(transport);
        let started_at = Utc::now();
        let start = Instant::now();

        let received = Arc::new(StatsAggregator::new());
        let sent = Arc::new(StatsAggregator::new());

        let receiver = Arc::new(Receiver::new(Arc::clone(&received)).with_record_log(Arc::clone(&rx_log)));
        // Stopped only after the publisher is joined so its last messages are counted
        let receiver_stop = CancellationToken::new();
        let receiver_task = {
            let receiver = Arc::clone(&receiver);
            let stop = receiver_stop.clone();
            tokio::spawn(async move { receiver.run(inbound, stop).await })
        };

        let reporter_stop = CancellationToken::new();
        let reporter = Reporter::new(
            Arc::clone(&received),
            config.publishes().then(|| Arc::clone(&sent)),
            config.stats_interval,
            out,
        );
        let reporter_task = tokio::spawn(reporter.run(reporter_stop.clone()));

        let mut publisher_task: Option<JoinHandle<Result<u64>>> = generator.map(|generator| {
            let mut publisher = Publisher::new(
                Arc::clone(&transport),
                generator,
                config.topic.clone(),
                config.qos,
                config.frequency,
                Arc::clone(&sent),
            )
            .with_max_messages(config.max_messages);
            if let Some(tx_log) = &tx_log {
                publisher = publisher.with_record_log(Arc::clone(tx_log));
            }
            tokio::spawn(publisher.run(cancel.clone()))
        });

        let stop = tokio::select! {
            _ = cancel.cancelled() => StopReason::Cancelled,
            _ = run_deadline(config.duration) => StopReason::DurationElapsed,
            finished = join_publisher(publisher_task.as_mut()) => StopReason::PublisherFinished(finished),
        };

        let mut published = 0u64;
        let mut failure = None;
        match stop {
            StopReason::Cancelled => info!("Shutdown requested"),
            StopReason::DurationElapsed => info!("Run duration elapsed"),
            StopReason::PublisherFinished(finished) => {
                publisher_task = None;
                match finished {
                    Ok(count) => {
                        published = count;
                        tokio::select! {
                            _ = cancel.cancelled() => {}
                            _ = tokio::time::sleep(SETTLE_GRACE) => {}
                        }
                    }
                    Err(e) => {
                        error!("Publisher failed: {:#}", e);
                        failure = Some(e);
                    }
                }
            }
        }
        cancel.cancel();

        if let Some(task) = publisher_task.as_mut() {
            match join_publisher(Some(task)).await {
                Ok(count) => published = count,
                Err(e) => {
                    error!("Publisher failed: {:#}", e);
                    failure.get_or_insert(e);
                }
            }
        }

        receiver_stop.cancel();
        let handled = receiver_task.await.context("Receiver task panicked")?;
        debug!("Receiver handled {} messages", handled);

        if let Err(e) = transport.disconnect().await {
            warn!("Transport disconnect failed: {:#}", e);
        }

        reporter_stop.cancel();
        let totals: RunTotals = reporter_task.await.context("Reporter task panicked")?;

        for log in std::iter::once(&rx_log).chain(tx_log.as_ref()) {
            if let Err(e) = log.flush() {
                warn!("Failed to flush record log {:?}: {:#}", log.path(), e);
            }
        }

        if let Some(e) = failure {
            return Err(e);
        }

        let elapsed_seconds = start.elapsed().as_secs_f64();
        Ok(RunSummary {
            version: crate::VERSION.to_string(),
            client_id: config.client_id.clone(),
            transport: config.transport,
            mode: config.mode,
            topic: config.topic.clone(),
            started_at,
            finished_at: Utc::now(),
            elapsed_seconds,
            published,
            malformed: receiver.malformed_count(),
            average_latency_ms: totals.average_latency_ms(),
            average_throughput_mbps: RunSummary::throughput_over(&totals, elapsed_seconds),
            totals,
        })
    }
}

/// Resolves after `duration`, or never
async fn run_deadline(duration: Option<Duration>) {
    match duration {
        Some(duration) => tokio::time::sleep(duration).await,
        None => std::future::pending().await,
    }
}

/// Await the publisher task, or never when there is none
async fn join_publisher(task: Option<&mut JoinHandle<Result<u64>>>) -> Result<u64> {
    match task {
        Some(task) => task
            .await
            .map_err(|e| anyhow!("Publisher task panicked: {}", e))?,
        None => std::future::pending().await,
    }
}
