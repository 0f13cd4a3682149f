use clap::{ArgAction, Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// MQTT Latency Bench - publish timed messages and measure end-to-end latency
#[derive(Parser, Debug, Clone)]
#[clap(version, about, long_about = None)]
pub struct Args {
    /// YAML config file supplying defaults for the options below
    #[clap(short = 'c', long, help_heading = "Broker")]
    pub config: Option<PathBuf>,

    /// Broker host name or address [default: localhost]
    #[clap(long, help_heading = "Broker")]
    pub broker: Option<String>,

    /// Broker port [default: 1883]
    #[clap(long, help_heading = "Broker")]
    pub port: Option<u16>,

    /// Topic to publish to and subscribe on
    #[clap(long, default_value = crate::defaults::TOPIC, help_heading = "Broker")]
    pub topic: String,

    /// Username for broker authentication (used only together with --password)
    #[clap(long, help_heading = "Broker")]
    pub username: Option<String>,

    /// Password for broker authentication (used only together with --username)
    #[clap(long, help_heading = "Broker")]
    pub password: Option<String>,

    /// Client identifier presented to the broker (default: mqtt-test-<uuid>)
    #[clap(long, help_heading = "Broker")]
    pub client_id: Option<String>,

    /// Quality of service for publish and subscribe
    #[clap(long, value_enum, default_value_t = QosLevel::AtMostOnce, help_heading = "Broker")]
    pub qos: QosLevel,

    /// Keepalive interval in seconds
    #[clap(long, default_value_t = crate::defaults::KEEPALIVE_SECS, help_heading = "Broker")]
    pub keepalive: u64,

    /// Time allowed for the broker to acknowledge the connection (e.g. "10s")
    #[clap(long, value_parser = parse_duration, default_value = "10s", help_heading = "Broker")]
    pub connect_timeout: Duration,

    /// Maximum MQTT packet size in bytes, both directions
    #[clap(long, default_value_t = crate::defaults::MAX_PACKET_SIZE, help_heading = "Broker")]
    pub max_packet_size: usize,

    /// Transport backend
    #[clap(long, value_enum, default_value_t = TransportKind::Mqtt, help_heading = "Broker")]
    pub transport: TransportKind,

    /// Whether to publish and subscribe, or only subscribe and log
    #[clap(long, value_enum, default_value_t = Mode::PubSub, help_heading = "Load")]
    pub mode: Mode,

    /// Messages per second [default: 10]
    #[clap(long, help_heading = "Load")]
    pub freq: Option<u32>,

    /// Target (mean) payload size in bytes [default: 600]
    #[clap(long, help_heading = "Load")]
    pub msg_size: Option<usize>,

    /// Distribution the payload size is drawn from [default: normal]
    #[clap(long, value_enum, help_heading = "Load")]
    pub size_distribution: Option<SizeDistributionKind>,

    /// Standard deviation of the normal size draw as a fraction of --msg-size
    #[clap(long, default_value_t = crate::defaults::SIZE_VARIANCE, help_heading = "Load")]
    pub size_variance: f64,

    /// Standard deviation of the normal size draw in bytes (overrides --size-variance)
    #[clap(long, help_heading = "Load")]
    pub size_sigma: Option<f64>,

    /// Rate of the exponential size draw per byte; the mean size is 1/rate
    /// (overrides --msg-size as the mean)
    #[clap(long, help_heading = "Load")]
    pub size_rate: Option<f64>,

    /// Seed for the payload generator (random when omitted)
    #[clap(long, help_heading = "Load")]
    pub seed: Option<u64>,

    /// Stop publishing after this many messages
    #[clap(long, help_heading = "Load")]
    pub max_messages: Option<u64>,

    /// Run for this long and then shut down (e.g. "30s", "5m")
    #[clap(short = 'd', long, value_parser = parse_duration, help_heading = "Load")]
    pub duration: Option<Duration>,

    /// Reporting window in seconds
    #[clap(long, default_value_t = crate::defaults::STATS_INTERVAL_SECS, help_heading = "Output")]
    pub stats_interval: u64,

    /// Prefix for the <prefix>_tx.jsonl and <prefix>_rx.jsonl record logs [default: mqtt]
    #[clap(long, help_heading = "Output")]
    pub log_prefix: Option<String>,

    /// Write the final run summary as JSON to this file
    #[clap(long, help_heading = "Output")]
    pub summary_file: Option<PathBuf>,

    /// Write diagnostic logs to this file in addition to stderr
    #[clap(long, help_heading = "Output")]
    pub log_file: Option<PathBuf>,

    /// Diagnostic log level when neither -v nor -q is given [default: info]
    #[clap(long, value_enum, help_heading = "Output")]
    pub log_level: Option<LogLevel>,

    /// Increase diagnostic verbosity (-v debug, -vv trace)
    #[clap(short = 'v', long, action = ArgAction::Count, help_heading = "Output")]
    pub verbose: u8,

    /// Only print warnings, errors and reports
    #[clap(short = 'q', long, default_value_t = false, help_heading = "Output")]
    pub quiet: bool,
}

impl Default for Args {
    /// Arguments as if the binary had been invoked with no flags.
    ///
    /// derive(Default) would not apply the clap defaults, so parse an empty
    /// command line instead.
    fn default() -> Self {
        Self::parse_from([env!("CARGO_PKG_NAME")])
    }
}

/// Operating mode of the probe
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Publish synthetic traffic and measure it on the way back
    #[clap(name = "pubsub")]
    PubSub,

    /// Subscribe and log only; the publisher is disabled
    #[clap(name = "logger")]
    Logger,
}

impl Mode {
    pub fn publishes(self) -> bool {
        matches!(self, Mode::PubSub)
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Mode::PubSub => write!(f, "pubsub"),
            Mode::Logger => write!(f, "logger"),
        }
    }
}

/// Available transport backends
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// MQTT broker connection
    #[clap(name = "mqtt")]
    Mqtt,

    /// In-process loopback, no broker required
    #[clap(name = "loopback")]
    Loopback,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::Mqtt => write!(f, "MQTT"),
            TransportKind::Loopback => write!(f, "Loopback"),
        }
    }
}

/// MQTT quality of service levels
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
pub enum QosLevel {
    #[clap(name = "0")]
    AtMostOnce,

    #[clap(name = "1")]
    AtLeastOnce,

    #[clap(name = "2")]
    ExactlyOnce,
}

impl std::fmt::Display for QosLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QosLevel::AtMostOnce => write!(f, "0"),
            QosLevel::AtLeastOnce => write!(f, "1"),
            QosLevel::ExactlyOnce => write!(f, "2"),
        }
    }
}

/// Payload size distributions selectable from the command line
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SizeDistributionKind {
    /// Normal around --msg-size with --size-variance relative deviation
    #[clap(name = "normal")]
    Normal,

    /// Exponential with mean --msg-size
    #[clap(name = "exponential")]
    Exponential,
}

/// Diagnostic log levels accepted by --log-level and the config file
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    #[serde(alias = "Debug")]
    Debug,
    #[serde(alias = "Info")]
    Info,
    #[serde(alias = "Warn")]
    Warn,
    #[serde(alias = "Error")]
    Error,
}

impl LogLevel {
    /// `EnvFilter` directive for this level
    pub fn directive(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Parse duration from string (e.g., "10s", "5m", "1h")
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();

    if s.is_empty() {
        return Err("Duration cannot be empty".to_string());
    }

    let (num_str, unit) = if let Some(stripped) = s.strip_suffix("ms") {
        (stripped, "ms")
    } else if let Some(stripped) = s.strip_suffix('s') {
        (stripped, "s")
    } else if let Some(stripped) = s.strip_suffix('m') {
        (stripped, "m")
    } else if let Some(stripped) = s.strip_suffix('h') {
        (stripped, "h")
    } else {
        (s, "s") // Default to seconds
    };

    let num: f64 = num_str
        .trim()
        .parse()
        .map_err(|_| format!("Invalid number in duration: {}", num_str))?;

    if !num.is_finite() || num < 0.0 {
        return Err(format!("Duration must be a non-negative number: {}", s));
    }

    let secs = match unit {
        "ms" => num / 1000.0,
        "s" => num,
        "m" => num * 60.0,
        "h" => num * 3600.0,
        _ => return Err(format!("Invalid duration unit: {}", unit)),
    };

    Duration::try_from_secs_f64(secs).map_err(|e| format!("Duration out of range: {} ({})", s, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("10s").unwrap(), Duration::from_secs(10));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("10").unwrap(), Duration::from_secs(10));
        assert_eq!(parse_duration("1.5s").unwrap(), Duration::from_millis(1500));

        assert!(parse_duration("").is_err());
        assert!(parse_duration("invalid").is_err());
        assert!(parse_duration("-3s").is_err());
    }

    #[test]
    fn test_default_args_match_documented_defaults() {
        let args = Args::default();

        // Settings a config file may supply stay unset until resolved
        assert!(args.config.is_none());
        assert!(args.broker.is_none());
        assert!(args.port.is_none());
        assert!(args.freq.is_none());
        assert!(args.msg_size.is_none());
        assert!(args.size_distribution.is_none());
        assert!(args.log_prefix.is_none());
        assert!(args.log_level.is_none());

        assert_eq!(args.topic, "test/msg");
        assert_eq!(args.stats_interval, 5);
        assert_eq!(args.mode, Mode::PubSub);
        assert_eq!(args.qos, QosLevel::AtMostOnce);
        assert_eq!(args.transport, TransportKind::Mqtt);
        assert_eq!(args.connect_timeout, Duration::from_secs(10));
        assert!(args.username.is_none());
        assert!(args.password.is_none());
        assert!(args.duration.is_none());
    }

    #[test]
    fn test_parse_full_command_line() {
        let args = Args::parse_from([
            "mqtt-latency-bench",
            "--broker",
            "broker.example",
            "--port",
            "8883",
            "--topic",
            "bench/a",
            "--freq",
            "50",
            "--msg-size",
            "1200",
            "--stats-interval",
            "2",
            "--username",
            "alice",
            "--password",
            "secret",
            "--mode",
            "logger",
            "--qos",
            "1",
            "--size-distribution",
            "exponential",
            "--size-rate",
            "0.002",
            "--duration",
            "30s",
            "--log-level",
            "warn",
            "-vv",
        ]);

        assert_eq!(args.broker.as_deref(), Some("broker.example"));
        assert_eq!(args.port, Some(8883));
        assert_eq!(args.topic, "bench/a");
        assert_eq!(args.freq, Some(50));
        assert_eq!(args.msg_size, Some(1200));
        assert_eq!(args.stats_interval, 2);
        assert_eq!(args.username.as_deref(), Some("alice"));
        assert_eq!(args.password.as_deref(), Some("secret"));
        assert_eq!(args.mode, Mode::Logger);
        assert_eq!(args.qos, QosLevel::AtLeastOnce);
        assert_eq!(args.size_distribution, Some(SizeDistributionKind::Exponential));
        assert_eq!(args.size_rate, Some(0.002));
        assert_eq!(args.log_level, Some(LogLevel::Warn));
        assert_eq!(args.duration, Some(Duration::from_secs(30)));
        assert_eq!(args.verbose, 2);
    }

    #[test]
    fn test_mode_display_and_publishes() {
        assert_eq!(Mode::PubSub.to_string(), "pubsub");
        assert_eq!(Mode::Logger.to_string(), "logger");
        assert!(Mode::PubSub.publishes());
        assert!(!Mode::Logger.publishes());
    }

    #[test]
    fn test_transport_and_qos_display() {
        assert_eq!(TransportKind::Mqtt.to_string(), "MQTT");
        assert_eq!(TransportKind::Loopback.to_string(), "Loopback");
        assert_eq!(QosLevel::AtMostOnce.to_string(), "0");
        assert_eq!(QosLevel::AtLeastOnce.to_string(), "1");
        assert_eq!(QosLevel::ExactlyOnce.to_string(), "2");
    }
}
