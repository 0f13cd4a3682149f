//! YAML configuration file.
//!
//! A config file supplies defaults for the broker address, the publish
//! frequency, the payload size distribution, the diagnostic log level and the
//! record log location. Anything also given on the command line wins.
//!
//! ```yaml
//! server:
//!   host: broker.local
//!   port: 1883
//! generation:
//!   frequency: 20
//!   size:
//!     distribution: normal   # or exponential
//!     parA: 600              # mean size in bytes
//!     parB: 50               # normal only: standard deviation in bytes
//! loglevel: Info             # Debug, Info, Warn or Error
//! logfile: runs/msg.log      # record logs become runs/msg_tx.jsonl and runs/msg_rx.jsonl
//! ```

use crate::cli::{Args, LogLevel, SizeDistributionKind};
use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub server: Option<ServerSection>,
    pub generation: Option<GenerationSection>,
    pub loglevel: Option<LogLevel>,
    pub logfile: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerSection {
    pub host: Option<String>,
    pub port: Option<u16>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GenerationSection {
    /// Messages per second
    pub frequency: Option<u32>,
    pub size: Option<SizeSection>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SizeSection {
    pub distribution: SizeDistributionKind,
    /// Mean size in bytes for both distributions
    #[serde(rename = "parA")]
    pub par_a: Option<f64>,
    /// Standard deviation in bytes; normal distribution only
    #[serde(rename = "parB")]
    pub par_b: Option<f64>,
}

impl FileConfig {
    /// Read and parse a config file
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {:?}", path))?;
        Self::from_yaml_str(&contents)
            .with_context(|| format!("Failed to parse config file {:?}", path))
    }

    pub fn from_yaml_str(contents: &str) -> Result<Self> {
        // An empty document parses as unit, not as an empty mapping
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(contents)?)
    }

    /// Fill every setting `args` leaves unset from this file
    pub fn apply_to(&self, args: &mut Args) -> Result<()> {
        if let Some(server) = &self.server {
            if args.broker.is_none() {
                args.broker = server.host.clone();
            }
            if args.port.is_none() {
                args.port = server.port;
            }
        }

        if let Some(generation) = &self.generation {
            if args.freq.is_none() {
                args.freq = generation.frequency;
            }
            if let Some(size) = &generation.size {
                Self::apply_size(size, args)?;
            }
        }

        if args.log_level.is_none() {
            args.log_level = self.loglevel;
        }
        if let Some(logfile) = &self.logfile {
            if args.log_prefix.is_none() {
                args.log_prefix = Some(record_prefix(logfile));
            }
        }
        Ok(())
    }

    fn apply_size(size: &SizeSection, args: &mut Args) -> Result<()> {
        let distribution = *args.size_distribution.get_or_insert(size.distribution);

        if let Some(mean) = size.par_a {
            if !mean.is_finite() || mean < 1.0 {
                bail!("generation.size.parA must be a mean size of at least 1 byte, got {}", mean);
            }
            if args.msg_size.is_none() {
                // `as` saturates; the size limit is checked with the other arguments
                args.msg_size = Some(mean.round() as usize);
            }
        }

        // parB only means something for the distribution it was written for
        if let Some(sigma) = size.par_b {
            if size.distribution != SizeDistributionKind::Normal {
                bail!("generation.size.parB is only used by the normal distribution");
            }
            if distribution == SizeDistributionKind::Normal && args.size_sigma.is_none() {
                args.size_sigma = Some(sigma);
            }
        }
        Ok(())
    }
}

/// Record log prefix for a message log path: the path without its extension
fn record_prefix(logfile: &Path) -> String {
    logfile.with_extension("").to_string_lossy().into_owned()
}

impl Args {
    /// Merge the `--config` file, if one was given, under the command line
    pub fn with_config_file(mut self) -> Result<Self> {
        if let Some(path) = self.config.clone() {
            FileConfig::load(&path)?.apply_to(&mut self)?;
        }
        Ok(self)
    }
}
