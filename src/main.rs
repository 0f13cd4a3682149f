//! # MQTT Latency Bench - Main Entry Point
//!
//! Parses the command line, installs logging, builds the probe configuration
//! and runs the probe until it is interrupted, its duration elapses or its
//! message limit is reached.
//!
//! ## Shutdown
//!
//! Ctrl-C (and SIGTERM on unix) cancel the run. The engine then stops its
//! tasks, disconnects, drains the last partial window and flushes the record
//! logs before the summary is printed. Startup connection failures and
//! publish failures exit non-zero.

use anyhow::Result;
use clap::Parser;
use mqtt_latency_bench::{
    cli::Args, logging::init_logging, transport::TransportFactory, ProbeConfig, ProbeRunner,
    VERSION,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Settings from --config sit under the command line
    let args = Args::parse().with_config_file()?;

    // Keep the guard alive so the file log flushes on exit
    let _log_guard = init_logging(&args)?;

    info!("Starting MQTT Latency Bench v{}", VERSION);

    let config = ProbeConfig::from_args(&args)?;
    let cancel = CancellationToken::new();
    tokio::spawn(cancel_on_signal(cancel.clone()));

    let transport = TransportFactory::create(config.transport);
    let summary = ProbeRunner::new(config).run(transport, cancel).await?;

    println!("{}", summary);
    if let Some(path) = &args.summary_file {
        summary.write_json(path)?;
        info!("Run summary written to {:?}", path);
    }

    info!("MQTT Latency Bench finished");
    Ok(())
}

/// Cancel `cancel` on the first Ctrl-C or SIGTERM
async fn cancel_on_signal(cancel: CancellationToken) {
    tokio::select! {
        _ = shutdown_signal() => {
            info!("Signal received, shutting down");
            cancel.cancel();
        }
        _ = cancel.cancelled() => {}
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                terminate.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
