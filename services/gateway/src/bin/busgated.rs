//! Busgate daemon
//!
//! Usage:
//!   busgated --config /etc/busgate/busgate.toml
//!   busgated --log-level debug --json-logs

use anyhow::{Context, Result};
use busgate::{serial_config, Gateway};
use busgate_codec::PROTOCOL_VERSION;
use busgate_config::{BusDriverKind, GatewayConfig, LoggingConfig};
use busgate_network::{BusDriver, LoopbackBus, SerialBus};
use clap::Parser;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "busgated")]
#[command(about = "Local socket gateway to an acknowledged serial bus")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(short, long)]
    log_level: Option<String>,

    /// Enable JSON logging format
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = GatewayConfig::load(args.config.as_deref()).context("Failed to load configuration")?;
    init_logging(&args, &config.logging)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        protocol = PROTOCOL_VERSION,
        socket = ?config.socket.path,
        driver = ?config.bus.driver,
        "Starting busgate"
    );

    match config.bus.driver {
        BusDriverKind::Serial => serve(&config, SerialBus::new(serial_config(&config))).await,
        BusDriverKind::Loopback => serve(&config, LoopbackBus::new()).await,
    }
}

async fn serve<B: BusDriver>(config: &GatewayConfig, bus: B) -> Result<()> {
    let mut gateway = Gateway::new(config, bus).map_err(|e| {
        error!("Failed to start gateway: {}", e);
        e
    })?;
    gateway.start().await;
    gateway.run(shutdown_signal()).await;
    info!("Busgate stopped");
    Ok(())
}

fn init_logging(args: &Args, logging: &LoggingConfig) -> Result<()> {
    let level = args.log_level.as_deref().unwrap_or(&logging.level);
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .with_context(|| format!("Invalid log level: {}", level))?;

    if args.json_logs || logging.json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for CTRL+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => info!("Received CTRL+C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
