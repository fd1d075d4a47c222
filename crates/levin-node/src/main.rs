//! Levin Node - runs a P2P overlay peer.
//!
//! This is the main entry point for the levin-node binary.

use anyhow::Result;
use clap::Parser;
use levin_p2p::{NetworkEvent, OverlayManager};
use std::path::PathBuf;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

mod config;

use config::NodeConfig;

/// Levin P2P overlay node.
#[derive(Parser, Debug)]
#[command(name = "levin-node")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "levin-node.toml")]
    config: PathBuf,

    /// P2P bind address
    #[arg(long)]
    bind_ip: Option<String>,

    /// P2P bind port
    #[arg(short, long)]
    port: Option<u16>,

    /// Port advertised to peers
    #[arg(long)]
    external_port: Option<u16>,

    /// Outbound connections to maintain
    #[arg(long)]
    target_connections: Option<usize>,

    /// Maximum inbound connections
    #[arg(long)]
    max_incoming: Option<usize>,

    /// Seed peer (repeatable), replaces the built-in list
    #[arg(long)]
    seed: Vec<String>,

    /// Peer directory file
    #[arg(long)]
    state_file: Option<PathBuf>,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Write the effective configuration to the config path and exit
    #[arg(long)]
    write_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    info!("Starting Levin Node v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = NodeConfig::load(&args.config, &args)?;

    if args.write_config {
        config.save(&args.config)?;
        info!("Configuration written to {:?}", args.config);
        return Ok(());
    }

    info!("P2P: {}:{}", config.overlay.bind_ip, config.overlay.bind_port);
    info!("Seeds: {}", config.overlay.seed_peers.len());
    info!("Peer state: {:?}", config.overlay.state_file);

    let manager = OverlayManager::new(config.overlay);
    let events = manager.subscribe();
    let logger = tokio::spawn(log_events(events));

    manager.start().await?;
    info!(local_id = %manager.controller().local_id(), "Overlay started");

    tokio::signal::ctrl_c().await.ok();
    info!("Shutdown signal received");

    manager.shutdown().await?;
    logger.abort();

    info!("Levin node stopped");
    Ok(())
}

/// Log overlay events until the feed closes.
async fn log_events(mut events: tokio::sync::broadcast::Receiver<NetworkEvent>) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "Event log fell behind");
                continue;
            }
            Err(RecvError::Closed) => break,
        };

        match &event {
            NetworkEvent::Connect { id, ip, port } => {
                info!(peer = %id, addr = %format!("{}:{}", ip, port), "Connected")
            }
            NetworkEvent::Disconnect { id, error } => {
                info!(peer = %id, error = ?error, "Disconnected")
            }
            NetworkEvent::Handshake { id, payload } => info!(
                peer = %id,
                height = payload.payload_data.current_height,
                peers = payload.local_peerlist.len(),
                "Handshake"
            ),
            NetworkEvent::ChangeId { old_id, new_id } => {
                debug!(old = %old_id, new = %new_id, "Peer identified")
            }
            NetworkEvent::Warn(message) | NetworkEvent::Error(message) => warn!("{}", message),
            other => debug!(event = other.name(), "Overlay event"),
        }
    }
}
