use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::Parser;
use ozone_artery::{CoreDelivery, Fabric};
use ozone_transport_websocket::{WebSocketConnector, WebSocketConnectorConfig};
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::flag;
use tracing::info;

mod config;
mod registry;
mod secret;

use crate::config::OrchestratorConfig;

const SHUTDOWN_POLL: Duration = Duration::from_millis(200);

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file (.toml, .yaml, .json or .env)
    #[arg(long, short)]
    config: Option<PathBuf>,
    /// Validate configuration, print the peer registry and exit
    #[arg(long)]
    check: bool,
}

fn log_status(fabric: &Fabric) {
    for artery in fabric.arteries().iter() {
        info!(peer = %artery.name(), state = ?artery.state(), "artery status");
    }
    info!(backlog = fabric.queue().len(), "queue status");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = std::env::var("OZONE_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    let config = OrchestratorConfig::new(cli.config).context("failed to load config")?;
    let peers = registry::parse_peers(&config.peers).context("invalid peer registry")?;

    if cli.check {
        for peer in &peers {
            println!("{}\t{}", peer.name, peer.authority(config.socket_port));
        }
        return Ok(());
    }
    if peers.is_empty() {
        tracing::warn!("no peers configured, nothing to connect to");
    }

    let secret = secret::load_secret(&config.secret_path, config.require_secret)?;
    let connector = WebSocketConnector::new(WebSocketConnectorConfig {
        default_port: config.socket_port,
        secret,
        connect_timeout: config.connect_timeout,
        link_capacity: config.link_capacity,
        ..WebSocketConnectorConfig::default()
    });
    let fabric = Fabric::new(
        peers,
        Arc::new(connector),
        Arc::new(CoreDelivery::new(config.delivery_options())),
        config.fabric_config(),
    )?;

    info!("Ozone configuration is ready, establishing arteries");
    fabric.start_heartbeat();

    let shutdown = Arc::new(AtomicBool::new(false));
    flag::register(SIGTERM, Arc::clone(&shutdown)).context("register SIGTERM")?;
    flag::register(SIGINT, Arc::clone(&shutdown)).context("register SIGINT")?;

    let mut ticker = tokio::time::interval(SHUTDOWN_POLL);
    let mut last_status = Instant::now();
    loop {
        ticker.tick().await;
        if shutdown.load(Ordering::Relaxed) {
            break;
        }
        if last_status.elapsed() >= config.status_interval {
            log_status(&fabric);
            last_status = Instant::now();
        }
    }

    info!("shutdown requested");
    fabric.shutdown();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::Cli;
    use clap::Parser;

    #[test]
    fn cli_accepts_config_and_check() {
        let cli = Cli::parse_from(["ozone-orchestrator", "--config", "ozone.toml", "--check"]);
        assert_eq!(cli.config.as_deref(), Some(std::path::Path::new("ozone.toml")));
        assert!(cli.check);

        let cli = Cli::parse_from(["ozone-orchestrator"]);
        assert!(cli.config.is_none());
        assert!(!cli.check);
    }
}
