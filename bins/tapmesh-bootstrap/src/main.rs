//! tapmesh bootstrap node
//!
//! With `--dht <port>` this process is a tracker: the UDP rendezvous that
//! introduces segment members to each other. Without it (or with a negative
//! port) it is a forwarder: a relay that bridges peers no NAT traversal
//! could connect, registering itself with the configured trackers.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

mod forwarder;
mod tracker;

use forwarder::Forwarder;
use tracker::TrackerService;

/// tapmesh bootstrap node (tracker or forwarder)
#[derive(Parser)]
#[command(name = "tapmesh-bootstrap")]
#[command(author, version, about)]
struct Cli {
    /// UDP port the tracker listens on; omit or pass a negative value to
    /// run as a forwarder instead
    #[arg(long)]
    dht: Option<i32>,

    /// Trackers a forwarder registers with, `host:port,host:port,...`
    #[arg(long, default_value = "127.0.0.1:6881")]
    trackers: String,

    /// Forwarder relay port (0 picks an ephemeral port)
    #[arg(long, default_value = "0")]
    relay_port: u16,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level)?;

    match cli.dht {
        Some(port) if (0..=i32::from(u16::MAX)).contains(&port) => {
            run_tracker(port as u16).await
        }
        _ => run_forwarder(&cli.trackers, cli.relay_port).await,
    }
}

async fn run_tracker(port: u16) -> Result<()> {
    info!("Starting tracker on UDP port {}", port);
    let addr: SocketAddr = format!("0.0.0.0:{}", port)
        .parse()
        .context("Bad tracker port")?;
    let service = Arc::new(
        TrackerService::bind(addr)
            .await
            .context("Failed to bind tracker socket")?,
    );

    service.spawn_ping_sweep();

    let stats = Arc::clone(&service);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(60));
        loop {
            ticker.tick().await;
            info!(
                "Stats: {} nodes ({} control peers), {} pooled forwarders",
                stats.node_count().await,
                stats.control_peer_count().await,
                stats.forwarder_count().await,
            );
        }
    });

    tokio::select! {
        result = service.run() => {
            if let Err(e) = result {
                error!("Tracker error: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }
    info!("Tracker stopped");
    Ok(())
}

async fn run_forwarder(trackers: &str, relay_port: u16) -> Result<()> {
    info!("Starting forwarder (control peer)");
    let addr: SocketAddr = format!("0.0.0.0:{}", relay_port)
        .parse()
        .context("Bad relay port")?;
    let forwarder = Arc::new(
        Forwarder::bind(addr)
            .await
            .context("Failed to bind relay socket")?,
    );

    let _tracker_client = forwarder
        .register(trackers)
        .await
        .context("Failed to register with trackers")?;

    let stats = Arc::clone(&forwarder);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(60));
        loop {
            ticker.tick().await;
            info!("Stats: {} active tunnels", stats.tunnel_count().await);
        }
    });

    let runner = Arc::clone(&forwarder);
    tokio::select! {
        _ = runner.run() => {
            error!("Relay loop ended unexpectedly");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }
    info!("Forwarder stopped");
    Ok(())
}

fn init_logging(level: &str) -> Result<()> {
    let level = match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")?;
    Ok(())
}
