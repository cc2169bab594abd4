//! tapmesh client
//!
//! Joins a virtual Ethernet segment: registers with the trackers under a
//! shared network fingerprint, discovers the other members, punches through
//! NATs where possible and falls back to forwarders where not.

use std::net::IpAddr;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

mod client;
mod config;

use client::TapmeshClient;
use config::ClientConfig;

/// tapmesh - virtual Ethernet segments over NAT
#[derive(Parser)]
#[command(name = "tapmesh-client")]
#[command(author, version, about)]
struct Cli {
    /// Tracker addresses, `host:port,host:port,...`
    #[arg(long, default_value = "127.0.0.1:6881")]
    trackers: String,

    /// Network fingerprint of the segment to join
    #[arg(long)]
    hash: String,

    /// UDP port for the data socket (0 picks an ephemeral port)
    #[arg(long, default_value = "0")]
    port: u16,

    /// Our address on the virtual segment
    #[arg(long)]
    ip: IpAddr,

    /// Our MAC on the virtual segment (generated when omitted)
    #[arg(long)]
    mac: Option<String>,

    /// TAP device name
    #[arg(long, default_value = "tapmesh0")]
    tap: String,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level)?;

    let config = ClientConfig {
        trackers: cli.trackers,
        fingerprint: cli.hash,
        listen_port: cli.port,
        tap_name: cli.tap,
        overlay_ip: cli.ip,
        overlay_mac: cli.mac,
    };

    let mut client = TapmeshClient::start(config).await?;

    tokio::select! {
        result = client.run() => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }

    client.shutdown().await;
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
