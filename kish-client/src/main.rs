//! Kish - Tunnel client component.
//!
//! Runs next to a local service and publishes it through a kish server.

mod config;
mod rewrite;
mod tunnel;

use anyhow::{Context, Result};
use clap::Parser;
use config::{default_config_path, Cli, ClientConfig};
use std::time::Duration;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;
use tunnel::{Target, TunnelClient};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    FmtSubscriber::builder()
        .with_max_level(if cli.debug { Level::DEBUG } else { Level::INFO })
        .with_target(false)
        .init();

    let path = match &cli.config {
        Some(path) => path.clone(),
        None => default_config_path().context("cannot determine the home directory")?,
    };
    let mut config = ClientConfig::load(&path)?;
    config.apply_cli(&cli);

    info!("Starting kish v{}", env!("CARGO_PKG_VERSION"));
    info!("Server: {}", config.kish_url);

    let client = TunnelClient {
        config,
        target: Target::from(&cli.command),
        host_header: cli.host_header.clone(),
        reconnect_delay: Duration::from_secs(cli.reconnect_delay),
        max_reconnects: cli.max_reconnects,
    };

    tokio::select! {
        result = tunnel::run_tunnel_loop(&client) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, closing tunnel");
            Ok(())
        }
    }
}
