//! Kish Server - Tunnel server component.
//!
//! Runs on a public host to accept tunnel connections and proxy traffic.

use anyhow::{Context, Result};
use clap::Parser;
use kish_server::config::{Cli, ServerConfig};
use kish_server::shutdown::wait_for_signal;
use kish_server::{tls, KishServer};
use tokio::net::TcpListener;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    FmtSubscriber::builder()
        .with_max_level(if cli.debug { Level::DEBUG } else { Level::INFO })
        .with_target(true)
        .with_thread_ids(true)
        .init();

    let mut config = ServerConfig::load(&cli.config)?;
    if let Some(listen) = cli.listen {
        config.listen = listen;
    }

    info!("Starting kish-server v{}", env!("CARGO_PKG_VERSION"));
    info!("Host: {}", config.host);
    info!("Domain suffix: {}", config.domain_suffix);
    info!(
        "TCP forwarding: {}",
        if config.enable_tcp_forwarding { "enabled" } else { "disabled" }
    );

    let acceptor = match (&config.tls_cert, &config.tls_key) {
        (Some(cert), Some(key)) => Some(tls::load_tls_acceptor(cert, key)?),
        _ => None,
    };

    let listener = TcpListener::bind(&config.listen)
        .await
        .with_context(|| format!("failed to listen on {}", config.listen))?;

    let server = KishServer::from_config(config)?;

    let signal_server = server.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        signal_server.shutdown().initiate_shutdown();
    });

    server.clone().serve(listener, acceptor).await?;
    server.shutdown().wait_for_drain().await;

    info!("Server stopped");
    Ok(())
}
