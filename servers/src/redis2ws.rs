//! # Redis to WebSocket Bridge
//!
//! Relays one Redis pub/sub channel to any number of WebSocket clients, and
//! publishes every frame a client sends back onto that channel, byte for byte.
//! All clients share a single Redis subscription.
//!
//! Routes: `/` and `/ws` (upgrade), `/health`.

use anyhow::{Context, Result};
use lib_common::ChannelBridge;
use lib_common::connections::RedisBroker;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use servers::bridge_logic::{config, downstream, logger, shutdown};

const APP: &str = "redis2ws";

#[tokio::main]
async fn main() -> Result<()> {
    let settings = config::load_config(APP, 3000);
    logger::setup_logging(&settings.log_dir, &settings.log_level, APP)?;

    let broker = RedisBroker::connect(&settings.redis_url)
        .await
        .with_context(|| format!("connecting to {}", settings.redis_url))?;
    let bridge = Arc::new(ChannelBridge::new(Arc::new(broker)));

    let addr = SocketAddr::from(([0, 0, 0, 0], settings.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {}", addr))?;

    let shutdown_token = CancellationToken::new();
    let state = downstream::AppState::new(bridge, settings.channel_name.clone(), shutdown_token.clone());
    let server = tokio::spawn(downstream::run(listener, state));

    shutdown::wait_for_signal().await;
    shutdown_token.cancel();

    match server.await {
        Ok(Err(e)) => log::error!("Relay server failed: {}", e),
        Err(e) => log::error!("Relay server task panicked: {}", e),
        Ok(Ok(())) => {}
    }

    log::info!("Shutdown complete.");
    Ok(())
}
