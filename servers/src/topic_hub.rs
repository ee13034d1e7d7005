//! # Topic Hub
//!
//! Hosts an in-process secondary topic tier over WebSocket, so `coin_feed`
//! (or anything speaking the tier frames) can provision, publish to and
//! subscribe to topics. Only the configured tier user may log in.
//!
//! Routes: `/tier` (upgrade), `/health`.

use anyhow::{Context, Result};
use lib_common::secondary::{MemoryTier, TierHub};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use servers::bridge_logic::{config, logger, shutdown, tier_route};

const APP: &str = "topic_hub";

#[tokio::main]
async fn main() -> Result<()> {
    let settings = config::load_config(APP, 8080);
    logger::setup_logging(&settings.log_dir, &settings.log_level, APP)?;

    let tier = MemoryTier::new().with_login(
        settings.credentials.principal.clone(),
        settings.credentials.credential.clone(),
    );
    let hub = Arc::new(TierHub::new(tier));

    let addr = SocketAddr::from(([0, 0, 0, 0], settings.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {}", addr))?;

    let shutdown_token = CancellationToken::new();
    let server = tokio::spawn(tier_route::run(
        listener,
        tier_route::HubState::new(Arc::clone(&hub), shutdown_token.clone()),
    ));

    shutdown::wait_for_signal().await;
    shutdown_token.cancel();

    match server.await {
        Ok(Err(e)) => log::error!("Topic hub failed: {}", e),
        Err(e) => log::error!("Topic hub task panicked: {}", e),
        Ok(Ok(())) => {}
    }

    log::info!("Closed with {} live session(s).", hub.tier().session_count());
    Ok(())
}
