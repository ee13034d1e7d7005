//! # Coin Feed
//!
//! Polls the Bitcoin price index and publishes each response to a Redis
//! channel. The same channel is subscribed back and fanned out to:
//!
//! - a price logger for the configured currencies,
//! - receive statistics, reported periodically by the monitor,
//! - the secondary topic tier over WebSocket, when enabled.
//!
//! A failed tier attach is logged and the feed keeps running without it. A
//! lost broker subscription is reopened after a short delay.

use anyhow::{Context, Result};
use lib_common::connections::RedisBroker;
use lib_common::core::{ReceiveStats, TickError};
use lib_common::retrieve::CoindeskSource;
use lib_common::secondary::WsTierConnector;
use lib_common::{ChannelBridge, ExternalSource, FanoutCoordinator, FetchError, Poller, StopFlag};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use servers::bridge_logic::{config, consumers::PriceLogger, logger, monitor, shutdown};

const APP: &str = "coin_feed";
const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    let settings = config::load_config(APP, 3000);
    logger::setup_logging(&settings.log_dir, &settings.log_level, APP)?;

    let broker = RedisBroker::connect(&settings.redis_url)
        .await
        .with_context(|| format!("connecting to {}", settings.redis_url))?;
    let bridge = Arc::new(ChannelBridge::new(Arc::new(broker)));

    // --- Fan-out ---
    let coordinator = Arc::new(FanoutCoordinator::new(settings.topic_path.clone()));
    let stats = ReceiveStats::new();
    coordinator.register_consumer("price-logger", PriceLogger::new(settings.currencies.clone()));
    coordinator.register_consumer("receive-stats", stats.clone());

    let follow_token = CancellationToken::new();
    let follower = tokio::spawn({
        let coordinator = Arc::clone(&coordinator);
        let bridge = Arc::clone(&bridge);
        let channel = settings.channel_name.clone();
        let token = follow_token.clone();
        async move {
            coordinator
                .follow_channel(&bridge, &channel, RESUBSCRIBE_DELAY, token)
                .await
        }
    });

    if settings.tier_enabled {
        let coordinator = Arc::clone(&coordinator);
        let connector = WsTierConnector::new().with_path(settings.tier_path.clone());
        let credentials = settings.credentials.clone();
        tokio::spawn(async move {
            if let Err(e) = coordinator.attach_secondary_tier(&connector, &credentials).await {
                log::error!("Secondary tier not attached: {}. Continuing with local consumers only.", e);
            }
        });
    } else {
        log::info!("Secondary tier disabled.");
    }

    let monitor_token = CancellationToken::new();
    let monitor = tokio::spawn(monitor::run(
        settings.stats_interval,
        settings.channel_name.clone(),
        stats.clone(),
        Arc::clone(&coordinator),
        monitor_token.clone(),
    ));

    // --- Polling ---
    let source = Arc::new(CoindeskSource::new(settings.source_url.clone(), settings.source_timeout));
    log::info!("Polling {} every {:?}", source.url(), settings.interval);
    let stop = StopFlag::new();
    let (session, mut results) = Poller::new(settings.interval).start(
        move || {
            let source = Arc::clone(&source);
            async move { source.fetch().await }
        },
        stop.predicate(),
        |failure: TickError<FetchError>| log::warn!("Poll {} failed: {}", failure.tick, failure.error),
    );

    let publisher = tokio::spawn({
        let bridge = Arc::clone(&bridge);
        let channel = settings.channel_name.clone();
        async move {
            while let Some(payload) = results.recv().await {
                if let Err(e) = bridge.publish(&channel, &payload).await {
                    log::warn!("Publish to '{}' failed: {}", channel, e);
                }
            }
        }
    });

    shutdown::wait_for_signal().await;

    // The loop checks the flag before each tick, so allow one full cycle.
    stop.stop();
    let grace = settings.interval + settings.source_timeout + Duration::from_secs(1);
    match tokio::time::timeout(grace, session.join()).await {
        Ok(Ok(outcome)) => log::info!(
            "Poller stopped ({:?}) after {} call(s), {} failed",
            outcome.reason,
            outcome.stats.invocations,
            outcome.stats.failures
        ),
        Ok(Err(e)) => log::error!("Poller task failed: {}", e),
        Err(_) => log::warn!("Poller did not stop within {:?}", grace),
    }
    if tokio::time::timeout(Duration::from_secs(5), publisher).await.is_err() {
        log::warn!("Publisher still busy at shutdown; abandoning it.");
    }

    coordinator.detach_secondary_tier().await;
    // Messages already queued are still delivered before the follower exits.
    follow_token.cancel();
    let _ = follower.await;

    monitor_token.cancel();
    let _ = monitor.await;

    log::info!("Shutdown complete.");
    Ok(())
}
