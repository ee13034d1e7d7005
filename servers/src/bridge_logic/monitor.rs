use lib_common::FanoutCoordinator;
use lib_common::core::{Origin, ReceiveStats};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;

fn summary(stats: &ReceiveStats, coordinator: &FanoutCoordinator) -> String {
    let primary = stats.totals(Origin::Primary);
    let secondary = stats.totals(Origin::Secondary);
    let fanout = coordinator.stats();
    let last = stats
        .last_received()
        .map(|at| at.with_timezone(&chrono::Local).format("%H:%M:%S").to_string())
        .unwrap_or_else(|| "never".to_string());
    format!(
        "received {} msg/{} B from channel, {} msg/{} B from tier (last {}); forwarded {} ({} failed); tier {:?}; consumer failures {}",
        primary.messages,
        primary.bytes,
        secondary.messages,
        secondary.bytes,
        last,
        fanout.forwarded,
        fanout.forward_failures,
        coordinator.attachment_state(),
        fanout.consumer_failures
    )
}

fn idle_warning(stats: &ReceiveStats, channel: &str) -> Option<String> {
    match stats.last_received() {
        Some(_) => None,
        None => Some(format!("No data received yet on channel '{}'", channel)),
    }
}

/// Logs receive and fan-out statistics for `channel` every `every` until
/// shutdown.
pub async fn run(
    every: Duration,
    channel: String,
    stats: ReceiveStats,
    coordinator: Arc<FanoutCoordinator>,
    shutdown: CancellationToken,
) {
    let mut ticker = interval(every);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                log::info!("Monitor stopping: {}", summary(&stats, &coordinator));
                break;
            }
            _ = ticker.tick() => {
                if let Some(warning) = idle_warning(&stats, &channel) {
                    log::warn!("{}", warning);
                }
                log::info!("{}", summary(&stats, &coordinator));
            }
        }
    }
}
