//! Retention pruning for stored windows.

use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;

use crate::db::Store;

const PRUNE_INTERVAL: Duration = Duration::from_secs(3600);

/// Hourly loop deleting windows older than the retention horizon.
pub async fn run_retention_loop(
    store: Store,
    retention_days: u32,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let mut interval = tokio::time::interval(PRUNE_INTERVAL);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    tracing::info!(retention_days, "retention loop started");

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                tracing::info!("retention loop stopping");
                return;
            }
            _ = interval.tick() => {
                let cutoff = Utc::now() - ChronoDuration::days(retention_days as i64);
                match store.delete_windows_before(cutoff) {
                    Ok(0) => {}
                    Ok(removed) => tracing::info!(removed, %cutoff, "pruned expired windows"),
                    Err(e) => tracing::error!("retention prune failed: {}", e),
                }
            }
        }
    }
}
