//! Background poller: syncs every active item on a fixed interval.

use crate::services::aggregator::AggregatorClient;
use crate::services::sync::SyncService;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

/// Spawn the poll loop. Each tick syncs all active items concurrently; a
/// failing item only affects its own task.
pub fn spawn_poller(
    sync: Arc<SyncService>,
    client: Arc<dyn AggregatorClient>,
    every: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tracing::info!(interval_secs = every.as_secs(), "Starting sync poller");

        let mut timer = interval(every);
        timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick fires immediately; skip it so startup is not a sync storm.
        timer.tick().await;

        loop {
            timer.tick().await;
            match sync.sync_all_items(Arc::clone(&client), "poll").await {
                Ok(summary) => {
                    tracing::info!(
                        succeeded = summary.succeeded,
                        failed = summary.failed,
                        "Poll cycle complete"
                    );
                }
                Err(e) => {
                    tracing::error!(error = %e, "Poll cycle could not list items");
                }
            }
        }
    })
}
