//! Periodic eviction of nodes that stopped reporting.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{info, instrument, warn};

use crate::state::AppState;

pub struct StaleNodeSweeper {
    state: AppState,
    interval: Duration,
    threshold: chrono::Duration,
}

impl StaleNodeSweeper {
    pub fn new(state: AppState, interval: Duration, stale_after: Duration) -> Self {
        let threshold = chrono::Duration::from_std(stale_after).unwrap_or(chrono::Duration::MAX);
        Self {
            state,
            interval,
            threshold,
        }
    }

    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.interval.as_secs(),
            stale_after_secs = self.threshold.num_seconds(),
            "Starting stale node sweeper"
        );

        let mut interval = tokio::time::interval(self.interval);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.sweep(Utc::now()).await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Stale node sweeper shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Evict stale nodes as of `now`, refreshing the balancer if any went.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Vec<String> {
        let evicted = self
            .state
            .registry()
            .evict_stale(now, self.threshold)
            .await;

        if !evicted.is_empty() {
            warn!(count = evicted.len(), nodes = ?evicted, "Evicted stale nodes");
            self.state.refresh_balancer().await;
        }
        evicted
    }
}
