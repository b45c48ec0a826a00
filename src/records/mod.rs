//! Record maintenance: downsampling into longer tiers and retention.

mod aggregate;
mod retention;
mod rollup;

pub use aggregate::*;
pub use retention::*;
pub use rollup::*;

use crate::db::Store;

use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// How often raw records are pruned.
pub const RETENTION_INTERVAL: Duration = Duration::from_secs(3600);
/// How often longer records are built.
pub const ROLLUP_INTERVAL: Duration = Duration::from_secs(600);

/// Runs the retention and rollup jobs on their own timers.
pub struct RecordManager {
    store: Arc<Store>,
    raw_retention: ChronoDuration,
    settle: ChronoDuration,
    stop: broadcast::Sender<()>,
}

impl RecordManager {
    /// `settle` is how long after a window closes its rows are considered
    /// final; it should cover the poll timeout.
    pub fn new(store: Arc<Store>, raw_retention: Duration, settle: Duration) -> Self {
        let (stop, _) = broadcast::channel(1);
        Self {
            store,
            raw_retention: ChronoDuration::from_std(raw_retention).unwrap_or(ChronoDuration::hours(1)),
            settle: ChronoDuration::from_std(settle).unwrap_or(ChronoDuration::seconds(8)),
            stop,
        }
    }

    /// Start both background jobs.
    pub fn start(&self) {
        let store = self.store.clone();
        let raw_retention = self.raw_retention;
        let mut stop = self.stop.subscribe();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(RETENTION_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = stop.recv() => break,
                    _ = interval.tick() => {
                        if let Err(e) = delete_old_records(&store, raw_retention, Utc::now()) {
                            tracing::error!("RecordManager: retention pass failed: {}", e);
                        }
                    }
                }
            }
        });

        let store = self.store.clone();
        let settle = self.settle;
        let mut stop = self.stop.subscribe();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(ROLLUP_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = stop.recv() => break,
                    _ = interval.tick() => {
                        if let Err(e) = create_longer_records(&store, Utc::now(), settle) {
                            tracing::error!("RecordManager: rollup pass failed: {}", e);
                        }
                    }
                }
            }
        });
    }

    /// Stop both jobs.
    pub fn stop(&self) {
        let _ = self.stop.send(());
    }
}
