//! Periodic stats collection.
//!
//! Every tick the collector snapshots the dispatcher's counters, persists the
//! snapshot as a store document, and gives the reclaimer a chance to run.
//! Failures are logged; the loop keeps going until cancelled.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::StatsConfig;
use crate::error::{Error, Result};
use crate::model::{Kind, StatsSnapshot};
use crate::reclaim::Reclaimer;
use crate::store::Store;

use super::dispatcher::Dispatcher;

const MIN_INTERVAL: Duration = Duration::from_millis(1);

pub struct StatsCollector {
    dispatcher: Dispatcher,
    store: Arc<Store>,
    reclaimer: Arc<Reclaimer>,
    document: String,
    interval: Duration,
}

impl StatsCollector {
    pub fn new(
        config: &StatsConfig,
        dispatcher: Dispatcher,
        store: Arc<Store>,
        reclaimer: Arc<Reclaimer>,
    ) -> Self {
        Self {
            dispatcher,
            store,
            reclaimer,
            document: config.document.clone(),
            interval: config.interval().max(MIN_INTERVAL),
        }
    }

    /// Override the tick period. Periods under a millisecond are raised to
    /// one millisecond.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval.max(MIN_INTERVAL);
        self
    }

    /// Build a snapshot from the dispatcher's current counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        let stats = self.dispatcher.stats();
        let uptime_seconds = self.dispatcher.uptime().as_secs_f64();
        let items_per_second = if uptime_seconds > 0.0 {
            stats.total_processed() as f64 / uptime_seconds
        } else {
            0.0
        };

        let by_name = |counts: &BTreeMap<Kind, u64>| -> BTreeMap<String, u64> {
            counts.iter().map(|(k, v)| (k.as_str().to_string(), *v)).collect()
        };

        StatsSnapshot {
            uptime_seconds,
            processed_by_kind: by_name(&stats.processed),
            error_count: stats.errors,
            queue_depths: self
                .dispatcher
                .depths()
                .into_iter()
                .map(|(k, depth)| (k.as_str().to_string(), depth))
                .collect(),
            rejected_by_kind: by_name(&stats.rejected),
            items_per_second,
            timestamp: Utc::now(),
        }
    }

    /// Take a snapshot and persist it.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot could not be written to the store.
    pub async fn collect_once(&self) -> Result<StatsSnapshot> {
        let snapshot = self.snapshot();
        let doc = snapshot.to_document()?;
        if !self.store.save(&self.document, &doc).await? {
            return Err(Error::Other(format!("stats document {} not saved", self.document)));
        }
        debug!(
            processed = snapshot.processed_by_kind.values().sum::<u64>(),
            errors = snapshot.error_count,
            "stats collected"
        );
        Ok(snapshot)
    }

    async fn reclaim(&self) {
        let reclaimer = Arc::clone(&self.reclaimer);
        match tokio::task::spawn_blocking(move || reclaimer.reclaim(false)).await {
            Ok(_) => {}
            Err(e) => warn!("reclaimer task failed: {e}"),
        }
    }

    /// Collect every interval until `shutdown` is cancelled. The first tick
    /// fires one interval after start.
    pub async fn run(&self, shutdown: CancellationToken) {
        let start = tokio::time::Instant::now() + self.interval;
        let mut ticker = tokio::time::interval_at(start, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(interval_secs = self.interval.as_secs_f64(), "stats collector started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if let Err(e) = self.collect_once().await {
                error!("stats collection failed: {e}");
            }
            self.reclaim().await;
        }
        info!("stats collector stopped");
    }
}
