//! Shared services handed to handlers.
//!
//! A [`Context`] owns the store, the memo cache, the batch pool, the
//! reclaimer and the notifier. It is built once at startup and shared by
//! `Arc`; there are no process-wide singletons.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::runtime::Handle;
use tracing::debug;

use crate::batch::BatchProcessor;
use crate::cache::{MemoCache, MemoKey};
use crate::config::Config;
use crate::egress::Notifier;
use crate::engine::{Dispatcher, HandlerRegistry, StatsCollector};
use crate::error::Result;
use crate::media::{self, ImageReport};
use crate::model::Document;
use crate::reclaim::{MemoryProbe, Reclaimable, Reclaimer, SystemProbe};
use crate::store::Store;

pub struct Context {
    pub config: Config,
    pub store: Arc<Store>,
    pub memo: Arc<MemoCache>,
    pub batch: Arc<BatchProcessor>,
    pub reclaimer: Arc<Reclaimer>,
    pub notifier: Arc<dyn Notifier>,
}

impl Context {
    /// Open the store and build every service from `config`.
    pub async fn open(config: Config, notifier: Arc<dyn Notifier>) -> Result<Arc<Self>> {
        Self::open_with_probe(config, notifier, Box::new(SystemProbe::new())).await
    }

    /// Like [`open`](Self::open) with a custom memory probe for the reclaimer.
    pub async fn open_with_probe(
        config: Config,
        notifier: Arc<dyn Notifier>,
        probe: Box<dyn MemoryProbe>,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        let store = Arc::new(Store::open(&config.store).await?);
        let memo = Arc::new(MemoCache::new("memo", config.cache.capacity));
        let batch = Arc::new(BatchProcessor::new(&config.batch)?);
        let reclaimer = Reclaimer::with_probe(config.reclaimer.clone(), probe)
            .with_target(store.reclaim_target())
            .with_target(Arc::clone(&memo) as Arc<dyn Reclaimable>);

        debug!(
            root = %store.root().display(),
            batch_workers = batch.workers(),
            "context opened"
        );

        Ok(Arc::new(Self {
            config,
            store,
            memo,
            batch,
            reclaimer: Arc::new(reclaimer),
            notifier,
        }))
    }

    /// Build a dispatcher with this context's queue capacities.
    pub fn dispatcher(&self, handlers: HandlerRegistry) -> Dispatcher {
        Dispatcher::new(&self.config.queues, handlers)
    }

    /// Build the stats loop for `dispatcher`.
    pub fn stats_collector(&self, dispatcher: Dispatcher) -> StatsCollector {
        StatsCollector::new(
            &self.config.stats,
            dispatcher,
            Arc::clone(&self.store),
            Arc::clone(&self.reclaimer),
        )
    }

    /// Return the memoized result of `function(args)`, computing it with
    /// `init` on a miss. Results live for the cache's default TTL.
    pub async fn memoize<A, T, F, Fut>(&self, function: &'static str, args: &A, init: F) -> anyhow::Result<T>
    where
        A: Serialize + ?Sized,
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let key = MemoKey::new(function, args)?;
        if let Some(cached) = self.memo.get(&key) {
            match serde_json::from_value(cached) {
                Ok(value) => return Ok(value),
                Err(e) => debug!(function, "memo entry has another shape, recomputing: {e}"),
            }
        }

        let value = init().await?;
        self.memo
            .set(key, serde_json::to_value(&value)?, self.config.cache.default_ttl());
        Ok(value)
    }

    /// Optimize an image on the batch pool. Reports are memoized per path
    /// and modification time, so an unchanged file is processed once.
    pub async fn optimize_image(&self, path: impl Into<PathBuf>) -> anyhow::Result<ImageReport> {
        let path = path.into();
        let modified = tokio::fs::metadata(&path)
            .await?
            .modified()?
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();

        let batch = Arc::clone(&self.batch);
        let config = self.config.media.clone();
        let args = (path.clone(), modified.to_string());
        self.memoize("optimize_image", &args, || async move {
            Ok(media::optimize_image_on(&batch, path, config).await?)
        })
        .await
    }

    /// Store facade for synchronous callers on non-runtime threads.
    pub fn blocking_store(&self, handle: Handle) -> BlockingStore {
        BlockingStore {
            store: Arc::clone(&self.store),
            handle,
        }
    }
}

/// Synchronous view of the [`Store`].
///
/// Each call blocks on `handle`. Never call it from inside the runtime; it
/// panics there. Use it from `std::thread`s or `spawn_blocking` closures.
#[derive(Clone)]
pub struct BlockingStore {
    store: Arc<Store>,
    handle: Handle,
}

impl BlockingStore {
    pub fn load(&self, name: &str) -> Result<Document> {
        self.handle.block_on(self.store.load(name))
    }

    pub fn save(&self, name: &str, doc: &Document) -> Result<bool> {
        self.handle.block_on(self.store.save(name, doc))
    }

    pub fn reset(&self, name: &str) -> Result<bool> {
        self.handle.block_on(self.store.reset(name))
    }
}
