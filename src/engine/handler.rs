//! Handlers and the registry that routes each kind to one.
//!
//! A handler is the business logic for one kind of queue item. It runs on
//! that kind's worker, one item at a time. Errors and panics are caught by
//! the worker; they never stop the loop.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use crate::model::{Kind, QueueItem};

#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, item: QueueItem) -> anyhow::Result<()>;
}

/// Any `Fn(QueueItem) -> impl Future<Output = anyhow::Result<()>>` is a handler.
#[async_trait]
impl<F, Fut> Handler for F
where
    F: Fn(QueueItem) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, item: QueueItem) -> anyhow::Result<()> {
        (self)(item).await
    }
}

/// Handlers indexed by kind.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<Kind, Arc<dyn Handler>>,
}

impl HandlerRegistry {
    /// Create an empty registry with no handlers.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Route `kind` to `handler`, replacing any previous registration.
    pub fn register(mut self, kind: Kind, handler: impl Handler + 'static) -> Self {
        self.handlers.insert(kind, Arc::new(handler));
        self
    }

    pub fn register_shared(mut self, kind: Kind, handler: Arc<dyn Handler>) -> Self {
        self.handlers.insert(kind, handler);
        self
    }

    /// Look up the handler for a kind.
    pub fn get(&self, kind: Kind) -> Option<Arc<dyn Handler>> {
        self.handlers.get(&kind).cloned()
    }

    pub fn kinds(&self) -> impl Iterator<Item = Kind> + '_ {
        self.handlers.keys().copied()
    }
}
