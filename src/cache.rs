//! Time-bound memoization cache.
//!
//! A capacity-bounded LRU cache where every entry carries its own TTL. An
//! entry is never returned once its TTL has elapsed; expired entries are
//! dropped lazily on lookup and swept by the reclaimer. The cache is an
//! optimization only: every caller must behave correctly when it is empty.

use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use moka::Expiry;
use moka::policy::EvictionPolicy;
use moka::sync::Cache;
use opentelemetry::KeyValue;
use serde::Serialize;

use crate::error::Result;
use crate::reclaim::{Pressure, Reclaimable};
use crate::telemetry::metrics;

/// Stored value plus the TTL it was inserted with.
#[derive(Clone)]
struct Timed<V> {
    value: V,
    ttl: Duration,
}

/// Expiry policy that reads the TTL off each entry.
struct PerEntryTtl;

impl<K, V> Expiry<K, Timed<V>> for PerEntryTtl {
    fn expire_after_create(&self, _key: &K, value: &Timed<V>, _created_at: Instant) -> Option<Duration> {
        Some(value.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &K,
        value: &Timed<V>,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

/// LRU cache with per-entry time-to-live.
pub struct TtlCache<K, V> {
    name: &'static str,
    cache: Cache<K, Timed<V>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<K, V> TtlCache<K, V>
where
    K: Hash + Eq + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Create a cache holding at most `capacity` entries.
    pub fn new(name: &'static str, capacity: u64) -> Self {
        Self {
            name,
            cache: Cache::builder()
                .max_capacity(capacity)
                .eviction_policy(EvictionPolicy::lru())
                .expire_after(PerEntryTtl)
                .support_invalidation_closures()
                .build(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Look up a live entry.
    pub fn get(&self, key: &K) -> Option<V> {
        let found = self.cache.get(key).map(|timed| timed.value);
        let result = if found.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            "hit"
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            "miss"
        };
        metrics::cache_lookups().add(
            1,
            &[
                KeyValue::new("cache", self.name),
                KeyValue::new("result", result),
            ],
        );
        found
    }

    /// Insert or replace an entry that expires `ttl` from now.
    pub fn set(&self, key: K, value: V, ttl: Duration) {
        self.cache.insert(key, Timed { value, ttl });
    }

    pub fn invalidate(&self, key: &K) {
        self.cache.invalidate(key);
    }

    pub fn invalidate_all(&self) {
        self.cache.invalidate_all();
        self.cache.run_pending_tasks();
    }

    /// Drop every entry whose key matches `predicate`.
    pub fn invalidate_where(&self, predicate: impl Fn(&K) -> bool + Send + Sync + 'static) {
        // Only fails when the builder lacks `support_invalidation_closures`.
        let _ = self.cache.invalidate_entries_if(move |key, _| predicate(key));
    }

    /// Number of live entries, after applying pending evictions.
    pub fn len(&self) -> u64 {
        self.cache.run_pending_tasks();
        self.cache.entry_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entry_count: self.cache.entry_count(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    /// Return the cached value, or compute it with `init` and cache it.
    ///
    /// Concurrent misses for the same key may both compute; the later
    /// insert wins. Errors from `init` are not cached.
    pub async fn get_or_try_insert_with<F, Fut, E>(&self, key: K, ttl: Duration, init: F) -> std::result::Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<V, E>>,
    {
        if let Some(value) = self.get(&key) {
            return Ok(value);
        }
        let value = init().await?;
        self.set(key, value.clone(), ttl);
        Ok(value)
    }
}

impl<K, V> Reclaimable for TtlCache<K, V>
where
    K: Hash + Eq + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        self.name
    }

    fn reclaim(&self, pressure: Pressure) -> u64 {
        match pressure {
            Pressure::Routine => {
                let before = self.cache.entry_count();
                self.cache.run_pending_tasks();
                before.saturating_sub(self.cache.entry_count())
            }
            Pressure::High => {
                // entry_count lags until pending inserts are applied.
                self.cache.run_pending_tasks();
                let before = self.cache.entry_count();
                self.invalidate_all();
                before
            }
        }
    }
}

/// Cache statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub entry_count: u64,
    pub hits: u64,
    pub misses: u64,
}

// ---------------------------------------------------------------------------
// Memo keys
// ---------------------------------------------------------------------------

/// Key for memoized handler computations: the function identity plus the
/// canonical JSON encoding of its arguments.
///
/// JSON keeps argument boundaries, so `("ab", "c")` and `("a", "bc")` never
/// collide the way concatenated strings would.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MemoKey {
    function: &'static str,
    args: String,
}

impl MemoKey {
    pub fn new<A: Serialize + ?Sized>(function: &'static str, args: &A) -> Result<Self> {
        Ok(Self {
            function,
            args: serde_json::to_string(args)?,
        })
    }

    pub fn function(&self) -> &'static str {
        self.function
    }
}

/// Cache shared by handlers for memoized results.
pub type MemoCache = TtlCache<MemoKey, serde_json::Value>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memo_keys_keep_argument_boundaries() {
        let a = MemoKey::new("format", &("ab", "c")).unwrap();
        let b = MemoKey::new("format", &("a", "bc")).unwrap();
        assert_ne!(a, b);

        let c = MemoKey::new("format", &("ab", "c")).unwrap();
        assert_eq!(a, c);

        let other_fn = MemoKey::new("profile", &("ab", "c")).unwrap();
        assert_ne!(a, other_fn);
    }

    #[test]
    fn hit_and_miss_are_counted() {
        let cache: TtlCache<&'static str, u32> = TtlCache::new("test", 10);
        assert!(cache.get(&"a").is_none());
        cache.set("a", 1, Duration::from_secs(60));
        assert_eq!(cache.get(&"a"), Some(1));

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn high_pressure_reclaim_clears_everything() {
        let cache: TtlCache<u32, u32> = TtlCache::new("test", 10);
        for i in 0..5 {
            cache.set(i, i, Duration::from_secs(60));
        }
        assert_eq!(cache.len(), 5);

        let freed = cache.reclaim(Pressure::High);
        assert_eq!(freed, 5);
        for i in 0..5 {
            assert!(cache.get(&i).is_none());
        }
    }
}
