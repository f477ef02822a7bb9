//! Identity cache
//!
//! A segmented, TTL-expiring cache sitting in front of a [`UserStore`]. Every
//! user is indexed twice, by id and by email, and both keys are always
//! written or removed together.
//!
//! # Storage
//!
//! Entries live in a [`moka::sync::SegmentedCache`]. Segments take the place
//! of shards, so traffic for different identities rarely contends. Expiry and
//! capacity eviction are moka's; housekeeping runs as the cache is used or
//! on demand through [`ShardedCache::run_pending_tasks`].
//!
//! # Pairs
//!
//! Every entry remembers the key it was written alongside. When moka evicts
//! an entry, by TTL or by capacity, its partner is queued and invalidated
//! before the next write or read completes. Writes lock per-key stripes, two
//! of them in ascending index order for a pair, and each entry carries the
//! generation of the write that made it, so a queued invalidation never
//! removes a pair written after the eviction.

use crate::db::CommitRollbacker;
use crate::types::Result;
use crate::users::{Email, User, UserStore};
use async_trait::async_trait;
use moka::notification::RemovalCause;
use moka::policy::EvictionPolicy;
use moka::sync::SegmentedCache;
use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

/// Default number of shards.
pub const DEFAULT_SHARDS: usize = 10;
/// Default total capacity across shards.
pub const DEFAULT_CAPACITY: u64 = 10_000;

/// Statistics for cache performance monitoring
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheStats {
    /// Number of cache hits
    pub hits: u64,
    /// Number of cache misses
    pub misses: u64,
    /// Entries dropped by expiry or capacity
    pub evictions: u64,
    /// Number of entries in cache
    pub entry_count: u64,
}

impl CacheStats {
    /// Calculate hit rate as a percentage
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            (self.hits as f64 / total as f64) * 100.0
        }
    }
}

#[derive(Debug, Clone)]
struct Slot<V> {
    value: V,
    partner: Option<Arc<str>>,
    generation: u64,
}

/// Partner keys whose other half was evicted, tagged with the pair's generation.
type Orphans = Arc<Mutex<Vec<(Arc<str>, u64)>>>;

/// A string-keyed cache split over moka segments, with pair-aware eviction.
pub struct ShardedCache<V> {
    inner: SegmentedCache<String, Slot<V>>,
    ttl: Duration,
    stripes: Vec<Mutex<()>>,
    orphans: Orphans,
    generation: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: Arc<AtomicU64>,
}

impl<V> ShardedCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Creates a cache with `shards` segments (at least one) and the default
    /// capacity.
    pub fn new(shards: usize, ttl: Duration) -> Self {
        Self::with_capacity(shards, ttl, DEFAULT_CAPACITY)
    }

    /// Creates a cache holding at most `capacity` entries across all segments.
    pub fn with_capacity(shards: usize, ttl: Duration, capacity: u64) -> Self {
        let shards = shards.max(1);
        let orphans: Orphans = Arc::new(Mutex::new(Vec::new()));
        let evictions = Arc::new(AtomicU64::new(0));

        let listener = {
            let orphans = orphans.clone();
            let evictions = evictions.clone();
            move |_key: Arc<String>, slot: Slot<V>, cause: RemovalCause| {
                if !cause.was_evicted() {
                    return;
                }
                evictions.fetch_add(1, Ordering::Relaxed);
                if let Some(partner) = slot.partner {
                    orphans.lock().push((partner, slot.generation));
                }
            }
        };

        let inner = SegmentedCache::builder(shards)
            .max_capacity(capacity)
            .time_to_live(ttl)
            .eviction_policy(EvictionPolicy::lru())
            .eviction_listener(listener)
            .build();

        Self {
            inner,
            ttl,
            stripes: (0..shards).map(|_| Mutex::new(())).collect(),
            orphans,
            generation: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions,
        }
    }

    /// Entry lifetime.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Number of segments requested.
    pub fn shard_count(&self) -> usize {
        self.stripes.len()
    }

    fn stripe(&self, key: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % self.stripes.len() as u64) as usize
    }

    // Writers to the same key serialize here; stripes are taken in index order.
    fn lock_keys(&self, k1: &str, k2: &str) -> (MutexGuard<'_, ()>, Option<MutexGuard<'_, ()>>) {
        let (a, b) = (self.stripe(k1), self.stripe(k2));
        if a == b {
            return (self.stripes[a].lock(), None);
        }

        let (lo, hi) = if a < b { (a, b) } else { (b, a) };
        let first = self.stripes[lo].lock();
        let second = self.stripes[hi].lock();
        (first, Some(second))
    }

    /// Returns the live value for `key`.
    pub fn get(&self, key: &str) -> Option<V> {
        self.settle();

        match self.inner.get(key) {
            Some(slot) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(slot.value)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Writes a single unpaired key.
    pub fn set(&self, key: &str, value: V) {
        {
            let _guard = self.stripes[self.stripe(key)].lock();
            let generation = self.generation.fetch_add(1, Ordering::Relaxed);
            self.inner.insert(
                key.to_string(),
                Slot {
                    value,
                    partner: None,
                    generation,
                },
            );
        }
        self.settle();
    }

    /// Removes a single key.
    pub fn remove(&self, key: &str) {
        {
            let _guard = self.stripes[self.stripe(key)].lock();
            self.inner.invalidate(key);
        }
        self.settle();
    }

    /// Writes `value` under both keys as one step.
    pub fn set_pair(&self, k1: &str, k2: &str, value: V) {
        {
            let _guards = self.lock_keys(k1, k2);
            let generation = self.generation.fetch_add(1, Ordering::Relaxed);

            self.inner.insert(
                k2.to_string(),
                Slot {
                    value: value.clone(),
                    partner: Some(Arc::from(k1)),
                    generation,
                },
            );
            self.inner.insert(
                k1.to_string(),
                Slot {
                    value,
                    partner: Some(Arc::from(k2)),
                    generation,
                },
            );
        }
        self.settle();
    }

    /// Removes both keys as one step. `k1` goes first, so a reader that
    /// misses on `k2` will also miss on `k1`.
    pub fn remove_pair(&self, k1: &str, k2: &str) {
        {
            let _guards = self.lock_keys(k1, k2);
            self.inner.invalidate(k1);
            self.inner.invalidate(k2);
        }
        self.settle();
    }

    /// Runs moka's pending housekeeping, then drops any partners it orphaned.
    pub fn run_pending_tasks(&self) {
        self.inner.run_pending_tasks();
        self.settle();
    }

    // Must not be called while holding a stripe.
    fn settle(&self) {
        loop {
            let orphans = std::mem::take(&mut *self.orphans.lock());
            if orphans.is_empty() {
                return;
            }

            for (key, generation) in orphans {
                let _guard = self.stripes[self.stripe(&key)].lock();
                let current = self.inner.get(key.as_ref()).map(|slot| slot.generation);
                if current == Some(generation) {
                    self.inner.invalidate(key.as_ref());
                    debug!(key = %key, "evicted partner key dropped");
                }
            }
        }
    }

    /// Approximate number of live entries; exact after [`Self::run_pending_tasks`].
    pub fn len(&self) -> usize {
        self.inner.entry_count() as usize
    }

    /// True when [`Self::len`] is zero.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every entry.
    pub fn clear(&self) {
        self.inner.invalidate_all();
        self.orphans.lock().clear();
    }

    /// Counters and current size.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            entry_count: self.inner.entry_count(),
        }
    }
}

// ============= Caching Store =============

/// A [`UserStore`] that serves reads from a [`ShardedCache`] and keeps it in
/// step with successful writes.
pub struct CachedUserStore {
    inner: Arc<dyn UserStore>,
    cache: Arc<ShardedCache<User>>,
}

impl CachedUserStore {
    /// Wraps `inner` with a fresh cache.
    pub fn new(inner: Arc<dyn UserStore>, shards: usize, ttl: Duration) -> Self {
        Self::with_cache(inner, Arc::new(ShardedCache::new(shards, ttl)))
    }

    /// Wraps `inner` with a shared cache.
    pub fn with_cache(inner: Arc<dyn UserStore>, cache: Arc<ShardedCache<User>>) -> Self {
        Self { inner, cache }
    }

    /// The underlying cache.
    pub fn cache(&self) -> &Arc<ShardedCache<User>> {
        &self.cache
    }

    fn write_cache(&self, user: &User) {
        self.cache
            .set_pair(&user.id.to_string(), user.email.as_str(), user.clone());
    }

    fn delete_cache(&self, user: &User) {
        self.cache
            .remove_pair(&user.id.to_string(), user.email.as_str());
    }
}

#[async_trait]
impl UserStore for CachedUserStore {
    fn with_tx(&self, tx: &Arc<dyn CommitRollbacker>) -> Result<Arc<dyn UserStore>> {
        Ok(Arc::new(CachedUserStore {
            inner: self.inner.with_tx(tx)?,
            cache: self.cache.clone(),
        }))
    }

    async fn create(&self, user: &User) -> Result<()> {
        self.inner.create(user).await?;
        self.write_cache(user);
        Ok(())
    }

    async fn delete(&self, user: &User) -> Result<()> {
        self.inner.delete(user).await?;
        self.delete_cache(user);
        Ok(())
    }

    async fn query_by_id(&self, user_id: Uuid) -> Result<User> {
        if let Some(user) = self.cache.get(&user_id.to_string()) {
            return Ok(user);
        }

        let user = self.inner.query_by_id(user_id).await?;
        self.write_cache(&user);
        Ok(user)
    }

    async fn query_by_email(&self, email: &Email) -> Result<User> {
        if let Some(user) = self.cache.get(email.as_str()) {
            return Ok(user);
        }

        let user = self.inner.query_by_email(email).await?;
        self.write_cache(&user);
        Ok(user)
    }
}
