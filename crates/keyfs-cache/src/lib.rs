//! KeyFS Cache - bounded LRU cache with single-flight fetches
//!
//! `BoundedCache` holds up to `capacity` entries, evicting the least recently
//! used one that a caller-supplied predicate does not mark dirty. Dirty entries
//! never expire and are never evicted, so the cache may grow past its nominal
//! capacity while unflushed state piles up.
//!
//! A key can be claimed with [`BoundedCache::block`] while its value is being
//! fetched. Concurrent [`BoundedCache::get`] calls on a claimed key wait until
//! the claimant calls [`BoundedCache::add`] or [`BoundedCache::invalidate`].

use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::trace;

/// Predicate deciding whether a value holds unflushed state
pub type DirtyPredicate<V> = Box<dyn Fn(&V) -> bool + Send + Sync>;

/// Cache statistics for monitoring
#[derive(Debug, Default)]
pub struct CacheStats {
    /// Number of cache hits
    pub hits: AtomicU64,
    /// Number of cache misses (including expired entries)
    pub misses: AtomicU64,
    /// Number of entries evicted for capacity
    pub evictions: AtomicU64,
    /// Number of entries dropped because they expired
    pub expirations: AtomicU64,
    /// Number of times a reader waited on an in-flight fetch
    pub waits: AtomicU64,
}

impl CacheStats {
    /// Calculate hit ratio (0.0 to 1.0)
    #[allow(clippy::cast_precision_loss)]
    pub fn hit_ratio(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        if total == 0 {
            return 0.0;
        }
        hits as f64 / total as f64
    }
}

struct CacheEntry<V> {
    value: V,
    /// Logical clock value of the last access, for LRU ordering
    last_access: u64,
    /// Start of the expiration window
    validated_at: Instant,
}

enum Slot<V> {
    /// Claimed by a caller that is fetching the value
    Pending,
    Ready(CacheEntry<V>),
}

enum Lookup<V> {
    Hit(V),
    Miss,
    Expired,
    Wait,
}

/// Thread-safe bounded LRU cache
pub struct BoundedCache<K, V> {
    slots: Mutex<HashMap<K, Slot<V>>>,
    /// Woken whenever a pending slot is resolved
    resolved: Notify,
    capacity: usize,
    expiration: Option<Duration>,
    is_dirty: DirtyPredicate<V>,
    clock: AtomicU64,
    stats: CacheStats,
}

impl<K, V> BoundedCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Create a cache where no entry is ever dirty
    #[must_use]
    pub fn new(capacity: usize, expiration: Option<Duration>) -> Self {
        Self::with_dirty_predicate(capacity, expiration, Box::new(|_| false))
    }

    /// Create a cache that pins entries for which `is_dirty` returns true
    #[must_use]
    pub fn with_dirty_predicate(
        capacity: usize,
        expiration: Option<Duration>,
        is_dirty: DirtyPredicate<V>,
    ) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            resolved: Notify::new(),
            capacity: capacity.max(1),
            expiration,
            is_dirty,
            clock: AtomicU64::new(0),
            stats: CacheStats::default(),
        }
    }

    /// Get cache statistics
    pub const fn stats(&self) -> &CacheStats {
        &self.stats
    }

    /// Nominal capacity
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of slots, including pending claims
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    /// Check if the cache is empty
    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn is_expired(&self, entry: &CacheEntry<V>, now: Instant) -> bool {
        match self.expiration {
            Some(ttl) => {
                now.duration_since(entry.validated_at) >= ttl && !(self.is_dirty)(&entry.value)
            }
            None => false,
        }
    }

    /// Look up a value, waiting while another caller is fetching it
    pub async fn get(&self, key: &K) -> Option<V> {
        loop {
            let notified = self.resolved.notified();
            tokio::pin!(notified);

            let lookup = {
                let mut slots = self.slots.lock();
                let now = Instant::now();
                let lookup = match slots.get_mut(key) {
                    None => Lookup::Miss,
                    Some(Slot::Pending) => {
                        // Register before releasing the lock so a concurrent
                        // add/invalidate cannot slip between check and wait.
                        notified.as_mut().enable();
                        Lookup::Wait
                    }
                    Some(Slot::Ready(entry)) if self.is_expired(entry, now) => Lookup::Expired,
                    Some(Slot::Ready(entry)) => {
                        entry.last_access = self.tick();
                        Lookup::Hit(entry.value.clone())
                    }
                };
                if matches!(lookup, Lookup::Expired) {
                    slots.remove(key);
                    self.stats.expirations.fetch_add(1, Ordering::Relaxed);
                }
                lookup
            };

            match lookup {
                Lookup::Hit(value) => {
                    self.stats.hits.fetch_add(1, Ordering::Relaxed);
                    return Some(value);
                }
                Lookup::Miss | Lookup::Expired => {
                    self.stats.misses.fetch_add(1, Ordering::Relaxed);
                    return None;
                }
                Lookup::Wait => {
                    self.stats.waits.fetch_add(1, Ordering::Relaxed);
                    notified.await;
                }
            }
        }
    }

    /// Insert a value unless a live entry is already present.
    ///
    /// Resolves a pending claim on `key` and wakes its waiters. Returns false
    /// when an unexpired entry already exists.
    pub fn add(&self, key: K, value: V) -> bool {
        let mut slots = self.slots.lock();
        if let Some(Slot::Ready(entry)) = slots.get(&key) {
            if !self.is_expired(entry, Instant::now()) {
                return false;
            }
        }
        self.insert_locked(&mut slots, key, value);
        drop(slots);
        self.resolved.notify_waiters();
        true
    }

    /// Insert a value, replacing any existing entry
    pub fn replace(&self, key: K, value: V) {
        let mut slots = self.slots.lock();
        self.insert_locked(&mut slots, key, value);
        drop(slots);
        self.resolved.notify_waiters();
    }

    fn insert_locked(&self, slots: &mut HashMap<K, Slot<V>>, key: K, value: V) {
        let entry = CacheEntry {
            value,
            last_access: self.tick(),
            validated_at: Instant::now(),
        };
        slots.insert(key.clone(), Slot::Ready(entry));
        self.evict_locked(slots, &key);
    }

    /// Evict clean LRU entries until the cache is within capacity
    fn evict_locked(&self, slots: &mut HashMap<K, Slot<V>>, keep: &K) {
        while slots.len() > self.capacity {
            let victim = slots
                .iter()
                .filter_map(|(k, slot)| match slot {
                    Slot::Ready(entry) if k != keep && !(self.is_dirty)(&entry.value) => {
                        Some((k, entry.last_access))
                    }
                    _ => None,
                })
                .min_by_key(|(_, last_access)| *last_access)
                .map(|(k, _)| k.clone());

            let Some(victim) = victim else {
                trace!(
                    len = slots.len(),
                    capacity = self.capacity,
                    "cache over capacity, nothing evictable"
                );
                break;
            };
            slots.remove(&victim);
            self.stats.evictions.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Claim `key` for an in-flight fetch.
    ///
    /// Returns false if the key is already claimed or holds a live entry.
    pub fn block(&self, key: K) -> bool {
        let mut slots = self.slots.lock();
        match slots.get(&key) {
            Some(Slot::Pending) => false,
            Some(Slot::Ready(entry)) if !self.is_expired(entry, Instant::now()) => false,
            _ => {
                slots.insert(key, Slot::Pending);
                true
            }
        }
    }

    /// Drop an entry or pending claim, waking any waiters
    pub fn invalidate(&self, key: &K) {
        let removed = self.slots.lock().remove(key);
        if matches!(removed, Some(Slot::Pending)) {
            self.resolved.notify_waiters();
        }
    }

    /// Restart the expiration window of an entry
    pub fn revalidate(&self, key: &K) -> bool {
        let mut slots = self.slots.lock();
        match slots.get_mut(key) {
            Some(Slot::Ready(entry)) => {
                entry.validated_at = Instant::now();
                true
            }
            _ => false,
        }
    }

    /// Remove every expired clean entry, returning how many were dropped
    pub fn purge_expired(&self) -> usize {
        if self.expiration.is_none() {
            return 0;
        }
        let now = Instant::now();
        let mut slots = self.slots.lock();
        let before = slots.len();
        slots.retain(|_, slot| match slot {
            Slot::Ready(entry) => !self.is_expired(entry, now),
            Slot::Pending => true,
        });
        let purged = before - slots.len();
        self.stats
            .expirations
            .fetch_add(purged as u64, Ordering::Relaxed);
        purged
    }

    /// Return the cached value or fetch it, deduplicating concurrent fetches.
    ///
    /// Only one caller runs `fetch` for a given key at a time; the others wait
    /// and observe its result. A failed or cancelled fetch releases the claim.
    pub async fn get_or_fetch<F, Fut, E>(&self, key: K, fetch: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        loop {
            if let Some(value) = self.get(&key).await {
                return Ok(value);
            }
            if self.block(key.clone()) {
                break;
            }
        }

        let mut claim = Claim {
            cache: self,
            key: Some(key),
        };
        let value = fetch().await?;
        if let Some(key) = claim.key.take() {
            self.replace(key, value.clone());
        }
        Ok(value)
    }
}

/// Releases a pending claim if the fetch does not complete
struct Claim<'a, K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    cache: &'a BoundedCache<K, V>,
    key: Option<K>,
}

impl<K, V> Drop for Claim<'_, K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            self.cache.invalidate(&key);
        }
    }
}
