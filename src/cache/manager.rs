/// Generic in-memory cache with per-entry TTL and LRU eviction
///
/// Thread-safe, generic over key/value types.
/// Reads take a shared lock and record recency with an atomic tick, so
/// concurrent hits never serialize on each other. Anything that removes or
/// replaces an entry (insert, eviction, lazy expiry) takes the write lock.
use super::config::CacheConfig;
use crate::logger::{self, LogTag};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Used when `now + ttl` would overflow the clock
const FAR_FUTURE: Duration = Duration::from_secs(30 * 365 * 24 * 3600);

/// Cache entry with expiry and recency tracking
struct CacheEntry<V> {
    value: V,
    expires_at: Instant,
    last_access: AtomicU64,
}

impl<V> CacheEntry<V> {
    fn new(value: V, ttl: Duration, tick: u64) -> Self {
        let now = Instant::now();
        Self {
            value,
            expires_at: now.checked_add(ttl).unwrap_or(now + FAR_FUTURE),
            last_access: AtomicU64::new(tick),
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }

    fn touch(&self, tick: u64) {
        self.last_access.fetch_max(tick, Ordering::Relaxed);
    }
}

/// Cache metrics for monitoring
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheMetrics {
    pub hits: u64,
    pub misses: u64,
    pub inserts: u64,
    pub evictions: u64,
    pub expirations: u64,
}

impl CacheMetrics {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    inserts: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

pub struct TtlLruCache<K, V>
where
    K: Clone + Eq + Hash,
    V: Clone,
{
    config: CacheConfig,
    data: RwLock<HashMap<K, CacheEntry<V>>>,
    /// Logical access clock; higher means more recently used
    clock: AtomicU64,
    counters: Counters,
}

impl<K, V> TtlLruCache<K, V>
where
    K: Clone + Eq + Hash,
    V: Clone,
{
    pub fn new(config: CacheConfig) -> Self {
        let capacity = config.capacity.max(1);
        Self {
            config: CacheConfig { capacity, ..config },
            data: RwLock::new(HashMap::with_capacity(capacity.min(1024))),
            clock: AtomicU64::new(0),
            counters: Counters::default(),
        }
    }

    /// Get a copy of the value; expired entries are removed and count as a miss
    pub fn get(&self, key: &K) -> Option<V> {
        let now = Instant::now();
        {
            let data = self.data.read();
            match data.get(key) {
                None => {
                    self.counters.misses.fetch_add(1, Ordering::Relaxed);
                    return None;
                }
                Some(entry) if !entry.is_expired(now) => {
                    entry.touch(self.tick());
                    self.counters.hits.fetch_add(1, Ordering::Relaxed);
                    return Some(entry.value.clone());
                }
                Some(_) => {}
            }
        }

        // Expired: upgrade to the write lock and re-check, a writer may have
        // refreshed the entry in between
        let mut data = self.data.write();
        let still_expired = match data.get(key) {
            Some(entry) if !entry.is_expired(now) => {
                entry.touch(self.tick());
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                return Some(entry.value.clone());
            }
            Some(_) => true,
            None => false,
        };
        if still_expired {
            data.remove(key);
            self.counters.expirations.fetch_add(1, Ordering::Relaxed);
        }
        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Insert with the configured default TTL
    pub fn insert(&self, key: K, value: V) {
        self.set(key, value, self.config.default_ttl);
    }

    /// Insert or overwrite, resetting expiry; evicts the LRU entry when full
    pub fn set(&self, key: K, value: V, ttl: Duration) {
        let mut data = self.data.write();

        if !data.contains_key(&key) && data.len() >= self.config.capacity {
            self.evict_lru(&mut data);
        }

        data.insert(key, CacheEntry::new(value, ttl, self.tick()));
        self.counters.inserts.fetch_add(1, Ordering::Relaxed);
    }

    /// Remove specific key from cache
    pub fn remove(&self, key: &K) -> Option<V> {
        self.data.write().remove(key).map(|entry| entry.value)
    }

    /// Live value without touching recency or hit/miss counters
    pub fn peek(&self, key: &K) -> Option<V> {
        let now = Instant::now();
        self.data
            .read()
            .get(key)
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| entry.value.clone())
    }

    /// Whether a live entry exists, without touching recency
    pub fn contains(&self, key: &K) -> bool {
        let now = Instant::now();
        self.data
            .read()
            .get(key)
            .map(|entry| !entry.is_expired(now))
            .unwrap_or(false)
    }

    /// Drop every expired entry, returning how many were removed
    pub fn cleanup(&self) -> usize {
        let now = Instant::now();
        let mut data = self.data.write();
        let before = data.len();
        data.retain(|_, entry| !entry.is_expired(now));
        let removed = before - data.len();
        self.counters
            .expirations
            .fetch_add(removed as u64, Ordering::Relaxed);
        removed
    }

    /// Clear all entries
    pub fn clear(&self) {
        self.data.write().clear();
    }

    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.config.capacity
    }

    pub fn default_ttl(&self) -> Duration {
        self.config.default_ttl
    }

    pub fn metrics(&self) -> CacheMetrics {
        CacheMetrics {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            inserts: self.counters.inserts.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            expirations: self.counters.expirations.load(Ordering::Relaxed),
        }
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    // Caller holds the write lock. Linear scan: hits only bump an atomic tick
    // under the read lock, so there is no ordered recency index to consult.
    fn evict_lru(&self, data: &mut HashMap<K, CacheEntry<V>>) {
        let lru_key = data
            .iter()
            .min_by_key(|(_, entry)| entry.last_access.load(Ordering::Relaxed))
            .map(|(key, _)| key.clone());

        if let Some(lru_key) = lru_key {
            data.remove(&lru_key);
            self.counters.evictions.fetch_add(1, Ordering::Relaxed);
        }
    }
}

impl<K, V> TtlLruCache<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Periodically purge expired entries until `shutdown` is cancelled
    pub fn spawn_cleanup_task(
        self: &Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // First tick completes immediately
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = cache.cleanup();
                        if removed > 0 {
                            logger::debug(
                                LogTag::Cache,
                                &format!("Cleanup removed {} expired entries ({} left)", removed, cache.len()),
                            );
                        }
                    }
                }
            }
            logger::debug(LogTag::Cache, "Cleanup task stopped");
        })
    }
}
