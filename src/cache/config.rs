/// Cache sizing and expiry
///
/// Capacity bounds the number of entries (LRU eviction when exceeded).
/// `default_ttl` applies when a caller does not pick its own TTL.
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum number of entries
    pub capacity: usize,

    /// Time-to-live used by `insert`
    pub default_ttl: Duration,
}

impl CacheConfig {
    /// Custom configuration
    pub fn custom(ttl_secs: u64, capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            default_ttl: Duration::from_secs(ttl_secs),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self::custom(3600, 10_000)
    }
}
