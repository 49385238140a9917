/// Bounded, time-limited result cache
///
/// - `key`: deterministic `CacheKey` derivation from request parameters
/// - `manager`: `TtlLruCache`, the thread-safe TTL + LRU store
/// - `config`: capacity and default TTL presets
pub mod config;
pub mod key;
pub mod manager;

pub use config::CacheConfig;
pub use key::{CacheKey, CacheKeyBuilder};
pub use manager::{CacheMetrics, TtlLruCache};
