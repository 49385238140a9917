//! Lifecycle observers
//!
//! The engine reports what it does through `EngineObserver` callbacks and
//! never logs or counts inline. Observers run synchronously on the calling
//! task, so implementations must be cheap and must not block.

use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::cache::CacheKey;
use crate::errors::{AttemptError, EngineError};
use crate::logger::{self, LogLevel, LogTag};
use crate::services::ServiceId;

/// Where a successful result came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallSource {
    Cache,
    Upstream,
    /// Shared from a concurrent identical call
    Coalesced,
}

impl fmt::Display for CallSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallSource::Cache => write!(f, "cache"),
            CallSource::Upstream => write!(f, "upstream"),
            CallSource::Coalesced => write!(f, "coalesced"),
        }
    }
}

/// Final result of one logical call, as seen by observers
#[derive(Debug, Clone, Copy)]
pub enum CallOutcome<'a> {
    Served { source: CallSource, attempts: u32 },
    Failed(&'a EngineError),
}

#[allow(unused_variables)]
pub trait EngineObserver: Send + Sync {
    fn on_cache_hit(&self, service: ServiceId, key: &CacheKey) {}

    fn on_cache_miss(&self, service: ServiceId, key: &CacheKey) {}

    /// The caller received the result of a concurrent identical call
    fn on_coalesced(&self, service: ServiceId, key: &CacheKey) {}

    /// A token was granted after `waited`
    fn on_rate_limit_wait(&self, service: ServiceId, key: &CacheKey, attempt: u32, waited: Duration) {}

    fn on_attempt_start(&self, service: ServiceId, key: &CacheKey, attempt: u32) {}

    fn on_attempt_end(
        &self,
        service: ServiceId,
        key: &CacheKey,
        attempt: u32,
        result: Result<(), &AttemptError>,
        elapsed: Duration,
    ) {
    }

    /// A retry is scheduled after `delay`
    fn on_backoff(&self, service: ServiceId, key: &CacheKey, attempt: u32, delay: Duration, error: &AttemptError) {}

    fn on_outcome(&self, service: ServiceId, key: &CacheKey, outcome: CallOutcome<'_>, elapsed: Duration) {}
}

// ============================================================================
// LOGGING OBSERVER
// ============================================================================

/// Turns lifecycle events into tagged log lines
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingObserver;

impl EngineObserver for LoggingObserver {
    fn on_cache_hit(&self, service: ServiceId, key: &CacheKey) {
        // Hot path: skip formatting unless someone listens
        if logger::enabled(LogTag::Cache, LogLevel::Debug) {
            logger::debug(LogTag::Cache, &format!("HIT {} '{}'", service, key));
        }
    }

    fn on_cache_miss(&self, service: ServiceId, key: &CacheKey) {
        if logger::enabled(LogTag::Cache, LogLevel::Debug) {
            logger::debug(LogTag::Cache, &format!("MISS {} '{}'", service, key));
        }
    }

    fn on_coalesced(&self, service: ServiceId, key: &CacheKey) {
        logger::debug(
            LogTag::Coalesce,
            &format!("{} '{}' served by in-flight call", service, key),
        );
    }

    fn on_rate_limit_wait(&self, service: ServiceId, key: &CacheKey, attempt: u32, waited: Duration) {
        if waited >= Duration::from_millis(1) {
            logger::debug(
                LogTag::RateLimit,
                &format!(
                    "{} '{}' attempt {} held {}ms for a token",
                    service,
                    key,
                    attempt,
                    waited.as_millis()
                ),
            );
        }
    }

    fn on_attempt_start(&self, service: ServiceId, key: &CacheKey, attempt: u32) {
        if logger::enabled(LogTag::Engine, LogLevel::Verbose) {
            logger::verbose(
                LogTag::Engine,
                &format!("{} '{}' attempt {} started", service, key, attempt),
            );
        }
    }

    fn on_attempt_end(
        &self,
        service: ServiceId,
        key: &CacheKey,
        attempt: u32,
        result: Result<(), &AttemptError>,
        elapsed: Duration,
    ) {
        match result {
            Ok(()) => logger::debug(
                LogTag::Engine,
                &format!(
                    "{} '{}' attempt {} succeeded in {}ms",
                    service,
                    key,
                    attempt,
                    elapsed.as_millis()
                ),
            ),
            Err(error) => logger::warning(
                LogTag::Engine,
                &format!(
                    "{} '{}' attempt {} failed in {}ms: {} (retryable={})",
                    service,
                    key,
                    attempt,
                    elapsed.as_millis(),
                    error,
                    error.retryable
                ),
            ),
        }
    }

    fn on_backoff(&self, service: ServiceId, key: &CacheKey, attempt: u32, delay: Duration, error: &AttemptError) {
        logger::info(
            LogTag::Retry,
            &format!(
                "{} '{}' retrying in {}ms after attempt {} ({})",
                service,
                key,
                delay.as_millis(),
                attempt,
                error.kind
            ),
        );
    }

    fn on_outcome(&self, service: ServiceId, key: &CacheKey, outcome: CallOutcome<'_>, elapsed: Duration) {
        match outcome {
            CallOutcome::Served { source, attempts } => logger::debug(
                LogTag::Engine,
                &format!(
                    "{} '{}' served from {} ({} attempt(s), {}ms)",
                    service,
                    key,
                    source,
                    attempts,
                    elapsed.as_millis()
                ),
            ),
            CallOutcome::Failed(error) if error.is_cancelled() => {
                logger::debug(LogTag::Engine, &error.to_string())
            }
            CallOutcome::Failed(error) => logger::error(LogTag::Engine, &error.to_string()),
        }
    }
}

// ============================================================================
// STATS OBSERVER
// ============================================================================

/// Point-in-time counters collected by `StatsObserver`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    pub calls: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub coalesced: u64,
    pub upstream_attempts: u64,
    pub failed_attempts: u64,
    pub backoffs: u64,
    pub rate_limited_waits: u64,
    pub rate_limit_wait_ms: u64,
    pub successes: u64,
    pub failures: u64,
    pub cancellations: u64,
}

impl EngineStats {
    /// Share of calls answered without an upstream attempt of their own
    pub fn saved_ratio(&self) -> f64 {
        if self.calls == 0 {
            0.0
        } else {
            (self.cache_hits + self.coalesced) as f64 / self.calls as f64
        }
    }
}

impl fmt::Display for EngineStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "calls={} hits={} misses={} coalesced={} attempts={} failed_attempts={} backoffs={} \
             limiter_waits={} ({}ms) ok={} failed={} cancelled={}",
            self.calls,
            self.cache_hits,
            self.cache_misses,
            self.coalesced,
            self.upstream_attempts,
            self.failed_attempts,
            self.backoffs,
            self.rate_limited_waits,
            self.rate_limit_wait_ms,
            self.successes,
            self.failures,
            self.cancellations
        )
    }
}

#[derive(Debug, Default)]
pub struct StatsObserver {
    calls: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    coalesced: AtomicU64,
    upstream_attempts: AtomicU64,
    failed_attempts: AtomicU64,
    backoffs: AtomicU64,
    rate_limited_waits: AtomicU64,
    rate_limit_wait_ms: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    cancellations: AtomicU64,
}

impl StatsObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> EngineStats {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        EngineStats {
            calls: load(&self.calls),
            cache_hits: load(&self.cache_hits),
            cache_misses: load(&self.cache_misses),
            coalesced: load(&self.coalesced),
            upstream_attempts: load(&self.upstream_attempts),
            failed_attempts: load(&self.failed_attempts),
            backoffs: load(&self.backoffs),
            rate_limited_waits: load(&self.rate_limited_waits),
            rate_limit_wait_ms: load(&self.rate_limit_wait_ms),
            successes: load(&self.successes),
            failures: load(&self.failures),
            cancellations: load(&self.cancellations),
        }
    }
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl EngineObserver for StatsObserver {
    fn on_cache_hit(&self, _service: ServiceId, _key: &CacheKey) {
        bump(&self.cache_hits);
    }

    fn on_cache_miss(&self, _service: ServiceId, _key: &CacheKey) {
        bump(&self.cache_misses);
    }

    fn on_coalesced(&self, _service: ServiceId, _key: &CacheKey) {
        bump(&self.coalesced);
    }

    fn on_rate_limit_wait(&self, _service: ServiceId, _key: &CacheKey, _attempt: u32, waited: Duration) {
        if !waited.is_zero() {
            bump(&self.rate_limited_waits);
            self.rate_limit_wait_ms
                .fetch_add(waited.as_millis() as u64, Ordering::Relaxed);
        }
    }

    fn on_attempt_start(&self, _service: ServiceId, _key: &CacheKey, _attempt: u32) {
        bump(&self.upstream_attempts);
    }

    fn on_attempt_end(
        &self,
        _service: ServiceId,
        _key: &CacheKey,
        _attempt: u32,
        result: Result<(), &AttemptError>,
        _elapsed: Duration,
    ) {
        if result.is_err() {
            bump(&self.failed_attempts);
        }
    }

    fn on_backoff(&self, _service: ServiceId, _key: &CacheKey, _attempt: u32, _delay: Duration, _error: &AttemptError) {
        bump(&self.backoffs);
    }

    fn on_outcome(&self, _service: ServiceId, _key: &CacheKey, outcome: CallOutcome<'_>, _elapsed: Duration) {
        bump(&self.calls);
        match outcome {
            CallOutcome::Served { .. } => bump(&self.successes),
            CallOutcome::Failed(error) => {
                bump(&self.failures);
                if error.is_cancelled() {
                    bump(&self.cancellations);
                }
            }
        }
    }
}
