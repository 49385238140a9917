//! Token bucket for one external service
//!
//! Tokens accrue continuously at `rate` per second up to `burst`; each
//! successful `wait` consumes exactly one. Waiters queue on a fair async
//! mutex, so tokens are handed out in arrival order. The head of the queue
//! sleeps until its token is due (or a reconfiguration wakes it) and never
//! spins.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, Notify};
use tokio::time::Instant;

use crate::context::{CallContext, CancelReason};
use crate::errors::ConfigError;

/// Token deficits below this are treated as a whole token (float drift)
const EPSILON: f64 = 1e-9;

/// Rate limit settings for one bucket
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimit {
    /// Tokens added per second
    pub rate_per_second: f64,
    /// Maximum tokens held at once
    pub burst: u32,
}

impl RateLimit {
    pub fn new(rate_per_second: f64, burst: u32) -> Result<Self, ConfigError> {
        if !rate_per_second.is_finite() || rate_per_second <= 0.0 {
            return Err(ConfigError::invalid(
                "rate_per_second",
                format!("must be a positive number, got {}", rate_per_second),
            ));
        }
        if burst == 0 {
            return Err(ConfigError::invalid("burst", "must be at least 1"));
        }
        Ok(Self {
            rate_per_second,
            burst,
        })
    }
}

struct BucketState {
    rate: f64,
    burst: f64,
    tokens: f64,
    last_refill: Instant,
}

impl BucketState {
    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.burst);
        self.last_refill = now;
    }

    /// Take one token, or report how long until one is available
    fn try_take(&mut self, now: Instant) -> Result<(), Duration> {
        self.refill(now);
        if self.tokens + EPSILON >= 1.0 {
            self.tokens = (self.tokens - 1.0).max(0.0);
            return Ok(());
        }
        let deficit = 1.0 - self.tokens;
        let nanos = ((deficit / self.rate) * 1e9).ceil().max(1.0);
        Err(Duration::from_nanos(nanos as u64))
    }
}

pub struct TokenBucket {
    /// Identifier for logs
    name: String,

    state: parking_lot::Mutex<BucketState>,

    /// Arrival-order queue; the holder is the only waiter allowed to sleep on tokens
    queue: AsyncMutex<()>,

    /// Wakes the head waiter when rate/burst change
    reconfigured: Notify,

    granted: AtomicU64,
    waited_micros: AtomicU64,
}

impl TokenBucket {
    /// New bucket, starting full
    pub fn new(name: &str, limit: RateLimit) -> Self {
        let burst = limit.burst as f64;
        Self {
            name: name.to_string(),
            state: parking_lot::Mutex::new(BucketState {
                rate: limit.rate_per_second,
                burst,
                tokens: burst,
                last_refill: Instant::now(),
            }),
            queue: AsyncMutex::new(()),
            reconfigured: Notify::new(),
            granted: AtomicU64::new(0),
            waited_micros: AtomicU64::new(0),
        }
    }

    /// Wait for a token, returning how long the caller was held
    ///
    /// Returns the cancel reason if `ctx` fires first; no token is consumed then.
    pub async fn wait(&self, ctx: &CallContext) -> Result<Duration, CancelReason> {
        if let Some(reason) = ctx.cancel_reason() {
            return Err(reason);
        }
        let started = Instant::now();

        let _turn = tokio::select! {
            biased;
            reason = ctx.cancelled() => return Err(reason),
            turn = self.queue.lock() => turn,
        };

        loop {
            // Registered before the state check so a reconfigure in between is not lost
            let reconfigured = self.reconfigured.notified();

            let due_in = match self.state.lock().try_take(Instant::now()) {
                Ok(()) => {
                    let waited = started.elapsed();
                    self.granted.fetch_add(1, Ordering::Relaxed);
                    self.waited_micros
                        .fetch_add(waited.as_micros() as u64, Ordering::Relaxed);
                    return Ok(waited);
                }
                Err(due_in) => due_in,
            };

            tokio::select! {
                biased;
                reason = ctx.cancelled() => return Err(reason),
                _ = reconfigured => {}
                _ = tokio::time::sleep(due_in) => {}
            }
        }
    }

    /// Take a token only if one is free and nobody is queued ahead
    pub fn try_acquire(&self) -> bool {
        let Ok(_turn) = self.queue.try_lock() else {
            return false;
        };
        let acquired = self.state.lock().try_take(Instant::now()).is_ok();
        if acquired {
            self.granted.fetch_add(1, Ordering::Relaxed);
        }
        acquired
    }

    /// Change rate and burst; tokens already held are clamped to the new burst
    ///
    /// Callers that already received a token are unaffected. The queued head
    /// waiter is woken and recomputes its wait under the new rate.
    pub fn reconfigure(&self, limit: RateLimit) {
        {
            let mut state = self.state.lock();
            state.refill(Instant::now());
            state.rate = limit.rate_per_second;
            state.burst = limit.burst as f64;
            state.tokens = state.tokens.min(state.burst);
        }
        self.reconfigured.notify_waiters();
    }

    /// Tokens currently in the bucket (fractional)
    pub fn available_tokens(&self) -> f64 {
        let mut state = self.state.lock();
        state.refill(Instant::now());
        state.tokens
    }

    pub fn limit(&self) -> RateLimit {
        let state = self.state.lock();
        RateLimit {
            rate_per_second: state.rate,
            burst: state.burst as u32,
        }
    }

    pub fn rate(&self) -> f64 {
        self.state.lock().rate
    }

    pub fn burst(&self) -> u32 {
        self.state.lock().burst as u32
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Tokens handed out since creation
    pub fn granted(&self) -> u64 {
        self.granted.load(Ordering::Relaxed)
    }

    /// Total time callers spent waiting in `wait`
    pub fn total_wait(&self) -> Duration {
        Duration::from_micros(self.waited_micros.load(Ordering::Relaxed))
    }
}

impl std::fmt::Debug for TokenBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let limit = self.limit();
        f.debug_struct("TokenBucket")
            .field("name", &self.name)
            .field("rate_per_second", &limit.rate_per_second)
            .field("burst", &limit.burst)
            .field("granted", &self.granted())
            .finish()
    }
}
