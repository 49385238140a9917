//! geocall: resilient call engine for rate-limited geodata services
//!
//! Every upstream call goes through one path: cache, coalescing, per-service
//! token bucket, bounded exponential retry. Instances are constructed
//! explicitly and owned by the application; nothing here is a global.

pub mod apis;
pub mod cache;
pub mod coalesce;
pub mod config;
pub mod context;
pub mod engine;
pub mod errors;
pub mod logger;
pub mod rate_limiter;
pub mod retry;
pub mod services;

pub use cache::{CacheConfig, CacheKey, TtlLruCache};
pub use config::EngineConfig;
pub use context::{CallContext, CancelReason};
pub use engine::{
    CallEngine, CallRequest, EngineObserver, LoggingObserver, OneShot, RepeatableOperation, RequestFactory,
    StatsObserver,
};
pub use errors::{AttemptError, EngineError, ErrorKind};
pub use rate_limiter::{RateLimit, RateLimiters};
pub use retry::RetryPolicy;
pub use services::ServiceId;
