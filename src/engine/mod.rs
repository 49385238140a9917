/// Resilient call engine
///
/// Composes the cache, the per-service rate limiters, the retry loop and the
/// coalescing group into one call path:
///
/// ```text
/// cache check -> coalesce -> [leader] rate limit -> attempt -> success | backoff -> attempt
///                                                             | exhausted | non-retryable | cancelled
/// ```
///
/// - `orchestrator`: `CallEngine`, `CallRequest`, `ServiceProfile`
/// - `operation`: `RepeatableOperation` and its `RequestFactory` / `OneShot` forms
/// - `observer`: lifecycle callbacks, `LoggingObserver`, `StatsObserver`
pub mod observer;
pub mod operation;
pub mod orchestrator;

pub use observer::{CallOutcome, CallSource, EngineObserver, EngineStats, LoggingObserver, StatsObserver};
pub use operation::{OneShot, RepeatableOperation, RequestFactory};
pub use orchestrator::{CallEngine, CallRequest, ServiceProfile};
