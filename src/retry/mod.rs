/// Retry/backoff controller
///
/// - `policy`: `RetryPolicy`, the immutable per-call backoff settings
/// - `runner`: `run_with_retry`, the cancellable retry loop
pub mod policy;
pub mod runner;

pub use policy::RetryPolicy;
pub use runner::{run_with_retry, RetryError};
