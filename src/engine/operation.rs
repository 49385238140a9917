use async_trait::async_trait;
use parking_lot::Mutex;
use std::future::Future;

use crate::errors::{AttemptError, ErrorKind};

/// One logical upstream request that the engine may run several times
///
/// `attempt` is invoked once per try with the 1-based attempt number. It
/// takes `&self`, so an implementation has nothing mutable to carry from one
/// attempt into the next: every request body is rebuilt from scratch.
#[async_trait]
pub trait RepeatableOperation: Send + Sync {
    type Output: Send;

    async fn attempt(&self, attempt: u32) -> Result<Self::Output, AttemptError>;

    /// Whether `attempt` can run more than once
    ///
    /// The engine rejects a non-replayable operation up front when the retry
    /// policy allows more than one attempt.
    fn replayable(&self) -> bool {
        true
    }
}

// ============================================================================
// RequestFactory - rebuilds the request on every attempt
// ============================================================================

pub struct RequestFactory<F> {
    factory: F,
}

impl<F> RequestFactory<F> {
    pub fn new(factory: F) -> Self {
        Self { factory }
    }
}

#[async_trait]
impl<F, Fut, T> RepeatableOperation for RequestFactory<F>
where
    F: Fn(u32) -> Fut + Send + Sync,
    Fut: Future<Output = Result<T, AttemptError>> + Send + 'static,
    T: Send,
{
    type Output = T;

    async fn attempt(&self, attempt: u32) -> Result<T, AttemptError> {
        (self.factory)(attempt).await
    }
}

// ============================================================================
// OneShot - a payload that can be sent exactly once
// ============================================================================

/// Wraps a request whose body is consumed by sending it
///
/// Only valid with a single-attempt policy; the engine refuses it otherwise.
pub struct OneShot<F> {
    payload: Mutex<Option<F>>,
}

impl<F> OneShot<F> {
    pub fn new(payload: F) -> Self {
        Self {
            payload: Mutex::new(Some(payload)),
        }
    }

    /// Whether the payload has already been sent
    pub fn is_consumed(&self) -> bool {
        self.payload.lock().is_none()
    }
}

#[async_trait]
impl<F, Fut, T> RepeatableOperation for OneShot<F>
where
    F: FnOnce() -> Fut + Send,
    Fut: Future<Output = Result<T, AttemptError>> + Send + 'static,
    T: Send,
{
    type Output = T;

    async fn attempt(&self, attempt: u32) -> Result<T, AttemptError> {
        let payload = self.payload.lock().take();
        match payload {
            Some(send) => send().await,
            None => Err(AttemptError::fatal(
                ErrorKind::InvalidRequest,
                format!("one-shot payload already consumed (attempt {})", attempt),
            )),
        }
    }

    fn replayable(&self) -> bool {
        false
    }
}
