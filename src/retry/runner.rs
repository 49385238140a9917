//! Retry loop driving one logical call
//!
//! Attempt 1 runs immediately. A retryable failure sleeps `delay_for(n)`
//! before attempt n+1; a non-retryable failure, a success, or the last
//! allowed attempt ends the loop. Both the attempt and the backoff sleep
//! race against the caller's context, so cancellation is observed
//! mid-attempt and mid-delay alike.

use std::future::Future;
use std::time::Duration;

use super::policy::RetryPolicy;
use crate::context::{CallContext, CancelReason};
use crate::errors::AttemptError;

/// Terminal outcome of a failed retry loop
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RetryError {
    #[error("{reason} during {stage} after {attempts} attempt(s)")]
    Cancelled {
        reason: CancelReason,
        /// "attempt" or "backoff"
        stage: &'static str,
        attempts: u32,
    },

    #[error("attempt {attempt} failed permanently: {error}")]
    NonRetryable { attempt: u32, error: AttemptError },

    #[error("gave up after {attempts} attempt(s): {last}")]
    Exhausted { attempts: u32, last: AttemptError },
}

impl RetryError {
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Cancelled { attempts, .. } => *attempts,
            RetryError::NonRetryable { attempt, .. } => *attempt,
            RetryError::Exhausted { attempts, .. } => *attempts,
        }
    }
}

/// Run `attempt` until it succeeds, fails permanently, runs out of attempts,
/// or `ctx` fires
///
/// `attempt` receives the 1-based attempt number. `on_retry` is called with
/// the failed attempt number, the chosen delay and the error, right before
/// the backoff sleep.
pub async fn run_with_retry<T, F, Fut, H>(
    ctx: &CallContext,
    policy: &RetryPolicy,
    mut attempt: F,
    mut on_retry: H,
) -> Result<T, RetryError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, AttemptError>>,
    H: FnMut(u32, Duration, &AttemptError),
{
    let max_attempts = policy.max_attempts();
    let mut number = 1;

    loop {
        if let Some(reason) = ctx.cancel_reason() {
            return Err(RetryError::Cancelled {
                reason,
                stage: "attempt",
                attempts: number - 1,
            });
        }

        let outcome = tokio::select! {
            biased;
            reason = ctx.cancelled() => {
                return Err(RetryError::Cancelled { reason, stage: "attempt", attempts: number });
            }
            outcome = attempt(number) => outcome,
        };

        let error = match outcome {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };

        if error.is_cancellation() {
            return Err(RetryError::Cancelled {
                reason: ctx.cancel_reason().unwrap_or(CancelReason::Cancelled),
                stage: "attempt",
                attempts: number,
            });
        }
        if !error.retryable {
            return Err(RetryError::NonRetryable {
                attempt: number,
                error,
            });
        }
        if number >= max_attempts {
            return Err(RetryError::Exhausted {
                attempts: number,
                last: error,
            });
        }

        let delay = policy.jittered_delay_for(number);
        on_retry(number, delay, &error);

        tokio::select! {
            biased;
            reason = ctx.cancelled() => {
                return Err(RetryError::Cancelled { reason, stage: "backoff", attempts: number });
            }
            _ = tokio::time::sleep(delay) => {}
        }

        number += 1;
    }
}
