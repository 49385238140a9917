/// Error taxonomy for the call engine
///
/// Attempt-level failures (`AttemptError`) are produced by service adapters.
/// The engine turns them into exactly one `EngineError` per logical call,
/// annotated with service, cache key and attempt count.
use crate::cache::CacheKey;
use crate::context::CancelReason;
use crate::services::ServiceId;

pub mod attempt;
pub use attempt::{AttemptError, ErrorKind};

// =============================================================================
// ENGINE ERROR - one per logical call
// =============================================================================

/// Cloneable so a leader's failure can be handed to every coalesced follower.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EngineError {
    /// Caller's token or deadline fired while the call was suspended
    #[error("{service} call for '{key}' {reason} after {attempts} attempt(s) ({stage})")]
    Cancelled {
        service: ServiceId,
        key: CacheKey,
        reason: CancelReason,
        stage: &'static str,
        attempts: u32,
    },

    /// Upstream rejected the request permanently
    #[error("{service} call for '{key}' failed permanently on attempt {attempt}: {source}")]
    NonRetryable {
        service: ServiceId,
        key: CacheKey,
        attempt: u32,
        #[source]
        source: AttemptError,
    },

    /// Every attempt failed with a transient error
    #[error("{service} call for '{key}' exhausted {attempts} attempt(s): {source}")]
    Exhausted {
        service: ServiceId,
        key: CacheKey,
        attempts: u32,
        #[source]
        source: AttemptError,
    },

    /// Retries requested over a payload that cannot be rebuilt per attempt
    #[error(
        "{service} call for '{key}' uses a one-shot payload but allows {max_attempts} attempts; supply a request factory"
    )]
    NonReplayablePayload {
        service: ServiceId,
        key: CacheKey,
        max_attempts: u32,
    },

    /// The coalescing leader panicked or was dropped before delivering a result
    #[error("{service} call for '{key}' lost its leader: {reason}")]
    LeaderFailed {
        service: ServiceId,
        key: CacheKey,
        reason: String,
    },
}

impl EngineError {
    pub fn service(&self) -> ServiceId {
        match self {
            EngineError::Cancelled { service, .. }
            | EngineError::NonRetryable { service, .. }
            | EngineError::Exhausted { service, .. }
            | EngineError::NonReplayablePayload { service, .. }
            | EngineError::LeaderFailed { service, .. } => *service,
        }
    }

    pub fn key(&self) -> &CacheKey {
        match self {
            EngineError::Cancelled { key, .. }
            | EngineError::NonRetryable { key, .. }
            | EngineError::Exhausted { key, .. }
            | EngineError::NonReplayablePayload { key, .. }
            | EngineError::LeaderFailed { key, .. } => key,
        }
    }

    /// Number of upstream attempts made, where meaningful
    pub fn attempts(&self) -> Option<u32> {
        match self {
            EngineError::Cancelled { attempts, .. } => Some(*attempts),
            EngineError::NonRetryable { attempt, .. } => Some(*attempt),
            EngineError::Exhausted { attempts, .. } => Some(*attempts),
            EngineError::NonReplayablePayload { .. } => Some(0),
            EngineError::LeaderFailed { .. } => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, EngineError::Cancelled { .. })
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self, EngineError::Exhausted { .. })
    }

    /// Underlying attempt failure, if the call reached upstream
    pub fn attempt_error(&self) -> Option<&AttemptError> {
        match self {
            EngineError::NonRetryable { source, .. } | EngineError::Exhausted { source, .. } => {
                Some(source)
            }
            _ => None,
        }
    }

    /// Short label for logs and stats
    pub fn category(&self) -> &'static str {
        match self {
            EngineError::Cancelled { .. } => "cancelled",
            EngineError::NonRetryable { .. } => "non_retryable",
            EngineError::Exhausted { .. } => "exhausted",
            EngineError::NonReplayablePayload { .. } => "non_replayable",
            EngineError::LeaderFailed { .. } => "leader_failed",
        }
    }
}

// =============================================================================
// CONFIGURATION ERRORS
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config field '{field}': {reason}")]
    Invalid { field: String, reason: String },
}

impl ConfigError {
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field: field.into(),
            reason: reason.into(),
        }
    }
}
