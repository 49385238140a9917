/// Attempt-level error classification
///
/// Service adapters report every failed attempt as an explicit
/// `{kind, retryable}` pair. The retry controller only ever looks at these
/// two fields; it never inspects concrete error types.
use serde::{Deserialize, Serialize};
use std::fmt;

/// What went wrong with a single upstream attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Upstream throttled us (HTTP 429 and friends)
    RateLimited,
    /// Upstream temporarily unavailable (502/503, maintenance)
    Unavailable,
    /// Request or gateway timed out
    Timeout,
    /// Other 5xx-class failure
    Server,
    /// Connection reset, DNS failure, TLS failure
    Transport,
    /// Upstream rejected the request as malformed
    InvalidRequest,
    /// Upstream has no answer for the request
    NotFound,
    /// Credentials rejected
    Unauthorized,
    /// Response could not be decoded
    Decode,
    /// The attempt observed cancellation of its context
    Cancelled,
    Other,
}

impl ErrorKind {
    /// Default retry classification for this kind
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ErrorKind::RateLimited
                | ErrorKind::Unavailable
                | ErrorKind::Timeout
                | ErrorKind::Server
                | ErrorKind::Transport
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::Unavailable => "unavailable",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Server => "server",
            ErrorKind::Transport => "transport",
            ErrorKind::InvalidRequest => "invalid_request",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::Decode => "decode",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Other => "other",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tagged failure of one attempt
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct AttemptError {
    pub kind: ErrorKind,
    pub retryable: bool,
    pub message: String,
}

impl AttemptError {
    /// Classify with the kind's default retryability
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            retryable: kind.is_transient(),
            message: message.into(),
        }
    }

    /// Transient failure: the retry loop may try again
    pub fn retryable(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            retryable: true,
            message: message.into(),
        }
    }

    /// Permanent failure: abort without spending the remaining attempts
    pub fn fatal(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            retryable: false,
            message: message.into(),
        }
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::fatal(ErrorKind::Cancelled, message)
    }

    pub fn is_cancellation(&self) -> bool {
        self.kind == ErrorKind::Cancelled
    }
}
