//! HTTP plumbing for service adapters
//!
//! Adapters own request shapes; this module only turns HTTP outcomes into
//! tagged `AttemptError`s and provides a JSON GET that rebuilds its request
//! on every attempt.

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use std::time::Duration;
use url::Url;

use crate::engine::RepeatableOperation;
use crate::errors::{AttemptError, ErrorKind};
use crate::logger::{self, LogTag};

// ============================================================================
// CLIENT CONFIGURATION
// ============================================================================

/// Request timeout for geodata services
pub const TIMEOUT_SECS: u64 = 15;

/// Error bodies are truncated to this many characters in messages
const MAX_ERROR_BODY_CHARS: usize = 200;

const USER_AGENT: &str = concat!("geocall/", env!("CARGO_PKG_VERSION"));

/// Shared client with a request timeout and identifying user agent
pub fn build_client(timeout: Duration) -> Result<Client, reqwest::Error> {
    Client::builder()
        .timeout(timeout)
        .user_agent(USER_AGENT)
        .build()
}

// ============================================================================
// CLASSIFICATION
// ============================================================================

/// Map an HTTP status to an attempt failure; `None` for 2xx
pub fn classify_status(status: StatusCode) -> Option<AttemptError> {
    if status.is_success() {
        return None;
    }

    let kind = match status {
        StatusCode::TOO_MANY_REQUESTS => ErrorKind::RateLimited,
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => ErrorKind::Timeout,
        StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE => ErrorKind::Unavailable,
        StatusCode::NOT_FOUND => ErrorKind::NotFound,
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ErrorKind::Unauthorized,
        s if s.is_server_error() => ErrorKind::Server,
        s if s.is_client_error() => ErrorKind::InvalidRequest,
        // 1xx/3xx that reqwest did not resolve
        _ => ErrorKind::Other,
    };

    Some(AttemptError::new(kind, format!("HTTP {}", status)))
}

/// Map a reqwest transport failure to an attempt failure
pub fn classify_transport(error: &reqwest::Error) -> AttemptError {
    if error.is_timeout() {
        return AttemptError::new(ErrorKind::Timeout, error.to_string());
    }
    if error.is_connect() {
        return AttemptError::new(ErrorKind::Unavailable, error.to_string());
    }
    if error.is_decode() {
        return AttemptError::new(ErrorKind::Decode, error.to_string());
    }
    if error.is_builder() || error.is_redirect() {
        return AttemptError::new(ErrorKind::InvalidRequest, error.to_string());
    }
    if let Some(status) = error.status() {
        if let Some(classified) = classify_status(status) {
            return classified;
        }
    }
    AttemptError::new(ErrorKind::Transport, error.to_string())
}

fn truncate_body(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.chars().count() <= MAX_ERROR_BODY_CHARS {
        trimmed.to_string()
    } else {
        let head: String = trimmed.chars().take(MAX_ERROR_BODY_CHARS).collect();
        format!("{}...", head)
    }
}

// ============================================================================
// JSON GET OPERATION
// ============================================================================

/// GET returning decoded JSON; the request is built fresh per attempt
#[derive(Debug, Clone)]
pub struct JsonGetOperation {
    client: Client,
    url: Url,
    query: Vec<(String, String)>,
    headers: Vec<(String, String)>,
}

impl JsonGetOperation {
    pub fn new(client: Client, url: Url) -> Self {
        Self {
            client,
            url,
            query: Vec::new(),
            headers: Vec::new(),
        }
    }

    /// `base` joined with `path` (relative to the base's last segment)
    pub fn endpoint(client: Client, base: &str, path: &str) -> Result<Self, url::ParseError> {
        let url = Url::parse(base)?.join(path)?;
        Ok(Self::new(client, url))
    }

    pub fn query(mut self, name: &str, value: impl ToString) -> Self {
        self.query.push((name.to_string(), value.to_string()));
        self
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    fn request(&self) -> RequestBuilder {
        let mut request = self.client.get(self.url.clone());
        if !self.query.is_empty() {
            request = request.query(&self.query);
        }
        for (name, value) in &self.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        request
    }
}

#[async_trait]
impl RepeatableOperation for JsonGetOperation {
    type Output = serde_json::Value;

    async fn attempt(&self, _attempt: u32) -> Result<serde_json::Value, AttemptError> {
        let response = self
            .request()
            .send()
            .await
            .map_err(|e| classify_transport(&e))?;

        let status = response.status();
        if let Some(mut error) = classify_status(status) {
            let body = response.text().await.unwrap_or_default();
            if !body.trim().is_empty() {
                error.message = format!("{}: {}", error.message, truncate_body(&body));
            }
            logger::debug(
                LogTag::Api,
                &format!("GET {} -> {} ({})", self.url.path(), status, error.kind),
            );
            return Err(error);
        }

        response
            .json::<serde_json::Value>()
            .await
            .map_err(|e| AttemptError::new(ErrorKind::Decode, format!("invalid JSON from {}: {}", self.url, e)))
    }
}
