/// Deterministic cache keys
///
/// Two logically identical requests must map to the same key, so keys are
/// built from a canonical form: normalized text, coordinates rounded to a
/// fixed precision, parameters sorted by name. Every key is prefixed with the
/// service name and the form it was derived from (`text`, `params`, or their
/// `-sha256` digests), so free text never collides with a parameter set and
/// identical parameters never collide across services. Parameter names and
/// values are form-urlencoded, so separators inside a value stay inside it.
use crate::services::ServiceId;
use sha2::{Digest, Sha256};
use std::fmt;
use url::form_urlencoded;

/// Canonical forms longer than this are replaced by their SHA-256 digest
pub const MAX_PLAIN_KEY_LEN: usize = 128;

/// Decimal places kept for coordinates (~0.11 m at the equator)
pub const COORD_PRECISION: usize = 6;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    /// Opaque key supplied verbatim by an adapter
    ///
    /// Adapters must not mimic the derived `<service>:text:` / `<service>:params:` forms.
    pub fn raw(key: impl Into<String>) -> Self {
        CacheKey(key.into())
    }

    /// Key for a free-text query (address, place name)
    ///
    /// Case, surrounding whitespace and runs of internal whitespace are ignored.
    pub fn from_text(service: ServiceId, text: &str) -> Self {
        Self::finish(service, KeyForm::Text, normalize_text(text))
    }

    pub fn builder(service: ServiceId) -> CacheKeyBuilder {
        CacheKeyBuilder {
            service,
            params: Vec::new(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn finish(service: ServiceId, form: KeyForm, canonical: String) -> Self {
        if canonical.len() <= MAX_PLAIN_KEY_LEN {
            return CacheKey(format!("{}:{}:{}", service.as_str(), form.tag(), canonical));
        }
        let digest = Sha256::digest(canonical.as_bytes());
        CacheKey(format!("{}:{}-sha256:{:x}", service.as_str(), form.tag(), digest))
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CacheKey {
    fn from(key: &str) -> Self {
        CacheKey::raw(key)
    }
}

#[derive(Debug, Clone, Copy)]
enum KeyForm {
    Text,
    Params,
}

impl KeyForm {
    fn tag(self) -> &'static str {
        match self {
            KeyForm::Text => "text",
            KeyForm::Params => "params",
        }
    }
}

/// Collects named request parameters into a canonical key
#[derive(Debug, Clone)]
pub struct CacheKeyBuilder {
    service: ServiceId,
    params: Vec<(String, String)>,
}

impl CacheKeyBuilder {
    pub fn text(mut self, name: &str, value: &str) -> Self {
        self.params.push((name.to_string(), normalize_text(value)));
        self
    }

    pub fn number(mut self, name: &str, value: f64) -> Self {
        self.params.push((name.to_string(), format_number(value)));
        self
    }

    pub fn integer(mut self, name: &str, value: i64) -> Self {
        self.params.push((name.to_string(), value.to_string()));
        self
    }

    pub fn coord(mut self, name: &str, lat: f64, lon: f64) -> Self {
        let value = format!("{},{}", format_coord(lat), format_coord(lon));
        self.params.push((name.to_string(), value));
        self
    }

    pub fn flag(mut self, name: &str, value: bool) -> Self {
        self.params.push((name.to_string(), value.to_string()));
        self
    }

    pub fn build(mut self) -> CacheKey {
        // Stable sort keeps repeated names in insertion order
        self.params.sort_by(|a, b| a.0.cmp(&b.0));
        let canonical = form_urlencoded::Serializer::new(String::new())
            .extend_pairs(self.params.iter())
            .finish();
        CacheKey::finish(self.service, KeyForm::Params, canonical)
    }
}

fn normalize_text(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

fn format_coord(value: f64) -> String {
    let rounded = format!("{:.*}", COORD_PRECISION, value);
    // -0.000000 and 0.000000 must agree
    if rounded.trim_start_matches('-').chars().all(|c| c == '0' || c == '.') {
        return format!("{:.*}", COORD_PRECISION, 0.0);
    }
    rounded
}

fn format_number(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{}", value)
    }
}
