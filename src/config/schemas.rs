/// Configuration schemas - all config structures defined once with defaults
///
/// Each struct is defined using the config_struct! macro which provides:
/// - Single-source definition (no repetition)
/// - Embedded defaults
/// - Serde support
use crate::cache::CacheConfig;
use crate::config_struct;
use crate::errors::ConfigError;
use crate::retry::RetryPolicy;
use crate::services::ServiceId;
use serde::{Deserialize, Deserializer};
use std::time::Duration;

// ============================================================================
// CACHE CONFIGURATION
// ============================================================================

config_struct! {
    /// Process-wide result cache
    pub struct CacheSettings {
        /// Maximum number of cached results across all services
        capacity: usize = 10_000,

        /// TTL used when a call does not specify one
        default_ttl_secs: u64 = 3600,

        /// Interval of the background expired-entry sweep (0 disables it)
        cleanup_interval_secs: u64 = 300,
    }
}

// ============================================================================
// RETRY CONFIGURATION
// ============================================================================

config_struct! {
    /// Exponential backoff settings
    pub struct RetrySettings {
        max_attempts: u32 = 3,
        initial_delay_ms: u64 = 500,
        max_delay_ms: u64 = 10_000,
        multiplier: f64 = 2.0,

        /// Random extra delay as a fraction of the computed delay (0.0 - 1.0)
        jitter: f64 = 0.0,
    }
}

// ============================================================================
// SERVICE CONFIGURATION
// ============================================================================

config_struct! {
    /// Limits and caching for one external service
    pub struct ServiceSettings {
        rate_per_second: f64 = 1.0,
        burst: u32 = 1,

        /// TTL for successful results of this service
        cache_ttl_secs: u64 = 3600,

        /// Deduplicate concurrent identical calls
        coalesce: bool = true,

        retry: RetrySettings = RetrySettings::default(),
    }
}

// ============================================================================
// ROOT CONFIGURATION
// ============================================================================

config_struct! {
    /// Root configuration of the call engine
    pub struct EngineConfig {
        cache: CacheSettings = CacheSettings::default(),

        /// Address geocoder (public geocoders allow ~1 req/s)
        #[serde(deserialize_with = "geocode_overrides")]
        geocode: ServiceSettings = ServiceSettings::geocode(),

        /// Map feature query service
        #[serde(deserialize_with = "map_features_overrides")]
        map_features: ServiceSettings = ServiceSettings::map_features(),

        /// Route computation service
        #[serde(deserialize_with = "routing_overrides")]
        routing: ServiceSettings = ServiceSettings::routing(),
    }
}

// ============================================================================
// SERVICE OVERRIDES
// ============================================================================

/// Fields present in a `[<service>]` table; absent ones keep the service preset
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ServiceOverrides {
    rate_per_second: Option<f64>,
    burst: Option<u32>,
    cache_ttl_secs: Option<u64>,
    coalesce: Option<bool>,
    retry: Option<RetryOverrides>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RetryOverrides {
    max_attempts: Option<u32>,
    initial_delay_ms: Option<u64>,
    max_delay_ms: Option<u64>,
    multiplier: Option<f64>,
    jitter: Option<f64>,
}

impl ServiceOverrides {
    fn apply(self, mut settings: ServiceSettings) -> ServiceSettings {
        if let Some(rate) = self.rate_per_second {
            settings.rate_per_second = rate;
        }
        if let Some(burst) = self.burst {
            settings.burst = burst;
        }
        if let Some(ttl) = self.cache_ttl_secs {
            settings.cache_ttl_secs = ttl;
        }
        if let Some(coalesce) = self.coalesce {
            settings.coalesce = coalesce;
        }
        if let Some(retry) = self.retry {
            settings.retry = retry.apply(settings.retry);
        }
        settings
    }
}

impl RetryOverrides {
    fn apply(self, mut retry: RetrySettings) -> RetrySettings {
        if let Some(max_attempts) = self.max_attempts {
            retry.max_attempts = max_attempts;
        }
        if let Some(initial) = self.initial_delay_ms {
            retry.initial_delay_ms = initial;
        }
        if let Some(max) = self.max_delay_ms {
            retry.max_delay_ms = max;
        }
        if let Some(multiplier) = self.multiplier {
            retry.multiplier = multiplier;
        }
        if let Some(jitter) = self.jitter {
            retry.jitter = jitter;
        }
        retry
    }
}

fn geocode_overrides<'de, D: Deserializer<'de>>(deserializer: D) -> Result<ServiceSettings, D::Error> {
    Ok(ServiceOverrides::deserialize(deserializer)?.apply(ServiceSettings::geocode()))
}

fn map_features_overrides<'de, D: Deserializer<'de>>(deserializer: D) -> Result<ServiceSettings, D::Error> {
    Ok(ServiceOverrides::deserialize(deserializer)?.apply(ServiceSettings::map_features()))
}

fn routing_overrides<'de, D: Deserializer<'de>>(deserializer: D) -> Result<ServiceSettings, D::Error> {
    Ok(ServiceOverrides::deserialize(deserializer)?.apply(ServiceSettings::routing()))
}

// ============================================================================
// IMPLEMENTATIONS
// ============================================================================

impl ServiceSettings {
    pub fn geocode() -> Self {
        Self {
            rate_per_second: 1.0,
            burst: 1,
            cache_ttl_secs: 24 * 3600,
            ..Self::default()
        }
    }

    pub fn map_features() -> Self {
        Self {
            rate_per_second: 2.0,
            burst: 2,
            cache_ttl_secs: 3600,
            ..Self::default()
        }
    }

    pub fn routing() -> Self {
        Self {
            rate_per_second: 5.0,
            burst: 5,
            cache_ttl_secs: 3600,
            ..Self::default()
        }
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    fn validate(&self, service: ServiceId) -> Result<(), ConfigError> {
        if !self.rate_per_second.is_finite() || self.rate_per_second <= 0.0 {
            return Err(ConfigError::invalid(
                format!("{}.rate_per_second", service),
                "must be a positive number",
            ));
        }
        if self.burst == 0 {
            return Err(ConfigError::invalid(format!("{}.burst", service), "must be at least 1"));
        }
        self.retry
            .to_policy()
            .map_err(|e| match e {
                ConfigError::Invalid { field, reason } => {
                    ConfigError::invalid(format!("{}.retry.{}", service, field), reason)
                }
                other => other,
            })?;
        Ok(())
    }
}

impl RetrySettings {
    pub fn to_policy(&self) -> Result<RetryPolicy, ConfigError> {
        RetryPolicy::new(
            self.max_attempts,
            Duration::from_millis(self.initial_delay_ms),
            Duration::from_millis(self.max_delay_ms),
            self.multiplier,
        )?
        .with_jitter(self.jitter)
    }
}

impl CacheSettings {
    pub fn to_cache_config(&self) -> CacheConfig {
        CacheConfig {
            capacity: self.capacity,
            default_ttl: Duration::from_secs(self.default_ttl_secs),
        }
    }

    pub fn cleanup_interval(&self) -> Option<Duration> {
        (self.cleanup_interval_secs > 0).then(|| Duration::from_secs(self.cleanup_interval_secs))
    }
}

impl EngineConfig {
    pub fn service(&self, service: ServiceId) -> &ServiceSettings {
        match service {
            ServiceId::Geocode => &self.geocode,
            ServiceId::MapFeatures => &self.map_features,
            ServiceId::Routing => &self.routing,
        }
    }

    pub fn service_mut(&mut self, service: ServiceId) -> &mut ServiceSettings {
        match service {
            ServiceId::Geocode => &mut self.geocode,
            ServiceId::MapFeatures => &mut self.map_features,
            ServiceId::Routing => &mut self.routing,
        }
    }

    /// Validate the whole configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cache.capacity == 0 {
            return Err(ConfigError::invalid("cache.capacity", "must be at least 1"));
        }
        for service in ServiceId::ALL {
            self.service(service).validate(service)?;
        }
        Ok(())
    }
}
