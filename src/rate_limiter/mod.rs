//! Per-service rate limiting
//!
//! One `TokenBucket` per `ServiceId`, created together when the registry is
//! built and kept for its whole lifetime. The map itself is never mutated
//! after construction; each bucket synchronizes internally.

pub mod bucket;

pub use bucket::{RateLimit, TokenBucket};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::config::EngineConfig;
use crate::context::{CallContext, CancelReason};
use crate::errors::ConfigError;
use crate::logger::{self, LogTag};
use crate::services::ServiceId;

pub struct RateLimiters {
    buckets: HashMap<ServiceId, Arc<TokenBucket>>,
}

impl RateLimiters {
    /// Build one bucket per service from `limit_for`
    pub fn new(mut limit_for: impl FnMut(ServiceId) -> RateLimit) -> Self {
        let buckets = ServiceId::ALL
            .iter()
            .map(|&service| {
                let bucket = TokenBucket::new(service.as_str(), limit_for(service));
                (service, Arc::new(bucket))
            })
            .collect();
        Self { buckets }
    }

    pub fn from_config(config: &EngineConfig) -> Result<Self, ConfigError> {
        let mut limits = HashMap::new();
        for service in ServiceId::ALL {
            let settings = config.service(service);
            limits.insert(
                service,
                RateLimit::new(settings.rate_per_second, settings.burst)?,
            );
        }
        Ok(Self::new(|service| limits[&service]))
    }

    pub fn get(&self, service: ServiceId) -> &Arc<TokenBucket> {
        // Every ServiceId is inserted in `new`
        &self.buckets[&service]
    }

    /// Block until `service`'s bucket grants a token or `ctx` fires
    pub async fn wait(&self, ctx: &CallContext, service: ServiceId) -> Result<Duration, CancelReason> {
        self.get(service).wait(ctx).await
    }

    /// Administrative reconfiguration of one service's limit
    pub fn reconfigure(&self, service: ServiceId, limit: RateLimit) {
        logger::info(
            LogTag::RateLimit,
            &format!(
                "Reconfiguring {} limiter: {:.3} req/s, burst {}",
                service, limit.rate_per_second, limit.burst
            ),
        );
        self.get(service).reconfigure(limit);
    }
}

impl std::fmt::Debug for RateLimiters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map()
            .entries(self.buckets.iter().map(|(service, bucket)| (service.as_str(), bucket)))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;

    #[tokio::test(start_paused = true)]
    async fn test_services_are_independent() {
        let limiters = RateLimiters::new(|_| RateLimit::new(1.0, 1).unwrap());
        let ctx = CallContext::new();
        let started = Instant::now();

        // Draining geocode does not slow routing down
        limiters.wait(&ctx, ServiceId::Geocode).await.unwrap();
        limiters.wait(&ctx, ServiceId::Routing).await.unwrap();
        limiters.wait(&ctx, ServiceId::MapFeatures).await.unwrap();
        assert_eq!(started.elapsed(), Duration::ZERO);

        limiters.wait(&ctx, ServiceId::Geocode).await.unwrap();
        assert_eq!(started.elapsed(), Duration::from_secs(1));
    }

    #[test]
    fn test_from_config_uses_service_settings() {
        let config = EngineConfig::default();
        let limiters = RateLimiters::from_config(&config).unwrap();
        for service in ServiceId::ALL {
            let expected = config.service(service);
            let limit = limiters.get(service).limit();
            assert_eq!(limit.rate_per_second, expected.rate_per_second);
            assert_eq!(limit.burst, expected.burst);
        }
    }

    #[test]
    fn test_reconfigure_targets_one_service() {
        let limiters = RateLimiters::new(|_| RateLimit::new(1.0, 1).unwrap());
        limiters.reconfigure(ServiceId::Routing, RateLimit::new(5.0, 5).unwrap());

        assert_eq!(limiters.get(ServiceId::Routing).limit().burst, 5);
        assert_eq!(limiters.get(ServiceId::Geocode).limit().burst, 1);
    }
}
