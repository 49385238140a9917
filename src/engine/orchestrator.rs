/// Call orchestrator
///
/// Per logical call: cache check, coalescing, then (leader only) a retry loop
/// where every attempt first takes a token from the service's limiter. A
/// success is written to the cache with the request's TTL before it is handed
/// to followers; failures are never cached.
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::observer::{CallOutcome, CallSource, EngineObserver};
use super::operation::RepeatableOperation;
use crate::cache::{CacheKey, TtlLruCache};
use crate::coalesce::{CoalesceError, CoalescingGroup, Role};
use crate::config::{EngineConfig, ServiceSettings};
use crate::context::CallContext;
use crate::errors::{AttemptError, ConfigError, EngineError};
use crate::rate_limiter::RateLimiters;
use crate::retry::{run_with_retry, RetryError, RetryPolicy};
use crate::services::ServiceId;

// ============================================================================
// REQUEST TYPES
// ============================================================================

/// Per-service defaults applied by `CallEngine::request`
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceProfile {
    pub ttl: Duration,
    pub policy: RetryPolicy,
    /// Share one upstream call between concurrent identical requests
    pub coalesce: bool,
}

impl ServiceProfile {
    pub fn from_settings(settings: &ServiceSettings) -> Result<Self, ConfigError> {
        Ok(Self {
            ttl: settings.cache_ttl(),
            policy: settings.retry.to_policy()?,
            coalesce: settings.coalesce,
        })
    }
}

impl Default for ServiceProfile {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(3600),
            policy: RetryPolicy::default(),
            coalesce: true,
        }
    }
}

/// Everything the engine needs to know about one logical call
#[derive(Debug, Clone, PartialEq)]
pub struct CallRequest {
    pub service: ServiceId,
    pub key: CacheKey,
    pub ttl: Duration,
    pub policy: RetryPolicy,
}

impl CallRequest {
    pub fn new(service: ServiceId, key: CacheKey, ttl: Duration, policy: RetryPolicy) -> Self {
        Self {
            service,
            key,
            ttl,
            policy,
        }
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }
}

/// Successful result plus how it was obtained
#[derive(Debug, Clone)]
struct Delivery<V> {
    value: V,
    source: CallSource,
    attempts: u32,
}

type FlightKey = (ServiceId, CacheKey);
type FlightResult<V> = Result<Delivery<V>, EngineError>;

// ============================================================================
// ENGINE
// ============================================================================

pub struct CallEngine<V>
where
    V: Clone + Send + Sync + 'static,
{
    cache: Arc<TtlLruCache<CacheKey, V>>,
    limiters: Arc<RateLimiters>,
    group: CoalescingGroup<FlightKey, FlightResult<V>>,
    profiles: HashMap<ServiceId, ServiceProfile>,
    observers: Vec<Arc<dyn EngineObserver>>,
    cleanup_interval: Option<Duration>,
}

impl<V> CallEngine<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Engine over explicitly constructed cache and limiters
    ///
    /// Every service starts with `ServiceProfile::default()` using the
    /// cache's default TTL.
    pub fn new(cache: Arc<TtlLruCache<CacheKey, V>>, limiters: Arc<RateLimiters>) -> Self {
        let profiles = ServiceId::ALL
            .iter()
            .map(|&service| {
                let profile = ServiceProfile {
                    ttl: cache.default_ttl(),
                    ..ServiceProfile::default()
                };
                (service, profile)
            })
            .collect();

        Self {
            cache,
            limiters,
            group: CoalescingGroup::new(),
            profiles,
            observers: Vec::new(),
            cleanup_interval: None,
        }
    }

    pub fn from_config(config: &EngineConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        let cache = Arc::new(TtlLruCache::new(config.cache.to_cache_config()));
        let limiters = Arc::new(RateLimiters::from_config(config)?);
        let mut engine = Self::new(cache, limiters);
        for service in ServiceId::ALL {
            engine
                .profiles
                .insert(service, ServiceProfile::from_settings(config.service(service))?);
        }
        engine.cleanup_interval = config.cache.cleanup_interval();
        Ok(engine)
    }

    pub fn with_observer(mut self, observer: Arc<dyn EngineObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn with_profile(mut self, service: ServiceId, profile: ServiceProfile) -> Self {
        self.profiles.insert(service, profile);
        self
    }

    pub fn profile(&self, service: ServiceId) -> &ServiceProfile {
        // Every ServiceId is inserted in `new`
        &self.profiles[&service]
    }

    pub fn cache(&self) -> &Arc<TtlLruCache<CacheKey, V>> {
        &self.cache
    }

    pub fn limiters(&self) -> &Arc<RateLimiters> {
        &self.limiters
    }

    /// Number of keys with an upstream call in flight
    pub fn in_flight(&self) -> usize {
        self.group.in_flight()
    }

    /// Start periodic cache cleanup if the configuration asks for it
    pub fn start_maintenance(&self, shutdown: CancellationToken) -> Option<JoinHandle<()>> {
        self.cleanup_interval
            .map(|interval| self.cache.spawn_cleanup_task(interval, shutdown))
    }

    /// Request prefilled with the service's TTL and retry policy
    pub fn request(&self, service: ServiceId, key: CacheKey) -> CallRequest {
        let profile = self.profile(service);
        CallRequest::new(service, key, profile.ttl, profile.policy.clone())
    }

    /// `execute` with the service's default TTL and policy
    pub async fn call<O>(&self, ctx: &CallContext, service: ServiceId, key: CacheKey, op: &O) -> Result<V, EngineError>
    where
        O: RepeatableOperation<Output = V> + ?Sized,
    {
        self.execute(ctx, self.request(service, key), op).await
    }

    /// Run one logical call
    ///
    /// Returns a cached value, a fresh value (now cached), or exactly one
    /// `EngineError`.
    pub async fn execute<O>(&self, ctx: &CallContext, request: CallRequest, op: &O) -> Result<V, EngineError>
    where
        O: RepeatableOperation<Output = V> + ?Sized,
    {
        let started = Instant::now();
        let CallRequest {
            service,
            key,
            ttl,
            policy,
        } = request;

        if let Some(value) = self.cache.get(&key) {
            self.notify(|o| o.on_cache_hit(service, &key));
            let outcome = CallOutcome::Served {
                source: CallSource::Cache,
                attempts: 0,
            };
            self.notify(|o| o.on_outcome(service, &key, outcome, started.elapsed()));
            return Ok(value);
        }
        self.notify(|o| o.on_cache_miss(service, &key));

        let result = if !op.replayable() && policy.allows_retries() {
            Err(EngineError::NonReplayablePayload {
                service,
                key: key.clone(),
                max_attempts: policy.max_attempts(),
            })
        } else if self.profile(service).coalesce {
            self.run_coalesced(ctx, service, &key, ttl, &policy, op).await
        } else {
            self.run_leader(ctx, service, &key, ttl, &policy, op).await
        };

        let elapsed = started.elapsed();
        match &result {
            Ok(delivery) => {
                if delivery.source == CallSource::Coalesced {
                    self.notify(|o| o.on_coalesced(service, &key));
                }
                let outcome = CallOutcome::Served {
                    source: delivery.source,
                    attempts: delivery.attempts,
                };
                self.notify(|o| o.on_outcome(service, &key, outcome, elapsed));
            }
            Err(error) => self.notify(|o| o.on_outcome(service, &key, CallOutcome::Failed(error), elapsed)),
        }

        result.map(|delivery| delivery.value)
    }

    async fn run_coalesced<O>(
        &self,
        ctx: &CallContext,
        service: ServiceId,
        key: &CacheKey,
        ttl: Duration,
        policy: &RetryPolicy,
        op: &O,
    ) -> FlightResult<V>
    where
        O: RepeatableOperation<Output = V> + ?Sized,
    {
        let joined = self
            .group
            .run((service, key.clone()), ctx, || {
                self.run_leader(ctx, service, key, ttl, policy, op)
            })
            .await;

        match joined {
            Ok((result, Role::Leader { .. })) => result,
            Ok((result, Role::Follower)) => result.map(|delivery| Delivery {
                source: CallSource::Coalesced,
                attempts: 0,
                ..delivery
            }),
            Err(CoalesceError::Cancelled(reason)) => Err(EngineError::Cancelled {
                service,
                key: key.clone(),
                reason,
                stage: "coalesce",
                attempts: 0,
            }),
            Err(CoalesceError::LeaderPanicked(message)) => Err(EngineError::LeaderFailed {
                service,
                key: key.clone(),
                reason: format!("panicked: {}", message),
            }),
            Err(CoalesceError::LeaderAbandoned) => Err(EngineError::LeaderFailed {
                service,
                key: key.clone(),
                reason: "dropped before delivering a result".to_string(),
            }),
        }
    }

    async fn run_leader<O>(
        &self,
        ctx: &CallContext,
        service: ServiceId,
        key: &CacheKey,
        ttl: Duration,
        policy: &RetryPolicy,
        op: &O,
    ) -> FlightResult<V>
    where
        O: RepeatableOperation<Output = V> + ?Sized,
    {
        // A previous leader may have filled the entry after our miss
        if let Some(value) = self.cache.peek(key) {
            return Ok(Delivery {
                value,
                source: CallSource::Cache,
                attempts: 0,
            });
        }

        let made = AtomicU32::new(0);
        let outcome = run_with_retry(
            ctx,
            policy,
            |attempt| {
                made.store(attempt, Ordering::Relaxed);
                self.run_attempt(ctx, service, key, attempt, op)
            },
            |attempt, delay, error| self.notify(|o| o.on_backoff(service, key, attempt, delay, error)),
        )
        .await;

        match outcome {
            Ok(value) => {
                self.cache.set(key.clone(), value.clone(), ttl);
                Ok(Delivery {
                    value,
                    source: CallSource::Upstream,
                    attempts: made.load(Ordering::Relaxed),
                })
            }
            Err(RetryError::Cancelled {
                reason,
                stage,
                attempts,
            }) => Err(EngineError::Cancelled {
                service,
                key: key.clone(),
                reason,
                stage,
                attempts,
            }),
            Err(RetryError::NonRetryable { attempt, error }) => Err(EngineError::NonRetryable {
                service,
                key: key.clone(),
                attempt,
                source: error,
            }),
            Err(RetryError::Exhausted { attempts, last }) => Err(EngineError::Exhausted {
                service,
                key: key.clone(),
                attempts,
                source: last,
            }),
        }
    }

    /// Token, then one upstream attempt
    async fn run_attempt<O>(
        &self,
        ctx: &CallContext,
        service: ServiceId,
        key: &CacheKey,
        attempt: u32,
        op: &O,
    ) -> Result<V, AttemptError>
    where
        O: RepeatableOperation<Output = V> + ?Sized,
    {
        let waited = self
            .limiters
            .wait(ctx, service)
            .await
            .map_err(|reason| AttemptError::cancelled(format!("{} while waiting for a {} token", reason, service)))?;
        self.notify(|o| o.on_rate_limit_wait(service, key, attempt, waited));

        self.notify(|o| o.on_attempt_start(service, key, attempt));
        let started = Instant::now();
        let result = op.attempt(attempt).await;
        let elapsed = started.elapsed();
        self.notify(|o| o.on_attempt_end(service, key, attempt, result.as_ref().map(|_| ()), elapsed));

        result
    }

    fn notify(&self, event: impl Fn(&dyn EngineObserver)) {
        for observer in &self.observers {
            event(observer.as_ref());
        }
    }
}

impl<V> std::fmt::Debug for CallEngine<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallEngine")
            .field("cached", &self.cache.len())
            .field("in_flight", &self.group.in_flight())
            .field("limiters", &self.limiters)
            .field("observers", &self.observers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheConfig;
    use crate::engine::operation::{OneShot, RequestFactory};
    use crate::engine::StatsObserver;
    use crate::errors::ErrorKind;
    use crate::rate_limiter::RateLimit;
    use futures::future::join_all;

    fn engine() -> CallEngine<String> {
        let cache = Arc::new(TtlLruCache::new(CacheConfig::custom(3600, 100)));
        let limiters = Arc::new(RateLimiters::new(|_| RateLimit::new(100.0, 100).unwrap()));
        CallEngine::new(cache, limiters)
    }

    fn counting_op(counter: &Arc<AtomicU32>, value: &'static str) -> impl RepeatableOperation<Output = String> {
        let counter = Arc::clone(counter);
        RequestFactory::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok::<_, AttemptError>(value.to_string())
            }
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_is_cached_with_request_ttl() {
        let engine = engine();
        let calls = Arc::new(AtomicU32::new(0));
        let op = counting_op(&calls, "1.2868,103.8545");
        let key = CacheKey::from_text(ServiceId::Geocode, "Merlion Park");
        let request = engine
            .request(ServiceId::Geocode, key.clone())
            .ttl(Duration::from_secs(60));
        let ctx = CallContext::new();

        assert_eq!(engine.execute(&ctx, request.clone(), &op).await.unwrap(), "1.2868,103.8545");
        assert_eq!(engine.execute(&ctx, request.clone(), &op).await.unwrap(), "1.2868,103.8545");
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(!engine.cache().contains(&key));
        engine.execute(&ctx, request, &op).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_are_not_cached() {
        let engine = engine();
        let op = RequestFactory::new(|_| async { Err::<String, _>(AttemptError::new(ErrorKind::NotFound, "HTTP 404")) });
        let key = CacheKey::raw("geocode:nowhere");

        let error = engine
            .call(&CallContext::new(), ServiceId::Geocode, key.clone(), &op)
            .await
            .unwrap_err();

        assert!(matches!(error, EngineError::NonRetryable { attempt: 1, .. }));
        assert_eq!(error.service(), ServiceId::Geocode);
        assert!(engine.cache().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_shot_rejected_when_retries_allowed() {
        let engine = engine();
        let op = OneShot::new(|| async { Ok::<_, AttemptError>("sent".to_string()) });
        let key = CacheKey::raw("routing:upload");

        let error = engine
            .call(&CallContext::new(), ServiceId::Routing, key.clone(), &op)
            .await
            .unwrap_err();

        assert_eq!(
            error,
            EngineError::NonReplayablePayload {
                service: ServiceId::Routing,
                key: key.clone(),
                max_attempts: 3,
            }
        );
        assert!(!op.is_consumed());

        // Allowed with a single attempt
        let request = engine
            .request(ServiceId::Routing, key)
            .policy(RetryPolicy::no_retry());
        assert_eq!(engine.execute(&CallContext::new(), request, &op).await.unwrap(), "sent");
        assert!(op.is_consumed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cached_answer_served_even_for_one_shot() {
        let engine = engine();
        let key = CacheKey::raw("routing:cached");
        engine.cache().set(key.clone(), "12km".to_string(), Duration::from_secs(60));
        let op = OneShot::new(|| async { Ok::<_, AttemptError>("fresh".to_string()) });

        let value = engine
            .call(&CallContext::new(), ServiceId::Routing, key, &op)
            .await
            .unwrap();

        assert_eq!(value, "12km");
        assert!(!op.is_consumed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_identical_calls_share_one_attempt() {
        let stats = Arc::new(StatsObserver::new());
        let engine = engine().with_observer(stats.clone());
        let calls = Arc::new(AtomicU32::new(0));
        let op = counting_op(&calls, "route");
        let ctx = CallContext::new();
        let (engine_ref, op_ref, ctx_ref) = (&engine, &op, &ctx);

        let results = join_all((0..5).map(move |_| {
            engine_ref.call(ctx_ref, ServiceId::Routing, CacheKey::raw("routing:a-b"), op_ref)
        }))
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(results.iter().all(|r| r.as_deref() == Ok("route")));
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.calls, 5);
        assert_eq!(snapshot.coalesced, 4);
        assert_eq!(snapshot.upstream_attempts, 1);
        assert_eq!(engine.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_coalescing_can_be_disabled_per_service() {
        let profile = ServiceProfile {
            coalesce: false,
            ..ServiceProfile::default()
        };
        let engine = engine().with_profile(ServiceId::MapFeatures, profile);
        let calls = Arc::new(AtomicU32::new(0));
        let op = counting_op(&calls, "cafes");
        let ctx = CallContext::new();
        let (engine_ref, op_ref, ctx_ref) = (&engine, &op, &ctx);

        join_all((0..3).map(move |_| {
            engine_ref.call(ctx_ref, ServiceId::MapFeatures, CacheKey::raw("map_features:cafes"), op_ref)
        }))
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_leader_panic_becomes_leader_failed() {
        let engine = engine();
        let op = RequestFactory::new(|_| async {
            if true {
                panic!("adapter bug");
            }
            Ok::<String, AttemptError>(String::new())
        });
        let ctx = CallContext::new();
        let (engine_ref, op_ref, ctx_ref) = (&engine, &op, &ctx);

        let results = join_all((0..2).map(move |_| {
            engine_ref.call(ctx_ref, ServiceId::Geocode, CacheKey::raw("geocode:boom"), op_ref)
        }))
        .await;

        for result in results {
            match result {
                Err(EngineError::LeaderFailed { reason, .. }) => assert!(reason.contains("adapter bug")),
                other => panic!("unexpected result: {:?}", other),
            }
        }
        assert_eq!(engine.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_take_their_own_tokens() {
        let cache = Arc::new(TtlLruCache::new(CacheConfig::custom(3600, 100)));
        let limiters = Arc::new(RateLimiters::new(|_| RateLimit::new(1.0, 1).unwrap()));
        let engine: CallEngine<String> = CallEngine::new(cache, limiters);
        let op = RequestFactory::new(|attempt| async move {
            if attempt < 3 {
                Err(AttemptError::new(ErrorKind::Unavailable, "HTTP 503"))
            } else {
                Ok("ok".to_string())
            }
        });
        let policy = RetryPolicy::new(3, Duration::from_millis(100), Duration::from_secs(1), 1.0).unwrap();
        let request = engine
            .request(ServiceId::Geocode, CacheKey::raw("geocode:throttled"))
            .policy(policy);
        let started = Instant::now();

        engine.execute(&CallContext::new(), request, &op).await.unwrap();

        // Backoff is shorter than the refill interval, so each retry waits on the bucket
        assert_eq!(engine.limiters().get(ServiceId::Geocode).granted(), 3);
        assert!(started.elapsed() >= Duration::from_secs(2));
    }

    #[test]
    fn test_from_config_applies_service_settings() {
        let mut config = EngineConfig::default();
        config.map_features.coalesce = false;
        config.routing.retry.max_attempts = 5;

        let engine: CallEngine<String> = CallEngine::from_config(&config).unwrap();

        assert_eq!(engine.profile(ServiceId::Geocode).ttl, Duration::from_secs(24 * 3600));
        assert!(!engine.profile(ServiceId::MapFeatures).coalesce);
        assert_eq!(engine.profile(ServiceId::Routing).policy.max_attempts(), 5);
        assert_eq!(engine.cache().capacity(), config.cache.capacity);
    }

    #[test]
    fn test_from_config_rejects_invalid_settings() {
        let mut config = EngineConfig::default();
        config.geocode.burst = 0;
        assert!(CallEngine::<String>::from_config(&config).is_err());
    }
}
