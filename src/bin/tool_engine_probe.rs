use anyhow::Context;
use async_trait::async_trait;
use clap::Parser;
use rand::Rng;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use geocall::config::{load_config_from_path, CONFIG_FILE_PATH};
use geocall::engine::{CallEngine, LoggingObserver, RepeatableOperation, StatsObserver};
use geocall::errors::{AttemptError, ErrorKind};
use geocall::logger::{self, LogLevel, LogTag};
use geocall::{CacheKey, CallContext, ServiceId};

/// Drive the call engine against a simulated flaky service.
///
/// Spawns concurrent callers over a small set of queries so cache hits,
/// coalescing, throttling and retries all show up in the final stats.
/// No network access is needed.
#[derive(Parser, Debug)]
#[command(name = "tool_engine_probe", about = "Exercise the call engine against a simulated service")]
struct Args {
    /// Engine configuration file (defaults apply when missing)
    #[arg(long, default_value = CONFIG_FILE_PATH)]
    config: PathBuf,

    /// Service whose limiter and retry settings are used
    #[arg(long, default_value = "geocode")]
    service: ServiceId,

    /// Concurrent callers per round
    #[arg(long, default_value_t = 16)]
    callers: usize,

    /// Distinct queries shared by the callers
    #[arg(long, default_value_t = 4)]
    keys: usize,

    /// Rounds of callers; later rounds mostly hit the cache
    #[arg(long, default_value_t = 2)]
    rounds: usize,

    /// Probability that an attempt answers HTTP 429
    #[arg(long, default_value_t = 0.3)]
    failure_rate: f64,

    /// Simulated upstream latency per attempt
    #[arg(long, default_value_t = 50)]
    latency_ms: u64,

    /// Per-call deadline
    #[arg(long, default_value_t = 30)]
    timeout_secs: u64,

    /// Print the final stats as JSON
    #[arg(long, default_value_t = false)]
    json: bool,

    /// Default log threshold (error, warn, info, debug, verbose); RUST_LOG overrides it
    #[arg(long, default_value = "info")]
    log_level: LogLevel,
}

/// Upstream stand-in shared by every caller
struct SimulatedService {
    failure_rate: f64,
    latency: Duration,
    requests: AtomicU64,
}

struct ProbeLookup {
    upstream: Arc<SimulatedService>,
    query: String,
}

#[async_trait]
impl RepeatableOperation for ProbeLookup {
    type Output = String;

    async fn attempt(&self, attempt: u32) -> Result<String, AttemptError> {
        let request_no = self.upstream.requests.fetch_add(1, Ordering::Relaxed) + 1;
        let throttled = rand::thread_rng().gen_bool(self.upstream.failure_rate);

        tokio::time::sleep(self.upstream.latency).await;

        if throttled {
            return Err(AttemptError::new(
                ErrorKind::RateLimited,
                format!("HTTP 429 for '{}' (request #{})", self.query, request_no),
            ));
        }
        Ok(format!("{} -> result (attempt {}, request #{})", self.query, attempt, request_no))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    logger::init_with_level(args.log_level);

    if !(0.0..=1.0).contains(&args.failure_rate) {
        anyhow::bail!("--failure-rate must be within 0.0..=1.0");
    }

    let config = load_config_from_path(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;

    let stats = Arc::new(StatsObserver::new());
    let engine = Arc::new(
        CallEngine::<String>::from_config(&config)
            .context("building call engine")?
            .with_observer(Arc::new(LoggingObserver))
            .with_observer(stats.clone()),
    );
    let shutdown = CancellationToken::new();
    let maintenance = engine.start_maintenance(shutdown.clone());

    let upstream = Arc::new(SimulatedService {
        failure_rate: args.failure_rate,
        latency: Duration::from_millis(args.latency_ms),
        requests: AtomicU64::new(0),
    });
    let keys = args.keys.max(1);

    logger::info(
        LogTag::Engine,
        &format!(
            "Probing {} with {} callers x {} rounds over {} keys (failure rate {:.2})",
            args.service, args.callers, args.rounds, keys, args.failure_rate
        ),
    );

    for round in 1..=args.rounds {
        let callers: Vec<_> = (0..args.callers)
            .map(|caller| {
                let engine = Arc::clone(&engine);
                let upstream = Arc::clone(&upstream);
                let service = args.service;
                let timeout = Duration::from_secs(args.timeout_secs);
                tokio::spawn(async move {
                    let query = format!("probe query {}", caller % keys);
                    let key = CacheKey::from_text(service, &query);
                    let op = ProbeLookup { upstream, query };
                    let ctx = CallContext::with_timeout(timeout);
                    engine.call(&ctx, service, key, &op).await
                })
            })
            .collect();

        let (mut ok, mut failed) = (0usize, 0usize);
        for caller in callers {
            match caller.await.context("probe caller panicked")? {
                Ok(_) => ok += 1,
                Err(error) => {
                    failed += 1;
                    logger::warning(LogTag::Engine, &format!("Round {} call failed: {}", round, error));
                }
            }
        }
        logger::info(
            LogTag::Engine,
            &format!("Round {}: {} ok, {} failed", round, ok, failed),
        );
    }

    shutdown.cancel();
    if let Some(handle) = maintenance {
        let _ = handle.await;
    }

    let snapshot = stats.snapshot();
    let limiter = engine.limiters().get(args.service);
    if args.json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
    } else {
        println!("engine:   {}", snapshot);
        println!(
            "upstream: {} requests, limiter granted {} tokens, waited {:?} in total",
            upstream.requests.load(Ordering::Relaxed),
            limiter.granted(),
            limiter.total_wait()
        );
        let cache = engine.cache().metrics();
        println!(
            "cache:    {} entries, hit rate {:.1}%, {} evictions",
            engine.cache().len(),
            cache.hit_rate() * 100.0,
            cache.evictions
        );
        println!("saved:    {:.1}% of calls served without their own upstream attempt", snapshot.saved_ratio() * 100.0);
    }

    Ok(())
}
