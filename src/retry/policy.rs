//! Exponential backoff policy
//!
//! `delay_for(n)` is the pause after the n-th failed attempt:
//! `min(initial_delay * multiplier^(n-1), max_delay)`, plus optional jitter
//! (still capped at `max_delay`).

use rand::Rng;
use std::time::Duration;

use crate::errors::ConfigError;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    max_attempts: u32,
    initial_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    jitter: f64,
}

impl RetryPolicy {
    pub fn new(
        max_attempts: u32,
        initial_delay: Duration,
        max_delay: Duration,
        multiplier: f64,
    ) -> Result<Self, ConfigError> {
        if max_attempts == 0 {
            return Err(ConfigError::invalid("max_attempts", "must be at least 1"));
        }
        if initial_delay.is_zero() {
            return Err(ConfigError::invalid("initial_delay_ms", "must be greater than zero"));
        }
        if max_delay < initial_delay {
            return Err(ConfigError::invalid(
                "max_delay_ms",
                format!("{:?} is shorter than initial delay {:?}", max_delay, initial_delay),
            ));
        }
        if !multiplier.is_finite() || multiplier < 1.0 {
            return Err(ConfigError::invalid(
                "multiplier",
                format!("must be >= 1.0, got {}", multiplier),
            ));
        }
        Ok(Self {
            max_attempts,
            initial_delay,
            max_delay,
            multiplier,
            jitter: 0.0,
        })
    }

    /// Single attempt, never retried
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(1),
            multiplier: 1.0,
            jitter: 0.0,
        }
    }

    /// Add up to `fraction` of each delay as random extra wait
    pub fn with_jitter(mut self, fraction: f64) -> Result<Self, ConfigError> {
        if !(0.0..=1.0).contains(&fraction) {
            return Err(ConfigError::invalid(
                "jitter",
                format!("must be within 0.0..=1.0, got {}", fraction),
            ));
        }
        self.jitter = fraction;
        Ok(self)
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Result<Self, ConfigError> {
        if max_attempts == 0 {
            return Err(ConfigError::invalid("max_attempts", "must be at least 1"));
        }
        self.max_attempts = max_attempts;
        Ok(self)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn initial_delay(&self) -> Duration {
        self.initial_delay
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    pub fn multiplier(&self) -> f64 {
        self.multiplier
    }

    /// Whether more than one attempt may run
    pub fn allows_retries(&self) -> bool {
        self.max_attempts > 1
    }

    /// Backoff after failed attempt `attempt` (1-based), without jitter
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        // powi overflows to +inf for long runs; min() folds that into max_delay
        let capped = secs.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped)
    }

    /// Backoff including jitter
    pub fn jittered_delay_for(&self, attempt: u32) -> Duration {
        let delay = self.delay_for(attempt);
        if self.jitter <= 0.0 {
            return delay;
        }
        let extra = delay.as_secs_f64() * self.jitter * rand::thread_rng().gen::<f64>();
        (delay + Duration::from_secs_f64(extra)).min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    /// 3 attempts, 500ms doubling up to 10s
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: 0.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    #[test]
    fn test_delay_sequence() {
        let policy = RetryPolicy::new(5, ms(500), Duration::from_secs(10), 2.0).unwrap();
        let delays: Vec<_> = (1..=5).map(|n| policy.delay_for(n)).collect();
        assert_eq!(delays, vec![ms(500), ms(1000), ms(2000), ms(4000), ms(8000)]);
    }

    #[test]
    fn test_delay_is_capped() {
        let policy = RetryPolicy::new(10, ms(500), Duration::from_secs(10), 2.0).unwrap();
        assert_eq!(policy.delay_for(6), Duration::from_secs(10));
        assert_eq!(policy.delay_for(u32::MAX), Duration::from_secs(10));
    }

    #[test]
    fn test_constant_backoff() {
        let policy = RetryPolicy::new(4, ms(250), ms(250), 1.0).unwrap();
        assert!((1..=4).all(|n| policy.delay_for(n) == ms(250)));
    }

    #[test]
    fn test_invalid_policies() {
        assert!(RetryPolicy::new(0, ms(500), ms(1000), 2.0).is_err());
        assert!(RetryPolicy::new(3, Duration::ZERO, ms(1000), 2.0).is_err());
        assert!(RetryPolicy::new(3, ms(500), ms(100), 2.0).is_err());
        assert!(RetryPolicy::new(3, ms(500), ms(1000), 0.9).is_err());
        assert!(RetryPolicy::default().with_jitter(1.5).is_err());
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let policy = RetryPolicy::new(5, ms(1000), ms(3000), 2.0)
            .unwrap()
            .with_jitter(0.5)
            .unwrap();
        for _ in 0..100 {
            let first = policy.jittered_delay_for(1);
            assert!(first >= ms(1000) && first <= ms(1500));
            // Already at the cap, jitter cannot push past it
            assert_eq!(policy.jittered_delay_for(3), ms(3000));
        }
    }
}
