//! Configuration types for the vote synchronization engine.

use crate::error::{Error, ErrorKind, Result};
use std::time::Duration;

/// Main configuration for the engine.
#[derive(Debug, Clone, Default)]
pub struct VoteSyncConfig {
    /// Aggregate cache configuration.
    pub cache: CacheConfig,

    /// Vote debouncing configuration.
    pub debounce: DebounceConfig,

    /// Subscription pool configuration.
    pub subscriptions: SubscriptionConfig,

    /// Circuit breaker configuration.
    pub breaker: CircuitBreakerConfig,

    /// Retry policy configuration.
    pub retry: RetryConfig,
}

impl VoteSyncConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set cache configuration.
    pub fn with_cache_config(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }

    /// Set the debounce window.
    pub fn with_debounce_window(mut self, window: Duration) -> Self {
        self.debounce.window = window;
        self
    }

    /// Set subscription pool configuration.
    pub fn with_subscription_config(mut self, subscriptions: SubscriptionConfig) -> Self {
        self.subscriptions = subscriptions;
        self
    }

    /// Set circuit breaker configuration.
    pub fn with_breaker_config(mut self, breaker: CircuitBreakerConfig) -> Self {
        self.breaker = breaker;
        self
    }

    /// Set retry configuration.
    pub fn with_retry_config(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Check that the configuration is usable.
    pub fn validate(&self) -> Result<()> {
        if self.cache.aggregate_ttl.is_zero() || self.cache.identity_vote_ttl.is_zero() {
            return Err(Error::Config("cache TTLs must be non-zero".to_string()));
        }
        if self.cache.max_capacity == 0 {
            return Err(Error::Config("cache max_capacity must be non-zero".to_string()));
        }
        if self.cache.sweep_interval.is_zero() || self.subscriptions.sweep_interval.is_zero() {
            return Err(Error::Config("sweep intervals must be non-zero".to_string()));
        }
        if self.debounce.window.is_zero() {
            return Err(Error::Config("debounce window must be non-zero".to_string()));
        }
        if self.subscriptions.idle_timeout < self.subscriptions.grace_period {
            return Err(Error::Config(
                "subscription idle_timeout must not be shorter than grace_period".to_string(),
            ));
        }
        if self.breaker.failure_threshold == 0 {
            return Err(Error::Config("breaker failure_threshold must be >= 1".to_string()));
        }
        for (name, policy) in self.retry.policies() {
            if policy.max_attempts == 0 {
                return Err(Error::Config(format!(
                    "retry policy {name}: max_attempts must be >= 1"
                )));
            }
            if policy.multiplier < 1.0 {
                return Err(Error::Config(format!(
                    "retry policy {name}: multiplier must be >= 1.0"
                )));
            }
        }
        if !(0.0..=1.0).contains(&self.retry.jitter) {
            return Err(Error::Config("retry jitter must be within [0, 1]".to_string()));
        }
        Ok(())
    }
}

/// Aggregate cache configuration.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Time-to-live for aggregate count entries.
    pub aggregate_ttl: Duration,

    /// Time-to-live for per-identity vote entries.
    pub identity_vote_ttl: Duration,

    /// Maximum number of entries per map.
    pub max_capacity: u64,

    /// Interval of the background expiry sweep.
    pub sweep_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            aggregate_ttl: Duration::from_secs(30),
            identity_vote_ttl: Duration::from_secs(5 * 60),
            max_capacity: 100_000,
            sweep_interval: Duration::from_secs(60),
        }
    }
}

impl CacheConfig {
    /// Set the aggregate TTL.
    pub fn with_aggregate_ttl(mut self, ttl: Duration) -> Self {
        self.aggregate_ttl = ttl;
        self
    }

    /// Set the identity vote TTL.
    pub fn with_identity_vote_ttl(mut self, ttl: Duration) -> Self {
        self.identity_vote_ttl = ttl;
        self
    }

    /// Set the maximum number of entries per map.
    pub fn with_max_capacity(mut self, capacity: u64) -> Self {
        self.max_capacity = capacity;
        self
    }
}

/// Vote debouncing configuration.
#[derive(Debug, Clone)]
pub struct DebounceConfig {
    /// Quiet period after the last vote before it is written.
    pub window: Duration,
}

impl Default for DebounceConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_millis(500),
        }
    }
}

/// Subscription pool configuration.
#[derive(Debug, Clone)]
pub struct SubscriptionConfig {
    /// Delay between the last release and teardown of a subscription.
    pub grace_period: Duration,

    /// Unreferenced entries older than this are reclaimed by the sweep.
    pub idle_timeout: Duration,

    /// Interval of the background idle sweep.
    pub sweep_interval: Duration,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(5 * 60),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

impl SubscriptionConfig {
    /// Set the grace period.
    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace_period = grace;
        self
    }

    /// Set the idle timeout.
    pub fn with_idle_timeout(mut self, idle: Duration) -> Self {
        self.idle_timeout = idle;
        self
    }
}

/// Circuit breaker configuration.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the breaker.
    pub failure_threshold: u32,

    /// How long the breaker stays open before allowing a trial call.
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            reset_timeout: Duration::from_secs(30),
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a new circuit breaker configuration.
    pub fn new(failure_threshold: u32, reset_timeout: Duration) -> Self {
        Self {
            failure_threshold,
            reset_timeout,
        }
    }
}

/// Backoff parameters for one class of retryable error.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,

    /// Delay before the first retry.
    pub base_delay: Duration,

    /// Growth factor per attempt.
    pub multiplier: f64,

    /// Upper bound of a single delay (before jitter).
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Create a new retry policy.
    pub const fn new(
        max_attempts: u32,
        base_delay: Duration,
        multiplier: f64,
        max_delay: Duration,
    ) -> Self {
        Self {
            max_attempts,
            base_delay,
            multiplier,
            max_delay,
        }
    }

    /// A policy that never retries.
    pub const fn no_retry() -> Self {
        Self::new(1, Duration::ZERO, 1.0, Duration::ZERO)
    }

    /// Delay before retry number `attempt` (0-based), without jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt as i32);
        let millis = (self.base_delay.as_millis() as f64 * factor)
            .min(self.max_delay.as_millis() as f64);
        Duration::from_millis(millis as u64)
    }
}

/// Retry configuration: one policy per retryable error kind.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Network errors, timeouts and transaction conflicts.
    pub standard: RetryPolicy,

    /// Throttling: longer waits, fewer attempts.
    pub rate_limit: RetryPolicy,

    /// Unclassified errors: retried conservatively.
    pub unknown: RetryPolicy,

    /// Fraction of each delay added as random jitter (0.0 - 1.0).
    pub jitter: f64,

    /// Deadline for a single attempt.
    pub attempt_timeout: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            standard: RetryPolicy::new(
                3,
                Duration::from_millis(200),
                2.0,
                Duration::from_secs(5),
            ),
            rate_limit: RetryPolicy::new(
                2,
                Duration::from_secs(2),
                3.0,
                Duration::from_secs(30),
            ),
            unknown: RetryPolicy::new(
                2,
                Duration::from_millis(500),
                2.0,
                Duration::from_secs(5),
            ),
            jitter: 0.1,
            attempt_timeout: Duration::from_secs(10),
        }
    }
}

impl RetryConfig {
    /// A configuration that never retries (useful for tests).
    pub fn disabled() -> Self {
        Self {
            standard: RetryPolicy::no_retry(),
            rate_limit: RetryPolicy::no_retry(),
            unknown: RetryPolicy::no_retry(),
            jitter: 0.0,
            ..Default::default()
        }
    }

    /// Set the jitter fraction.
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    /// Set the standard policy.
    pub fn with_standard_policy(mut self, policy: RetryPolicy) -> Self {
        self.standard = policy;
        self
    }

    /// Policy for an error kind, or `None` if the kind is never retried.
    pub fn policy_for(&self, kind: ErrorKind) -> Option<&RetryPolicy> {
        match kind {
            ErrorKind::Network | ErrorKind::Conflict | ErrorKind::Timeout => Some(&self.standard),
            ErrorKind::RateLimit => Some(&self.rate_limit),
            ErrorKind::Unknown => Some(&self.unknown),
            _ => None,
        }
    }

    fn policies(&self) -> [(&'static str, &RetryPolicy); 3] {
        [
            ("standard", &self.standard),
            ("rate_limit", &self.rate_limit),
            ("unknown", &self.unknown),
        ]
    }
}
