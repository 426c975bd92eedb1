//! Resilience layer for backing-store calls.
//!
//! Every store access of the engine goes through [`ResilienceLayer::call`],
//! which composes:
//! - a [`CircuitBreaker`] that fails fast while the store is unhealthy
//! - a classified retry policy with exponential backoff and jitter
//! - a per-attempt timeout
//!
//! ```text
//!   call(op) ──► breaker permit? ──no──► ServiceUnavailable (not retried)
//!                     │yes
//!                     ▼
//!              op() with timeout ──ok──► record success ──► Ok
//!                     │err
//!                     ▼
//!              classify(err) ──non-retryable / ceiling reached──► Err
//!                     │retryable
//!                     ▼
//!              sleep(backoff) ──► next attempt
//! ```

mod backoff;
mod circuit_breaker;

pub use backoff::retry_delay;
pub use circuit_breaker::{BreakerPermit, CircuitBreaker, CircuitState};

use crate::config::{CircuitBreakerConfig, RetryConfig};
use crate::error::{Error, ErrorKind, Result};
use crate::metrics::VoteMetrics;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Circuit breaker plus retry policy around store calls.
#[derive(Debug)]
pub struct ResilienceLayer {
    breaker: CircuitBreaker,
    retry: RetryConfig,
    metrics: Arc<VoteMetrics>,
}

impl ResilienceLayer {
    pub fn new(
        breaker: CircuitBreakerConfig,
        retry: RetryConfig,
        metrics: Arc<VoteMetrics>,
    ) -> Self {
        Self {
            breaker: CircuitBreaker::new(breaker, metrics.clone()),
            retry,
            metrics,
        }
    }

    /// The underlying circuit breaker.
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Current breaker state.
    pub fn state(&self) -> CircuitState {
        self.breaker.state()
    }

    /// Run `op` against the store with breaker protection and retries.
    ///
    /// `op` is invoked once per attempt. The returned error is the last
    /// attempt's error, or [`Error::ServiceUnavailable`] when the breaker
    /// refused the call.
    pub async fn call<T, F, Fut>(&self, operation: &'static str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt: u32 = 0;

        loop {
            let permit = match self.breaker.try_acquire() {
                Ok(permit) => permit,
                Err(err) => {
                    debug!(operation, attempt, "Store call rejected by open circuit breaker");
                    self.metrics.record_error(err.kind());
                    return Err(err);
                }
            };

            let result = match tokio::time::timeout(self.retry.attempt_timeout, op()).await {
                Ok(result) => result,
                Err(_) => Err(Error::Timeout(self.retry.attempt_timeout)),
            };

            let err = match result {
                Ok(value) => {
                    permit.succeed();
                    return Ok(value);
                }
                Err(err) => err,
            };

            let kind = err.kind();
            if kind.trips_breaker() {
                permit.fail();
            } else {
                // The store answered; the failure is the caller's.
                permit.succeed();
            }
            self.metrics.record_error(kind);

            if kind == ErrorKind::Unknown {
                error!(operation, attempt, error = %err, ?err, "Unclassified store error");
            }

            let Some(policy) = self.retry.policy_for(kind) else {
                debug!(operation, kind = %kind, error = %err, "Non-retryable store error");
                return Err(err);
            };

            if attempt + 1 >= policy.max_attempts {
                warn!(
                    operation,
                    attempts = attempt + 1,
                    kind = %kind,
                    error = %err,
                    "Store call failed, retries exhausted"
                );
                return Err(err);
            }

            let delay = retry_delay(policy, attempt, self.retry.jitter, &err);
            debug!(
                operation,
                attempt,
                kind = %kind,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Retrying store call"
            );
            self.metrics.retries.inc();
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryPolicy;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn layer(threshold: u32, retry: RetryConfig) -> ResilienceLayer {
        ResilienceLayer::new(
            CircuitBreakerConfig::new(threshold, Duration::from_secs(30)),
            retry,
            Arc::new(VoteMetrics::new()),
        )
    }

    fn standard(attempts: u32) -> RetryConfig {
        RetryConfig::disabled().with_standard_policy(RetryPolicy::new(
            attempts,
            Duration::from_millis(100),
            2.0,
            Duration::from_secs(1),
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_error_is_retried() {
        let layer = layer(10, standard(3));
        let calls = &AtomicU32::new(0);

        let result = layer
            .call("test", || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(Error::Network("reset".into()))
                } else {
                    Ok(7)
                }
            })
            .await;

        assert_eq!(result, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(layer.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_error_is_not_retried() {
        let layer = layer(10, standard(5));
        let calls = &AtomicU32::new(0);

        let result: Result<()> = layer
            .call("test", || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Error::Permission("rules".into()))
            })
            .await;

        assert_eq!(result, Err(Error::Permission("rules".into())));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(layer.breaker().consecutive_failures(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ceiling_per_kind() {
        let mut retry = standard(4);
        retry.rate_limit = RetryPolicy::new(2, Duration::from_secs(1), 2.0, Duration::from_secs(5));
        let layer = layer(100, retry);
        let calls = &AtomicU32::new(0);

        let result: Result<()> = layer
            .call("test", || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Error::RateLimit { retry_after: None })
            })
            .await;

        assert!(matches!(result, Err(Error::RateLimit { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_breaker_opens_and_fails_fast() {
        let layer = layer(3, RetryConfig::disabled());
        let calls = &AtomicU32::new(0);
        let failing = || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(Error::Network("down".into()))
        };

        for _ in 0..3 {
            assert!(matches!(
                layer.call("test", failing).await,
                Err(Error::Network(_))
            ));
        }
        assert_eq!(layer.state(), CircuitState::Open);

        let result = layer.call("test", failing).await;
        assert!(matches!(result, Err(Error::ServiceUnavailable { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3, "store must not be called while open");
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_success_closes() {
        let layer = layer(1, RetryConfig::disabled());

        let _ = layer
            .call("test", || async { Err::<(), _>(Error::Network("down".into())) })
            .await;
        assert_eq!(layer.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(30)).await;
        let result = layer.call("test", || async { Ok("fresh") }).await;
        assert_eq!(result, Ok("fresh"));
        assert_eq!(layer.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_stop_when_breaker_opens() {
        let layer = layer(2, standard(5));
        let calls = &AtomicU32::new(0);

        let result: Result<()> = layer
            .call("test", || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Error::Network("down".into()))
            })
            .await;

        assert!(matches!(result, Err(Error::ServiceUnavailable { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_timeout() {
        let mut retry = RetryConfig::disabled();
        retry.attempt_timeout = Duration::from_millis(50);
        let layer = layer(10, retry);

        let result: Result<()> = layer
            .call("test", || async {
                tokio::time::sleep(Duration::from_secs(1)).await;
                Ok(())
            })
            .await;

        assert_eq!(result, Err(Error::Timeout(Duration::from_millis(50))));
    }
}
