//! Circuit breaker guarding the backing store.
//!
//! States:
//! - Closed: calls flow; consecutive failures are counted
//! - Open: calls fail fast until `reset_timeout` elapses
//! - HalfOpen: exactly one trial call is let through

use crate::config::CircuitBreakerConfig;
use crate::error::{Error, Result};
use crate::metrics::VoteMetrics;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

/// Circuit breaker shared by every store call of an engine.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
    metrics: Arc<VoteMetrics>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig, metrics: Arc<VoteMetrics>) -> Self {
        Self {
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                trial_in_flight: false,
            }),
            metrics,
        }
    }

    /// Current state, advancing Open to HalfOpen if the reset timeout passed.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock();
        self.maybe_half_open(&mut inner);
        inner.state
    }

    /// Consecutive failures recorded while closed.
    pub fn consecutive_failures(&self) -> u32 {
        self.inner.lock().consecutive_failures
    }

    /// Ask permission to call the store.
    ///
    /// Fails fast with [`Error::ServiceUnavailable`] while open, or while
    /// half-open with the trial call already in flight.
    pub fn try_acquire(&self) -> Result<BreakerPermit<'_>> {
        let mut inner = self.inner.lock();
        self.maybe_half_open(&mut inner);

        match inner.state {
            CircuitState::Closed => Ok(BreakerPermit {
                breaker: self,
                trial: false,
                settled: false,
            }),
            CircuitState::HalfOpen if !inner.trial_in_flight => {
                inner.trial_in_flight = true;
                debug!("Circuit breaker half-open, admitting trial call");
                Ok(BreakerPermit {
                    breaker: self,
                    trial: true,
                    settled: false,
                })
            }
            CircuitState::HalfOpen => {
                self.metrics.breaker_rejections.inc();
                Err(Error::ServiceUnavailable {
                    retry_in: Duration::ZERO,
                })
            }
            CircuitState::Open => {
                self.metrics.breaker_rejections.inc();
                let elapsed = inner.opened_at.map(|t| t.elapsed()).unwrap_or_default();
                Err(Error::ServiceUnavailable {
                    retry_in: self.config.reset_timeout.saturating_sub(elapsed),
                })
            }
        }
    }

    fn maybe_half_open(&self, inner: &mut BreakerInner) {
        if inner.state != CircuitState::Open {
            return;
        }
        let elapsed = inner.opened_at.map(|t| t.elapsed()).unwrap_or_default();
        if elapsed >= self.config.reset_timeout {
            inner.state = CircuitState::HalfOpen;
            inner.trial_in_flight = false;
            info!(
                open_for_ms = elapsed.as_millis() as u64,
                "Circuit breaker entering half-open state"
            );
        }
    }

    fn on_success(&self, trial: bool) {
        let mut inner = self.inner.lock();
        if trial {
            inner.trial_in_flight = false;
        }

        match inner.state {
            CircuitState::Closed => inner.consecutive_failures = 0,
            CircuitState::HalfOpen if trial => {
                info!("Circuit breaker closed after successful trial call");
                inner.state = CircuitState::Closed;
                inner.consecutive_failures = 0;
                inner.opened_at = None;
            }
            // A call admitted before the breaker opened; only the trial call
            // may close it.
            CircuitState::HalfOpen | CircuitState::Open => {
                debug!(state = %inner.state, "Ignoring late success of a call admitted while closed");
            }
        }
    }

    fn on_failure(&self, trial: bool) {
        let mut inner = self.inner.lock();
        if trial {
            inner.trial_in_flight = false;
        }

        match inner.state {
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
                self.metrics.breaker_opened.inc();
                warn!("Circuit breaker reopened after failed trial call");
            }
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(Instant::now());
                    self.metrics.breaker_opened.inc();
                    warn!(
                        failures = inner.consecutive_failures,
                        reset_timeout_ms = self.config.reset_timeout.as_millis() as u64,
                        "Circuit breaker opened"
                    );
                } else {
                    debug!(
                        failures = inner.consecutive_failures,
                        threshold = self.config.failure_threshold,
                        "Store call failed"
                    );
                }
            }
            // A call admitted before the breaker opened; keep the original open time.
            CircuitState::Open => {}
        }
    }

    fn on_abandoned(&self, trial: bool) {
        if trial {
            self.inner.lock().trial_in_flight = false;
        }
    }
}

/// Permission for one store call.
///
/// Settle it with [`succeed`](Self::succeed) or [`fail`](Self::fail). A permit
/// dropped unsettled (the call was cancelled) frees the trial slot without
/// changing state.
#[must_use = "a permit must be settled with succeed() or fail()"]
#[derive(Debug)]
pub struct BreakerPermit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    settled: bool,
}

impl BreakerPermit<'_> {
    /// Whether this permit is the half-open trial call.
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn succeed(mut self) {
        self.settled = true;
        self.breaker.on_success(self.trial);
    }

    pub fn fail(mut self) {
        self.settled = true;
        self.breaker.on_failure(self.trial);
    }
}

impl Drop for BreakerPermit<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.on_abandoned(self.trial);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, reset: Duration) -> CircuitBreaker {
        CircuitBreaker::new(
            CircuitBreakerConfig::new(threshold, reset),
            Arc::new(VoteMetrics::new()),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_threshold() {
        let cb = breaker(3, Duration::from_secs(10));

        for _ in 0..2 {
            cb.try_acquire().unwrap().fail();
            assert_eq!(cb.state(), CircuitState::Closed);
        }
        cb.try_acquire().unwrap().fail();
        assert_eq!(cb.state(), CircuitState::Open);

        let err = cb.try_acquire().unwrap_err();
        assert!(matches!(err, Error::ServiceUnavailable { .. }));
        assert!(!err.is_retryable());
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_failure_count() {
        let cb = breaker(3, Duration::from_secs(10));

        cb.try_acquire().unwrap().fail();
        cb.try_acquire().unwrap().fail();
        cb.try_acquire().unwrap().succeed();
        assert_eq!(cb.consecutive_failures(), 0);

        cb.try_acquire().unwrap().fail();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_admits_single_trial() {
        let cb = breaker(1, Duration::from_secs(5));
        cb.try_acquire().unwrap().fail();
        assert_eq!(cb.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        let trial = cb.try_acquire().unwrap();
        assert!(trial.is_trial());
        assert!(cb.try_acquire().is_err(), "second call must wait for the trial");

        trial.succeed();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.try_acquire().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_trial_reopens() {
        let cb = breaker(1, Duration::from_secs(5));
        cb.try_acquire().unwrap().fail();

        tokio::time::advance(Duration::from_secs(5)).await;
        cb.try_acquire().unwrap().fail();
        assert_eq!(cb.state(), CircuitState::Open);

        match cb.try_acquire() {
            Err(Error::ServiceUnavailable { retry_in }) => {
                assert_eq!(retry_in, Duration::from_secs(5))
            }
            other => panic!("expected ServiceUnavailable, got {other:?}"),
        };
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_trial_frees_slot() {
        let cb = breaker(1, Duration::from_secs(1));
        cb.try_acquire().unwrap().fail();
        tokio::time::advance(Duration::from_secs(1)).await;

        drop(cb.try_acquire().unwrap());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(cb.try_acquire().unwrap().is_trial());
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_success_does_not_close_open_breaker() {
        let cb = breaker(1, Duration::from_secs(5));
        let slow = cb.try_acquire().unwrap();
        cb.try_acquire().unwrap().fail();
        assert_eq!(cb.state(), CircuitState::Open);

        slow.succeed();
        assert_eq!(cb.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(5)).await;
        let trial = cb.try_acquire().unwrap();
        let late = BreakerPermit {
            breaker: &cb,
            trial: false,
            settled: false,
        };
        late.succeed();
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        trial.succeed();
        assert_eq!(cb.state(), CircuitState::Closed);
    }
}
