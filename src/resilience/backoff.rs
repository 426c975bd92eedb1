//! Exponential backoff with jitter.

use crate::config::RetryPolicy;
use crate::error::Error;
use rand::Rng;
use std::time::Duration;

/// Delay before retry number `attempt` (0-based) of `error` under `policy`.
///
/// `base * multiplier^attempt`, capped at `max_delay`, plus up to `jitter`
/// of that value at random. A rate-limit hint from the store is honored as a
/// lower bound.
pub fn retry_delay(policy: &RetryPolicy, attempt: u32, jitter: f64, error: &Error) -> Duration {
    let mut delay = policy.delay_for(attempt);

    if jitter > 0.0 && !delay.is_zero() {
        let extra = rand::rng().random_range(0.0..=jitter);
        delay += delay.mul_f64(extra);
    }

    if let Error::RateLimit {
        retry_after: Some(hint),
    } = error
    {
        delay = delay.max(*hint);
    }

    delay
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy::new(4, Duration::from_millis(100), 2.0, Duration::from_secs(1))
    }

    #[test]
    fn test_without_jitter_is_exact() {
        let err = Error::Network("reset".into());
        assert_eq!(retry_delay(&policy(), 0, 0.0, &err), Duration::from_millis(100));
        assert_eq!(retry_delay(&policy(), 2, 0.0, &err), Duration::from_millis(400));
        assert_eq!(retry_delay(&policy(), 10, 0.0, &err), Duration::from_secs(1));
    }

    #[test]
    fn test_jitter_stays_in_bounds() {
        let err = Error::Network("reset".into());
        for _ in 0..100 {
            let delay = retry_delay(&policy(), 1, 0.25, &err);
            assert!(delay >= Duration::from_millis(200));
            assert!(delay <= Duration::from_millis(250));
        }
    }

    #[test]
    fn test_rate_limit_hint_is_lower_bound() {
        let err = Error::RateLimit {
            retry_after: Some(Duration::from_secs(3)),
        };
        assert_eq!(retry_delay(&policy(), 0, 0.0, &err), Duration::from_secs(3));
    }
}
