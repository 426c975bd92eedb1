//! Metrics for monitoring the vote engine.
//!
//! Counters for vote traffic, cache effectiveness and resilience events, plus
//! gauges for live resources. [`VoteMetrics::to_prometheus`] renders them in
//! the Prometheus text exposition format.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                       VoteMetrics                        │
//! │  ┌──────────────┐  ┌──────────────┐  ┌───────────────┐  │
//! │  │    votes     │  │    cache     │  │  resilience   │  │
//! │  │ - submitted  │  │ - hits       │  │ - retries     │  │
//! │  │ - committed  │  │ - misses     │  │ - breaker     │  │
//! │  │ - superseded │  │              │  │ - errors/kind │  │
//! │  └──────────────┘  └──────────────┘  └───────────────┘  │
//! └──────────────────────────────────────────────────────────┘
//! ```

mod instruments;

pub use instruments::{Counter, Gauge, LabeledCounter};

use crate::error::ErrorKind;

/// Engine-wide metrics, shared by every component through an `Arc`.
#[derive(Debug)]
pub struct VoteMetrics {
    // Vote traffic
    pub votes_submitted: Counter,
    pub votes_committed: Counter,
    /// Transactions that found the same vote already recorded.
    pub votes_unchanged: Counter,
    pub votes_failed: Counter,
    pub votes_retracted: Counter,

    // Debouncing
    pub debounce_superseded: Counter,
    pub debounce_cancelled: Counter,
    pub debounce_pending: Gauge,

    // Cache
    pub cache_hits: Counter,
    pub cache_misses: Counter,

    // Store access
    pub store_reads: Counter,
    pub store_transactions: Counter,

    // Resilience
    pub retries: Counter,
    pub breaker_opened: Counter,
    pub breaker_rejections: Counter,

    // Subscriptions
    pub subscriptions_opened: Counter,
    pub subscriptions_closed: Counter,
    pub subscriptions_active: Gauge,

    /// Errors by kind.
    pub errors: LabeledCounter,
}

impl VoteMetrics {
    pub fn new() -> Self {
        Self {
            votes_submitted: Counter::new("votes_submitted_total", "Vote writes attempted"),
            votes_committed: Counter::new("votes_committed_total", "Vote writes that changed state"),
            votes_unchanged: Counter::new("votes_unchanged_total", "Idempotent vote writes"),
            votes_failed: Counter::new("votes_failed_total", "Vote writes that failed"),
            votes_retracted: Counter::new("votes_retracted_total", "Votes retracted"),

            debounce_superseded: Counter::new(
                "debounce_superseded_total",
                "Pending votes replaced by a newer vote",
            ),
            debounce_cancelled: Counter::new(
                "debounce_cancelled_total",
                "Pending votes cancelled by teardown",
            ),
            debounce_pending: Gauge::new("debounce_pending", "Votes waiting for the debounce window"),

            cache_hits: Counter::new("cache_hits_total", "Aggregate cache hits"),
            cache_misses: Counter::new("cache_misses_total", "Aggregate cache misses"),

            store_reads: Counter::new("store_reads_total", "Point reads sent to the store"),
            store_transactions: Counter::new("store_transactions_total", "Transactions sent to the store"),

            retries: Counter::new("store_retries_total", "Store calls retried after a failure"),
            breaker_opened: Counter::new("breaker_opened_total", "Times the circuit breaker opened"),
            breaker_rejections: Counter::new(
                "breaker_rejections_total",
                "Calls rejected while the breaker was open",
            ),

            subscriptions_opened: Counter::new(
                "subscriptions_opened_total",
                "Underlying push subscriptions opened",
            ),
            subscriptions_closed: Counter::new(
                "subscriptions_closed_total",
                "Underlying push subscriptions torn down",
            ),
            subscriptions_active: Gauge::new("subscriptions_active", "Open push subscriptions"),

            errors: LabeledCounter::new("vote_errors_total", "Errors by kind", "kind"),
        }
    }

    /// Record an error by its classification.
    pub fn record_error(&self, kind: ErrorKind) {
        self.errors.inc(kind.as_str());
    }

    /// Get a snapshot of current metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            votes_submitted: self.votes_submitted.get(),
            votes_committed: self.votes_committed.get(),
            votes_unchanged: self.votes_unchanged.get(),
            votes_failed: self.votes_failed.get(),
            debounce_superseded: self.debounce_superseded.get(),
            cache_hits: self.cache_hits.get(),
            cache_misses: self.cache_misses.get(),
            store_reads: self.store_reads.get(),
            store_transactions: self.store_transactions.get(),
            retries: self.retries.get(),
            breaker_opened: self.breaker_opened.get(),
            breaker_rejections: self.breaker_rejections.get(),
            subscriptions_active: self.subscriptions_active.get(),
        }
    }

    /// Format metrics in Prometheus exposition format.
    pub fn to_prometheus(&self) -> String {
        let mut output = String::new();

        macro_rules! add_metric {
            ($kind:literal, $metric:expr) => {
                output.push_str(&format!(
                    "# HELP {name} {help}\n# TYPE {name} {kind}\n{name} {value}\n",
                    name = $metric.name(),
                    help = $metric.help(),
                    kind = $kind,
                    value = $metric.get()
                ));
            };
        }

        add_metric!("counter", self.votes_submitted);
        add_metric!("counter", self.votes_committed);
        add_metric!("counter", self.votes_unchanged);
        add_metric!("counter", self.votes_failed);
        add_metric!("counter", self.votes_retracted);
        add_metric!("counter", self.debounce_superseded);
        add_metric!("counter", self.debounce_cancelled);
        add_metric!("gauge", self.debounce_pending);
        add_metric!("counter", self.cache_hits);
        add_metric!("counter", self.cache_misses);
        add_metric!("counter", self.store_reads);
        add_metric!("counter", self.store_transactions);
        add_metric!("counter", self.retries);
        add_metric!("counter", self.breaker_opened);
        add_metric!("counter", self.breaker_rejections);
        add_metric!("counter", self.subscriptions_opened);
        add_metric!("counter", self.subscriptions_closed);
        add_metric!("gauge", self.subscriptions_active);

        output.push_str(&format!(
            "# HELP {name} {help}\n# TYPE {name} counter\n",
            name = self.errors.name(),
            help = self.errors.help()
        ));
        for (value, count) in self.errors.get_all() {
            output.push_str(&format!(
                "{}{{{}=\"{}\"}} {}\n",
                self.errors.name(),
                self.errors.label(),
                value,
                count
            ));
        }

        output
    }
}

impl Default for VoteMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of the most useful metrics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub votes_submitted: u64,
    pub votes_committed: u64,
    pub votes_unchanged: u64,
    pub votes_failed: u64,
    pub debounce_superseded: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub store_reads: u64,
    pub store_transactions: u64,
    pub retries: u64,
    pub breaker_opened: u64,
    pub breaker_rejections: u64,
    pub subscriptions_active: i64,
}

impl MetricsSnapshot {
    /// Cache hit rate (0.0 - 1.0).
    pub fn cache_hit_rate(&self) -> f64 {
        let total = self.cache_hits + self.cache_misses;
        if total == 0 {
            0.0
        } else {
            self.cache_hits as f64 / total as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_rate() {
        let metrics = VoteMetrics::new();
        metrics.cache_hits.inc_by(3);
        metrics.cache_misses.inc();
        let snapshot = metrics.snapshot();
        assert!((snapshot.cache_hit_rate() - 0.75).abs() < f64::EPSILON);
    }

    #[test]
    fn test_prometheus_output() {
        let metrics = VoteMetrics::new();
        metrics.votes_submitted.inc();
        metrics.record_error(ErrorKind::Network);

        let output = metrics.to_prometheus();
        assert!(output.contains("votes_submitted_total 1"));
        assert!(output.contains("# TYPE subscriptions_active gauge"));
        assert!(output.contains("vote_errors_total{kind=\"network\"} 1"));
    }
}
