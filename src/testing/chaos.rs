//! Chaos testing for the backing store.
//!
//! [`ChaosStore`] wraps any [`BackingStore`] and, while enabled, delays calls
//! and fails them with transient errors at configured rates. Failures are
//! injected before the call reaches the inner store, so a failed transaction
//! never commits.

use crate::error::{Error, Result};
use crate::store::{BackingStore, ChangeCallback, ErrorCallback, TransactionBody, Unsubscribe};
use crate::types::{Document, DocumentKey};
use async_trait::async_trait;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Configuration for chaos testing.
#[derive(Debug, Clone)]
pub struct ChaosConfig {
    /// Probability that a call fails (0.0 - 1.0).
    pub failure_probability: f64,

    /// Share of failures reported as transaction conflicts rather than
    /// network errors (0.0 - 1.0).
    pub conflict_share: f64,

    /// Probability that a call is delayed (0.0 - 1.0).
    pub delay_probability: f64,

    /// Minimum call delay.
    pub delay_min: Duration,

    /// Maximum call delay.
    pub delay_max: Duration,

    /// Random seed for reproducibility.
    pub seed: Option<u64>,
}

impl Default for ChaosConfig {
    fn default() -> Self {
        Self {
            failure_probability: 0.0,
            conflict_share: 0.5,
            delay_probability: 0.0,
            delay_min: Duration::from_millis(5),
            delay_max: Duration::from_millis(50),
            seed: None,
        }
    }
}

impl ChaosConfig {
    /// Create a config for light chaos testing.
    pub fn light() -> Self {
        Self {
            failure_probability: 0.02,
            delay_probability: 0.05,
            ..Default::default()
        }
    }

    /// Create a config for moderate chaos testing.
    pub fn moderate() -> Self {
        Self {
            failure_probability: 0.1,
            delay_probability: 0.2,
            ..Default::default()
        }
    }

    /// Create a config for heavy chaos testing.
    pub fn heavy() -> Self {
        Self {
            failure_probability: 0.3,
            delay_probability: 0.5,
            ..Default::default()
        }
    }

    /// Disable all chaos.
    pub fn none() -> Self {
        Self::default()
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }
}

/// Chaos statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChaosStats {
    pub calls: u64,
    pub failures_injected: u64,
    pub delays_injected: u64,
}

enum Disruption {
    Fail(Error),
    Delay(Duration),
    None,
}

/// Store wrapper that injects failures and latency.
pub struct ChaosStore {
    inner: Arc<dyn BackingStore>,
    config: ChaosConfig,
    enabled: AtomicBool,
    rng: Mutex<StdRng>,

    calls: AtomicU64,
    failures_injected: AtomicU64,
    delays_injected: AtomicU64,
}

impl ChaosStore {
    /// Wrap `inner`. Chaos starts disabled.
    pub fn new(inner: Arc<dyn BackingStore>, config: ChaosConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Self {
            inner,
            config,
            enabled: AtomicBool::new(false),
            rng: Mutex::new(rng),
            calls: AtomicU64::new(0),
            failures_injected: AtomicU64::new(0),
            delays_injected: AtomicU64::new(0),
        }
    }

    /// Enable chaos injection.
    pub fn enable(&self) {
        self.enabled.store(true, Ordering::Relaxed);
    }

    /// Disable chaos injection.
    pub fn disable(&self) {
        self.enabled.store(false, Ordering::Relaxed);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> ChaosStats {
        ChaosStats {
            calls: self.calls.load(Ordering::Relaxed),
            failures_injected: self.failures_injected.load(Ordering::Relaxed),
            delays_injected: self.delays_injected.load(Ordering::Relaxed),
        }
    }

    fn roll(&self, key: &str) -> Disruption {
        self.calls.fetch_add(1, Ordering::Relaxed);
        if !self.is_enabled() {
            return Disruption::None;
        }

        let mut rng = self.rng.lock();
        if rng.random::<f64>() < self.config.failure_probability {
            self.failures_injected.fetch_add(1, Ordering::Relaxed);
            let error = if rng.random::<f64>() < self.config.conflict_share {
                Error::Conflict { key: key.to_string() }
            } else {
                Error::Network("chaos: connection reset".to_string())
            };
            return Disruption::Fail(error);
        }
        if rng.random::<f64>() < self.config.delay_probability {
            self.delays_injected.fetch_add(1, Ordering::Relaxed);
            let min = self.config.delay_min.as_millis() as u64;
            let max = self.config.delay_max.as_millis() as u64;
            return Disruption::Delay(Duration::from_millis(rng.random_range(min..=max.max(min))));
        }
        Disruption::None
    }

    async fn disrupt(&self, key: &str) -> Result<()> {
        match self.roll(key) {
            Disruption::Fail(err) => Err(err),
            Disruption::Delay(delay) => {
                tokio::time::sleep(delay).await;
                Ok(())
            }
            Disruption::None => Ok(()),
        }
    }
}

impl std::fmt::Debug for ChaosStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChaosStore")
            .field("inner", &self.inner)
            .field("enabled", &self.is_enabled())
            .field("stats", &self.stats())
            .finish()
    }
}

#[async_trait]
impl BackingStore for ChaosStore {
    async fn get_by_id(&self, key: &DocumentKey) -> Result<Option<Document>> {
        self.disrupt(&key.doc_id()).await?;
        self.inner.get_by_id(key).await
    }

    async fn run_transaction(&self, body: TransactionBody<'_>) -> Result<()> {
        self.disrupt("transaction").await?;
        self.inner.run_transaction(body).await
    }

    async fn subscribe(
        &self,
        key: &DocumentKey,
        on_change: ChangeCallback,
        on_error: ErrorCallback,
    ) -> Result<Unsubscribe> {
        self.disrupt(&key.doc_id()).await?;
        self.inner.subscribe(key, on_change, on_error).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;

    #[tokio::test]
    async fn test_disabled_chaos_passes_through() {
        let store = ChaosStore::new(Arc::new(InMemoryStore::new()), ChaosConfig::heavy().with_seed(7));
        for _ in 0..50 {
            assert!(store.get_by_id(&DocumentKey::aggregate("t")).await.is_ok());
        }
        let stats = store.stats();
        assert_eq!(stats.calls, 50);
        assert_eq!(stats.failures_injected, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_injected_failures_are_transient() {
        let store = ChaosStore::new(
            Arc::new(InMemoryStore::new()),
            ChaosConfig {
                failure_probability: 1.0,
                ..ChaosConfig::none()
            }
            .with_seed(1),
        );
        store.enable();

        for _ in 0..20 {
            let err = store.get_by_id(&DocumentKey::aggregate("t")).await.unwrap_err();
            assert!(err.is_retryable());
        }
        assert_eq!(store.stats().failures_injected, 20);
    }
}
