//! The vote synchronization engine.
//!
//! [`VoteSyncEngine`] owns one instance of every component and wires them to
//! the backing store:
//!
//! ```text
//!   sessions ──► debouncer ──► coordinator ──► resilience ──► store
//!      │                           │                            │
//!      │                           └──► cache (invalidate)      │ push
//!      └──── lease ◄── subscription pool ◄──────────────────────┘
//! ```
//!
//! Background tasks sweep the cache and the subscription pool until
//! [`VoteSyncEngine::shutdown`] is called.

use crate::cache::{AggregateCache, CacheStats};
use crate::config::VoteSyncConfig;
use crate::connectivity::NetworkStatus;
use crate::coordinator::{require, VotingCoordinator};
use crate::debounce::VoteDebouncer;
use crate::error::{Error, Result};
use crate::metrics::VoteMetrics;
use crate::resilience::{CircuitState, ResilienceLayer};
use crate::session::ClientVoteSession;
use crate::store::{BackingStore, ChangeCallback, ErrorCallback};
use crate::subscription::{SubscriptionLease, SubscriptionPool};
use crate::types::{Document, DocumentKey, VoteCount, VoteOutcome, VoteType};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Vote synchronization engine.
pub struct VoteSyncEngine {
    config: VoteSyncConfig,
    network: Arc<dyn NetworkStatus>,
    metrics: Arc<VoteMetrics>,
    cache: Arc<AggregateCache>,
    resilience: Arc<ResilienceLayer>,
    coordinator: Arc<VotingCoordinator>,
    debouncer: VoteDebouncer,
    pool: SubscriptionPool,

    /// Cache sweep loop shutdown sender.
    cache_shutdown_tx: mpsc::Sender<()>,

    /// Subscription sweep loop shutdown sender.
    pool_shutdown_tx: mpsc::Sender<()>,
}

impl VoteSyncEngine {
    /// Create an engine over `store`.
    ///
    /// Validates `config` and starts the background sweep loops, so it must
    /// be called from within a tokio runtime.
    pub async fn new(
        config: VoteSyncConfig,
        store: Arc<dyn BackingStore>,
        network: Arc<dyn NetworkStatus>,
    ) -> Result<Self> {
        config.validate()?;
        info!(
            debounce_ms = config.debounce.window.as_millis() as u64,
            failure_threshold = config.breaker.failure_threshold,
            "Starting vote sync engine"
        );

        let metrics = Arc::new(VoteMetrics::new());
        let cache = Arc::new(AggregateCache::new(&config.cache, metrics.clone()));
        let resilience = Arc::new(ResilienceLayer::new(
            config.breaker.clone(),
            config.retry.clone(),
            metrics.clone(),
        ));
        let coordinator = Arc::new(VotingCoordinator::new(
            store,
            resilience.clone(),
            cache.clone(),
            metrics.clone(),
        ));
        let debouncer = VoteDebouncer::new(&config.debounce, metrics.clone());
        let pool = SubscriptionPool::new(config.subscriptions.clone(), metrics.clone());

        let (cache_shutdown_tx, cache_shutdown_rx) = mpsc::channel(1);
        tokio::spawn(cache.clone().run_sweep_loop(config.cache.sweep_interval, cache_shutdown_rx));

        let (pool_shutdown_tx, pool_shutdown_rx) = mpsc::channel(1);
        tokio::spawn(pool.clone().run_sweep_loop(config.subscriptions.sweep_interval, pool_shutdown_rx));

        Ok(Self {
            config,
            network,
            metrics,
            cache,
            resilience,
            coordinator,
            debouncer,
            pool,
            cache_shutdown_tx,
            pool_shutdown_tx,
        })
    }

    // ==================== Votes ====================

    /// Record a vote. See [`VotingCoordinator::submit_vote`].
    pub async fn submit_vote(
        &self,
        item_id: &str,
        identity_id: &str,
        vote_type: VoteType,
        item_label: &str,
    ) -> Result<VoteOutcome> {
        self.coordinator
            .submit_vote(item_id, identity_id, vote_type, item_label)
            .await
    }

    /// Remove an identity's vote, returning what it was.
    pub async fn retract_vote(&self, item_id: &str, identity_id: &str) -> Result<Option<VoteType>> {
        self.coordinator.retract_vote(item_id, identity_id).await
    }

    /// Rebuild an item's aggregate from its vote rows.
    pub async fn recount(&self, item_id: &str) -> Result<VoteCount> {
        self.coordinator.recount(item_id).await
    }

    pub async fn get_vote_counts(&self, item_id: &str) -> Result<VoteCount> {
        self.coordinator.get_vote_counts(item_id).await
    }

    pub async fn get_identity_vote(&self, item_id: &str, identity_id: &str) -> Result<Option<VoteType>> {
        self.coordinator.get_identity_vote(item_id, identity_id).await
    }

    // ==================== Live updates ====================

    /// Call `on_update` with the item's counts now and on every change.
    ///
    /// Subscriptions to the same item share one store subscription.
    pub async fn subscribe_to_vote_updates<F>(&self, item_id: &str, on_update: F) -> Result<VoteSubscription>
    where
        F: Fn(VoteCount) + Send + Sync + 'static,
    {
        let item_id = require("item_id", item_id)?;
        let lease = self.acquire_lease(item_id).await?;

        let mut updates = lease.watch();
        let task = tokio::spawn(async move {
            if let Some(counts) = *updates.borrow_and_update() {
                on_update(counts);
            }
            while updates.changed().await.is_ok() {
                let latest = *updates.borrow_and_update();
                if let Some(counts) = latest {
                    on_update(counts);
                }
            }
        });

        Ok(VoteSubscription { lease, task })
    }

    /// Open a vote session on `item_id`. Without an identity the session is
    /// read-only.
    pub async fn open_session(
        &self,
        item_id: &str,
        item_label: &str,
        identity: Option<&str>,
    ) -> Result<ClientVoteSession> {
        let item_id = require("item_id", item_id)?;
        let item_label = require("item_label", item_label)?;
        let identity = identity.map(|id| require("identity_id", id)).transpose()?;

        let lease = self.acquire_lease(item_id).await?;
        let counts = self.coordinator.get_vote_counts(item_id).await?;
        let current_vote = match identity {
            Some(identity_id) => self.coordinator.get_identity_vote(item_id, identity_id).await?,
            None => None,
        };

        debug!(item_id, identity = ?identity, "Vote session opened");
        Ok(ClientVoteSession::new(
            item_id.to_string(),
            item_label.to_string(),
            identity.map(str::to_string),
            self.coordinator.clone(),
            self.debouncer.clone(),
            self.network.clone(),
            lease,
            current_vote,
            counts,
        ))
    }

    /// Lease the live subscription of `item_id`, opening it if needed.
    async fn acquire_lease(&self, item_id: &str) -> Result<SubscriptionLease> {
        let store = self.coordinator.store();
        let resilience = &self.resilience;
        let metrics = &self.metrics;

        self.pool
            .acquire(item_id, |feed| async move {
                let key = &DocumentKey::aggregate(item_id);

                let on_change: ChangeCallback = {
                    let item_id = item_id.to_string();
                    Arc::new(move |document: Option<Document>| match document {
                        Some(Document::Aggregate(aggregate)) => {
                            feed.publish_revision(aggregate.revision, aggregate.counts())
                        }
                        None => feed.publish_revision(0, VoteCount::default()),
                        Some(Document::Vote(_)) => {
                            warn!(item_id = %item_id, "Ignoring vote document on aggregate subscription")
                        }
                    })
                };
                let on_error: ErrorCallback = {
                    let item_id = item_id.to_string();
                    let metrics = Arc::clone(metrics);
                    Arc::new(move |err: Error| {
                        metrics.record_error(err.kind());
                        warn!(item_id = %item_id, error = %err, "Live subscription error");
                    })
                };

                resilience
                    .call("subscribe", || {
                        let on_change = on_change.clone();
                        let on_error = on_error.clone();
                        async move { store.subscribe(key, on_change, on_error).await }
                    })
                    .await
            })
            .await
    }

    // ==================== Observability ====================

    pub fn config(&self) -> &VoteSyncConfig {
        &self.config
    }

    pub fn metrics(&self) -> Arc<VoteMetrics> {
        self.metrics.clone()
    }

    pub fn breaker_state(&self) -> CircuitState {
        self.resilience.state()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// The subscription pool, for inspection.
    pub fn subscriptions(&self) -> &SubscriptionPool {
        &self.pool
    }

    /// Number of votes waiting in the debounce window.
    pub fn pending_votes(&self) -> usize {
        self.debouncer.pending_count()
    }

    // ==================== Lifecycle ====================

    /// Cancel pending votes, close live subscriptions and stop the
    /// background loops.
    pub async fn shutdown(&self) {
        info!("Shutting down vote sync engine");

        let cancelled = self.debouncer.cancel_all();
        if cancelled > 0 {
            warn!(cancelled, "Pending votes dropped at shutdown");
        }
        self.pool.close_all();
        self.cache.invalidate_all().await;

        let _ = self.cache_shutdown_tx.send(()).await;
        let _ = self.pool_shutdown_tx.send(()).await;
    }
}

impl std::fmt::Debug for VoteSyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VoteSyncEngine")
            .field("breaker", &self.breaker_state())
            .field("cache", &self.cache)
            .field("pool", &self.pool)
            .field("debouncer", &self.debouncer)
            .finish()
    }
}

/// Handle of a [`VoteSyncEngine::subscribe_to_vote_updates`] subscription.
///
/// Dropping the handle unsubscribes.
pub struct VoteSubscription {
    lease: SubscriptionLease,
    task: JoinHandle<()>,
}

impl VoteSubscription {
    pub fn item_id(&self) -> &str {
        self.lease.item_id()
    }

    /// Latest counts delivered for the item.
    pub fn latest(&self) -> Option<VoteCount> {
        self.lease.counts()
    }

    pub fn is_active(&self) -> bool {
        !self.lease.is_released()
    }

    /// Stop delivering updates. Calling it again has no effect.
    pub fn unsubscribe(&mut self) {
        self.task.abort();
        self.lease.release();
    }
}

impl Drop for VoteSubscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl std::fmt::Debug for VoteSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VoteSubscription")
            .field("item_id", &self.item_id())
            .field("active", &self.is_active())
            .finish()
    }
}
