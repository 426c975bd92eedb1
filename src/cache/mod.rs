//! Local read cache for aggregate counts and per-identity votes.
//!
//! The cache is advisory: the store is the source of truth, and every
//! confirmed write invalidates the entries of its item. Reads that race with
//! an invalidation are not cached (see [`AggregateCache::epoch`]). Fills and
//! invalidations exclude each other, so a fill that passed its epoch check
//! lands before the next invalidation removes it.

use crate::config::CacheConfig;
use crate::metrics::VoteMetrics;
use crate::types::{VoteCount, VoteKey, VoteType};
use moka::future::Cache;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio::time::Instant;
use tracing::{debug, trace};

#[derive(Debug, Clone)]
struct Stamped<T> {
    value: T,
    stored_at: Instant,
}

impl<T> Stamped<T> {
    fn new(value: T) -> Self {
        Self {
            value,
            stored_at: Instant::now(),
        }
    }

    fn is_fresh(&self, ttl: Duration) -> bool {
        self.stored_at.elapsed() < ttl
    }
}

/// Cache statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub aggregate_entries: u64,
    pub identity_entries: u64,
    pub hits: u64,
    pub misses: u64,
}

/// TTL cache in front of the backing store.
pub struct AggregateCache {
    aggregates: Cache<String, Stamped<VoteCount>>,
    identity_votes: Cache<VoteKey, Stamped<Option<VoteType>>>,
    aggregate_ttl: Duration,
    identity_vote_ttl: Duration,

    /// Bumped by every invalidation.
    epoch: AtomicU64,
    /// Shared by fills, exclusive for invalidations.
    fill_gate: RwLock<()>,

    hits: AtomicU64,
    misses: AtomicU64,
    metrics: Arc<VoteMetrics>,
}

impl AggregateCache {
    pub fn new(config: &CacheConfig, metrics: Arc<VoteMetrics>) -> Self {
        Self {
            aggregates: Cache::builder().max_capacity(config.max_capacity).build(),
            identity_votes: Cache::builder().max_capacity(config.max_capacity).build(),
            aggregate_ttl: config.aggregate_ttl,
            identity_vote_ttl: config.identity_vote_ttl,
            epoch: AtomicU64::new(0),
            fill_gate: RwLock::new(()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            metrics,
        }
    }

    /// Current invalidation epoch.
    ///
    /// A reader captures the epoch before going to the store and passes it
    /// back to `set_*`; the value is dropped if an invalidation happened in
    /// between, so a stale read can never shadow a confirmed write.
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    /// Cached counts of an item, if present and younger than the TTL.
    pub async fn get_counts(&self, item_id: &str) -> Option<VoteCount> {
        let entry = self.aggregates.get(item_id).await;
        let fresh = match entry {
            Some(e) if e.is_fresh(self.aggregate_ttl) => Some(e.value),
            Some(_) => {
                self.aggregates.invalidate(item_id).await;
                trace!(item_id, "Expired aggregate entry evicted");
                None
            }
            None => None,
        };
        self.record(fresh.is_some());
        fresh
    }

    /// Cache the counts of an item read at `epoch`.
    pub async fn set_counts(&self, item_id: &str, counts: VoteCount, epoch: u64) {
        let _fill = self.fill_gate.read().await;
        if epoch != self.epoch() {
            trace!(item_id, "Skipping cache fill after concurrent invalidation");
            return;
        }
        self.aggregates
            .insert(item_id.to_string(), Stamped::new(counts))
            .await;
    }

    /// Cached vote of an identity. `Some(None)` is a cached "no vote".
    pub async fn get_identity_vote(&self, key: &VoteKey) -> Option<Option<VoteType>> {
        let entry = self.identity_votes.get(key).await;
        let fresh = match entry {
            Some(e) if e.is_fresh(self.identity_vote_ttl) => Some(e.value),
            Some(_) => {
                self.identity_votes.invalidate(key).await;
                None
            }
            None => None,
        };
        self.record(fresh.is_some());
        fresh
    }

    /// Cache the vote of an identity read at `epoch`.
    pub async fn set_identity_vote(&self, key: VoteKey, vote: Option<VoteType>, epoch: u64) {
        let _fill = self.fill_gate.read().await;
        if epoch != self.epoch() {
            return;
        }
        self.identity_votes.insert(key, Stamped::new(vote)).await;
    }

    /// Remove the aggregate entry and every identity entry of `item_id`.
    pub async fn invalidate(&self, item_id: &str) {
        let _exclusive = self.fill_gate.write().await;
        self.epoch.fetch_add(1, Ordering::AcqRel);
        self.aggregates.invalidate(item_id).await;

        let keys: Vec<Arc<VoteKey>> = self
            .identity_votes
            .iter()
            .filter(|(k, _)| k.item_id == item_id)
            .map(|(k, _)| k)
            .collect();
        for key in &keys {
            self.identity_votes.invalidate(key.as_ref()).await;
        }
        debug!(item_id, identity_entries = keys.len(), "Cache invalidated");
    }

    /// Drop every entry.
    pub async fn invalidate_all(&self) {
        let _exclusive = self.fill_gate.write().await;
        self.epoch.fetch_add(1, Ordering::AcqRel);
        self.aggregates.invalidate_all();
        self.identity_votes.invalidate_all();
    }

    /// Evict expired entries; returns how many were removed.
    pub async fn sweep(&self) -> usize {
        let expired_aggregates: Vec<Arc<String>> = self
            .aggregates
            .iter()
            .filter(|(_, e)| !e.is_fresh(self.aggregate_ttl))
            .map(|(k, _)| k)
            .collect();
        let expired_votes: Vec<Arc<VoteKey>> = self
            .identity_votes
            .iter()
            .filter(|(_, e)| !e.is_fresh(self.identity_vote_ttl))
            .map(|(k, _)| k)
            .collect();

        for key in &expired_aggregates {
            self.aggregates.invalidate(key.as_str()).await;
        }
        for key in &expired_votes {
            self.identity_votes.invalidate(key.as_ref()).await;
        }
        self.run_pending_tasks().await;

        let removed = expired_aggregates.len() + expired_votes.len();
        if removed > 0 {
            debug!(removed, "Cache sweep evicted expired entries");
        }
        removed
    }

    /// Run moka's pending maintenance so entry counts are current.
    pub async fn run_pending_tasks(&self) {
        self.aggregates.run_pending_tasks().await;
        self.identity_votes.run_pending_tasks().await;
    }

    /// Periodically sweep until a shutdown signal arrives.
    pub async fn run_sweep_loop(self: Arc<Self>, interval: Duration, mut shutdown: mpsc::Receiver<()>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.sweep().await;
                }
                _ = shutdown.recv() => {
                    debug!("Cache sweep loop shutting down");
                    break;
                }
            }
        }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            aggregate_entries: self.aggregates.entry_count(),
            identity_entries: self.identity_votes.entry_count(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    fn record(&self, hit: bool) {
        if hit {
            self.hits.fetch_add(1, Ordering::Relaxed);
            self.metrics.cache_hits.inc();
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            self.metrics.cache_misses.inc();
        }
    }
}

impl std::fmt::Debug for AggregateCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AggregateCache")
            .field("aggregate_ttl", &self.aggregate_ttl)
            .field("identity_vote_ttl", &self.identity_vote_ttl)
            .field("stats", &self.stats())
            .finish()
    }
}
