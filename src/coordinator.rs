//! Transactional vote writes and cached reads.
//!
//! Each write runs as one store transaction that reads the identity's vote by
//! its deterministic key, reads the item's aggregate, and writes both back with
//! the delta applied. The aggregate therefore always equals the tally of the
//! vote rows, whatever the interleaving of concurrent voters.

use crate::cache::AggregateCache;
use crate::error::{Error, Result};
use crate::metrics::VoteMetrics;
use crate::resilience::ResilienceLayer;
use crate::store::{BackingStore, Transaction};
use crate::types::{now_ms, Aggregate, Document, DocumentKey, Vote, VoteCount, VoteKey, VoteOutcome, VoteType};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Writes votes and serves cached reads.
#[derive(Debug)]
pub struct VotingCoordinator {
    store: Arc<dyn BackingStore>,
    resilience: Arc<ResilienceLayer>,
    cache: Arc<AggregateCache>,
    metrics: Arc<VoteMetrics>,
}

impl VotingCoordinator {
    pub fn new(
        store: Arc<dyn BackingStore>,
        resilience: Arc<ResilienceLayer>,
        cache: Arc<AggregateCache>,
        metrics: Arc<VoteMetrics>,
    ) -> Self {
        Self {
            store,
            resilience,
            cache,
            metrics,
        }
    }

    /// Record `vote_type` as the vote of `identity_id` on `item_id`.
    ///
    /// Re-submitting the identity's current vote is a no-op reported with
    /// `changed: false`. Changing the vote moves it between buckets.
    pub async fn submit_vote(
        &self,
        item_id: &str,
        identity_id: &str,
        vote_type: VoteType,
        item_label: &str,
    ) -> Result<VoteOutcome> {
        let item_id = require("item_id", item_id)?;
        let identity_id = require("identity_id", identity_id)?;
        let item_label = require("item_label", item_label)?;
        self.metrics.votes_submitted.inc();

        let result = self
            .resilience
            .call("submit_vote", || async move {
                self.metrics.store_transactions.inc();
                let mut outcome = None;
                let mut body = |tx: &mut dyn Transaction| -> Result<()> {
                    outcome = Some(apply_vote(tx, item_id, identity_id, vote_type, item_label)?);
                    Ok(())
                };
                self.store.run_transaction(&mut body).await?;
                outcome.ok_or_else(|| Error::Unknown("vote transaction produced no outcome".into()))
            })
            .await;

        match result {
            Ok(outcome) => {
                self.cache.invalidate(item_id).await;
                if outcome.changed {
                    self.metrics.votes_committed.inc();
                    info!(
                        item_id,
                        identity_id,
                        previous = ?outcome.previous,
                        current = %outcome.current,
                        up = outcome.counts.up,
                        down = outcome.counts.down,
                        "Vote committed"
                    );
                } else {
                    self.metrics.votes_unchanged.inc();
                    debug!(item_id, identity_id, vote_type = %vote_type, "Vote unchanged");
                }
                Ok(outcome)
            }
            Err(err) => {
                self.metrics.votes_failed.inc();
                warn!(item_id, identity_id, kind = %err.kind(), error = %err, "Vote failed");
                Err(err)
            }
        }
    }

    /// Remove the vote of `identity_id` on `item_id`.
    ///
    /// Returns the retracted vote, or `None` if the identity had not voted.
    pub async fn retract_vote(&self, item_id: &str, identity_id: &str) -> Result<Option<VoteType>> {
        let item_id = require("item_id", item_id)?;
        let identity_id = require("identity_id", identity_id)?;

        let retracted = self
            .resilience
            .call("retract_vote", || async move {
                self.metrics.store_transactions.inc();
                let mut retracted = None;
                let mut body = |tx: &mut dyn Transaction| -> Result<()> {
                    retracted = remove_vote(tx, item_id, identity_id)?;
                    Ok(())
                };
                self.store.run_transaction(&mut body).await?;
                Ok(retracted)
            })
            .await
            .inspect_err(|err| {
                warn!(item_id, identity_id, error = %err, "Vote retraction failed");
            })?;

        if let Some(previous) = retracted {
            self.cache.invalidate(item_id).await;
            self.metrics.votes_retracted.inc();
            info!(item_id, identity_id, previous = %previous, "Vote retracted");
        }
        Ok(retracted)
    }

    /// Rebuild the aggregate of `item_id` from its vote rows.
    pub async fn recount(&self, item_id: &str) -> Result<VoteCount> {
        let item_id = require("item_id", item_id)?;

        let counts = self
            .resilience
            .call("recount", || async move {
                self.metrics.store_transactions.inc();
                let mut counts = VoteCount::default();
                let mut body = |tx: &mut dyn Transaction| -> Result<()> {
                    counts = rebuild_aggregate(tx, item_id)?;
                    Ok(())
                };
                self.store.run_transaction(&mut body).await?;
                Ok(counts)
            })
            .await?;

        self.cache.invalidate(item_id).await;
        Ok(counts)
    }

    /// Counts of `item_id`, served from the cache when fresh.
    pub async fn get_vote_counts(&self, item_id: &str) -> Result<VoteCount> {
        let item_id = require("item_id", item_id)?;
        if let Some(counts) = self.cache.get_counts(item_id).await {
            return Ok(counts);
        }

        let epoch = self.cache.epoch();
        let key = &DocumentKey::aggregate(item_id);
        let document = self
            .resilience
            .call("get_vote_counts", || async move {
                self.metrics.store_reads.inc();
                self.store.get_by_id(key).await
            })
            .await?;

        let counts = document
            .map(Document::into_aggregate)
            .transpose()?
            .map(|agg| agg.counts())
            .unwrap_or_default();
        self.cache.set_counts(item_id, counts, epoch).await;
        Ok(counts)
    }

    /// Current vote of `identity_id` on `item_id`, served from the cache when fresh.
    pub async fn get_identity_vote(&self, item_id: &str, identity_id: &str) -> Result<Option<VoteType>> {
        let item_id = require("item_id", item_id)?;
        let identity_id = require("identity_id", identity_id)?;

        let cache_key = VoteKey::new(item_id, identity_id);
        if let Some(vote) = self.cache.get_identity_vote(&cache_key).await {
            return Ok(vote);
        }

        let epoch = self.cache.epoch();
        let key = &DocumentKey::from(&cache_key);
        let document = self
            .resilience
            .call("get_identity_vote", || async move {
                self.metrics.store_reads.inc();
                self.store.get_by_id(key).await
            })
            .await?;

        let vote = document
            .map(Document::into_vote)
            .transpose()?
            .map(|v| v.vote_type);
        self.cache.set_identity_vote(cache_key, vote, epoch).await;
        Ok(vote)
    }

    pub(crate) fn store(&self) -> &Arc<dyn BackingStore> {
        &self.store
    }

    pub(crate) fn resilience(&self) -> &Arc<ResilienceLayer> {
        &self.resilience
    }

    pub(crate) fn metrics(&self) -> &Arc<VoteMetrics> {
        &self.metrics
    }
}

pub(crate) fn require<'a>(field: &str, value: &'a str) -> Result<&'a str> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(Error::Validation(format!("{field} must not be empty")));
    }
    Ok(trimmed)
}

fn read_vote(tx: &mut dyn Transaction, key: &DocumentKey) -> Result<Option<Vote>> {
    tx.get(key)?.map(Document::into_vote).transpose()
}

fn read_aggregate(tx: &mut dyn Transaction, key: &DocumentKey) -> Result<Option<Aggregate>> {
    tx.get(key)?.map(Document::into_aggregate).transpose()
}

/// Write the aggregate, using `update` when it already existed.
fn write_aggregate(tx: &mut dyn Transaction, key: DocumentKey, aggregate: Aggregate, existed: bool) -> Result<()> {
    if existed {
        tx.update(key, Document::Aggregate(aggregate))
    } else {
        tx.set(key, Document::Aggregate(aggregate))
    }
}

fn apply_vote(
    tx: &mut dyn Transaction,
    item_id: &str,
    identity_id: &str,
    vote_type: VoteType,
    item_label: &str,
) -> Result<VoteOutcome> {
    let vote_key = DocumentKey::vote(item_id, identity_id);
    let aggregate_key = DocumentKey::aggregate(item_id);

    let previous = read_vote(tx, &vote_key)?.map(|v| v.vote_type);
    let existing = read_aggregate(tx, &aggregate_key)?;
    let existed = existing.is_some();
    let mut aggregate = existing.unwrap_or_else(|| Aggregate::empty(item_id, item_label));

    if previous == Some(vote_type) {
        return Ok(VoteOutcome {
            previous,
            current: vote_type,
            counts: aggregate.counts(),
            changed: false,
        });
    }

    let now = now_ms();
    aggregate.apply(previous, Some(vote_type));
    aggregate.stamp(now);
    let counts = aggregate.counts();

    tx.set(
        vote_key,
        Document::Vote(Vote {
            item_id: item_id.to_string(),
            identity_id: identity_id.to_string(),
            vote_type,
            updated_at_ms: now,
        }),
    )?;
    write_aggregate(tx, aggregate_key, aggregate, existed)?;

    Ok(VoteOutcome {
        previous,
        current: vote_type,
        counts,
        changed: true,
    })
}

fn remove_vote(tx: &mut dyn Transaction, item_id: &str, identity_id: &str) -> Result<Option<VoteType>> {
    let vote_key = DocumentKey::vote(item_id, identity_id);
    let aggregate_key = DocumentKey::aggregate(item_id);

    let Some(previous) = read_vote(tx, &vote_key)?.map(|v| v.vote_type) else {
        return Ok(None);
    };
    let existing = read_aggregate(tx, &aggregate_key)?;
    let existed = existing.is_some();
    let mut aggregate = existing.unwrap_or_else(|| Aggregate::empty(item_id, item_id));
    aggregate.apply(Some(previous), None);
    aggregate.stamp(now_ms());

    tx.delete(&vote_key)?;
    write_aggregate(tx, aggregate_key, aggregate, existed)?;
    Ok(Some(previous))
}

fn rebuild_aggregate(tx: &mut dyn Transaction, item_id: &str) -> Result<VoteCount> {
    let aggregate_key = DocumentKey::aggregate(item_id);
    let votes = tx.votes_for_item(item_id)?;
    let up = votes.iter().filter(|v| v.vote_type == VoteType::Up).count() as u64;
    let tally = VoteCount::new(up, votes.len() as u64 - up);

    let existing = read_aggregate(tx, &aggregate_key)?;
    match existing {
        Some(agg) if agg.counts() == tally => Ok(tally),
        None if votes.is_empty() => Ok(tally),
        existing => {
            let existed = existing.is_some();
            let mut aggregate = existing.unwrap_or_else(|| Aggregate::empty(item_id, item_id));
            warn!(
                item_id,
                stored_up = aggregate.up_count,
                stored_down = aggregate.down_count,
                stored_total = aggregate.total,
                up = tally.up,
                down = tally.down,
                "Aggregate disagreed with vote rows, repairing"
            );
            aggregate.up_count = tally.up;
            aggregate.down_count = tally.down;
            aggregate.total = tally.total;
            aggregate.stamp(now_ms());
            write_aggregate(tx, aggregate_key, aggregate, existed)?;
            Ok(tally)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CacheConfig, CircuitBreakerConfig, RetryConfig};
    use crate::store::InMemoryStore;
    use std::time::Duration;

    struct Fixture {
        store: Arc<InMemoryStore>,
        coordinator: Arc<VotingCoordinator>,
    }

    fn fixture(retry: RetryConfig) -> Fixture {
        let metrics = Arc::new(VoteMetrics::new());
        let store = Arc::new(InMemoryStore::new());
        let resilience = Arc::new(ResilienceLayer::new(
            CircuitBreakerConfig::default(),
            retry,
            metrics.clone(),
        ));
        let cache = Arc::new(AggregateCache::new(&CacheConfig::default(), metrics.clone()));
        let coordinator = Arc::new(VotingCoordinator::new(
            store.clone(),
            resilience,
            cache,
            metrics,
        ));
        Fixture { store, coordinator }
    }

    fn assert_invariant(store: &InMemoryStore, item_id: &str) {
        let aggregate = store.aggregate(item_id).unwrap().unwrap();
        let votes = store.votes(item_id).unwrap();
        let up = votes.iter().filter(|v| v.vote_type == VoteType::Up).count() as u64;
        assert!(aggregate.is_consistent());
        assert_eq!(aggregate.up_count, up);
        assert_eq!(aggregate.down_count, votes.len() as u64 - up);
    }

    #[tokio::test]
    async fn test_first_vote_creates_aggregate() {
        let f = fixture(RetryConfig::disabled());
        let outcome = f
            .coordinator
            .submit_vote("t1", "alice", VoteType::Up, "Track One")
            .await
            .unwrap();

        assert_eq!(outcome.previous, None);
        assert!(outcome.changed);
        assert_eq!(outcome.counts, VoteCount::new(1, 0));

        let aggregate = f.store.aggregate("t1").unwrap().unwrap();
        assert_eq!(aggregate.item_label, "Track One");
        assert_invariant(&f.store, "t1");
    }

    #[tokio::test]
    async fn test_same_vote_twice_is_idempotent() {
        let f = fixture(RetryConfig::disabled());
        f.coordinator.submit_vote("t1", "alice", VoteType::Up, "T").await.unwrap();
        let commits = f.store.stats().commits;

        let outcome = f.coordinator.submit_vote("t1", "alice", VoteType::Up, "T").await.unwrap();
        assert!(!outcome.changed);
        assert_eq!(outcome.counts, VoteCount::new(1, 0));
        assert_eq!(f.store.stats().commits, commits, "no-op must not write");
    }

    #[tokio::test]
    async fn test_vote_change_moves_bucket() {
        let f = fixture(RetryConfig::disabled());
        f.coordinator.submit_vote("t1", "alice", VoteType::Up, "T").await.unwrap();
        f.coordinator.submit_vote("t1", "bob", VoteType::Up, "T").await.unwrap();

        let outcome = f.coordinator.submit_vote("t1", "alice", VoteType::Down, "T").await.unwrap();
        assert_eq!(outcome.previous, Some(VoteType::Up));
        assert_eq!(outcome.counts, VoteCount::new(1, 1));
        assert_invariant(&f.store, "t1");
    }

    #[tokio::test]
    async fn test_concurrent_distinct_voters() {
        let f = fixture(RetryConfig::disabled());
        f.store.set_latency(Duration::from_millis(1));

        let mut handles = Vec::new();
        for i in 0..20 {
            let coordinator = f.coordinator.clone();
            let vote_type = if i % 3 == 0 { VoteType::Down } else { VoteType::Up };
            handles.push(tokio::spawn(async move {
                coordinator
                    .submit_vote("t1", &format!("user-{i}"), vote_type, "T")
                    .await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }

        let aggregate = f.store.aggregate("t1").unwrap().unwrap();
        assert_eq!(aggregate.up_count, 13);
        assert_eq!(aggregate.down_count, 7);
        assert_eq!(aggregate.total, 20);
        assert_invariant(&f.store, "t1");
    }

    #[tokio::test]
    async fn test_validation_performs_no_io() {
        let f = fixture(RetryConfig::disabled());

        for (item, identity, label) in [("", "a", "T"), ("t", "  ", "T"), ("t", "a", "")] {
            let result = f.coordinator.submit_vote(item, identity, VoteType::Up, label).await;
            assert!(matches!(result, Err(Error::Validation(_))));
        }
        assert_eq!(f.store.stats().transactions, 0);
    }

    #[tokio::test]
    async fn test_write_invalidates_cached_reads() {
        let f = fixture(RetryConfig::disabled());
        assert_eq!(f.coordinator.get_vote_counts("t1").await.unwrap(), VoteCount::default());
        assert_eq!(f.coordinator.get_identity_vote("t1", "alice").await.unwrap(), None);

        f.coordinator.submit_vote("t1", "alice", VoteType::Down, "T").await.unwrap();

        assert_eq!(f.coordinator.get_vote_counts("t1").await.unwrap(), VoteCount::new(0, 1));
        assert_eq!(
            f.coordinator.get_identity_vote("t1", "alice").await.unwrap(),
            Some(VoteType::Down)
        );
    }

    #[tokio::test]
    async fn test_cached_read_skips_store() {
        let f = fixture(RetryConfig::disabled());
        f.coordinator.get_vote_counts("t1").await.unwrap();
        f.coordinator.get_vote_counts("t1").await.unwrap();
        assert_eq!(f.store.stats().reads, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_is_retried() {
        let f = fixture(RetryConfig::default().with_jitter(0.0));
        f.store.fail_next(Error::Conflict { key: "aggregates/t1".into() });

        let outcome = f.coordinator.submit_vote("t1", "alice", VoteType::Up, "T").await.unwrap();
        assert!(outcome.changed);
        assert_eq!(f.store.stats().transactions, 1);
        assert_invariant(&f.store, "t1");
    }

    #[tokio::test]
    async fn test_failed_transaction_leaves_no_partial_state() {
        let f = fixture(RetryConfig::disabled());
        f.coordinator.submit_vote("t1", "alice", VoteType::Up, "T").await.unwrap();
        f.store.fail_next(Error::Permission("rules".into()));

        let result = f.coordinator.submit_vote("t1", "alice", VoteType::Down, "T").await;
        assert!(matches!(result, Err(Error::Permission(_))));
        assert_eq!(f.store.aggregate("t1").unwrap().unwrap().counts(), VoteCount::new(1, 0));
        assert_invariant(&f.store, "t1");
    }

    #[tokio::test]
    async fn test_retract_vote() {
        let f = fixture(RetryConfig::disabled());
        f.coordinator.submit_vote("t1", "alice", VoteType::Up, "T").await.unwrap();
        f.coordinator.submit_vote("t1", "bob", VoteType::Down, "T").await.unwrap();

        assert_eq!(f.coordinator.retract_vote("t1", "alice").await.unwrap(), Some(VoteType::Up));
        assert_eq!(f.coordinator.retract_vote("t1", "alice").await.unwrap(), None);

        assert_eq!(f.store.aggregate("t1").unwrap().unwrap().counts(), VoteCount::new(0, 1));
        assert_eq!(f.coordinator.get_identity_vote("t1", "alice").await.unwrap(), None);
        assert_invariant(&f.store, "t1");
    }

    #[tokio::test]
    async fn test_recount_repairs_aggregate() {
        let f = fixture(RetryConfig::disabled());
        f.coordinator.submit_vote("t1", "alice", VoteType::Up, "T").await.unwrap();
        f.coordinator.submit_vote("t1", "bob", VoteType::Up, "T").await.unwrap();

        let mut broken = f.store.aggregate("t1").unwrap().unwrap();
        broken.up_count = 9;
        broken.total = 4;
        f.store
            .put_document(DocumentKey::aggregate("t1"), Document::Aggregate(broken))
            .unwrap();

        assert_eq!(f.coordinator.recount("t1").await.unwrap(), VoteCount::new(2, 0));
        assert_invariant(&f.store, "t1");
        assert_eq!(f.store.aggregate("t1").unwrap().unwrap().item_label, "T");
    }

    #[tokio::test]
    async fn test_recount_of_unknown_item_writes_nothing() {
        let f = fixture(RetryConfig::disabled());
        assert_eq!(f.coordinator.recount("nothing").await.unwrap(), VoteCount::default());
        assert_eq!(f.store.stats().commits, 0);
    }
}
