//! Reference-counted pool of live aggregate subscriptions.
//!
//! Every consumer of an item's live counts holds a [`SubscriptionLease`]. The
//! first lease opens one store subscription; later leases share it through a
//! `watch` channel. When the last lease is released, teardown waits for a
//! grace period so a quick re-acquire (a UI remounting) reuses the open
//! subscription.

use crate::config::SubscriptionConfig;
use crate::error::{Error, Result};
use crate::metrics::VoteMetrics;
use crate::store::Unsubscribe;
use crate::types::VoteCount;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

/// Publishing side of an item's live counts, handed to the subscription
/// factory.
#[derive(Clone)]
pub struct CountFeed {
    tx: Arc<watch::Sender<Option<VoteCount>>>,
    /// Revision of the published counts.
    revision: Arc<AtomicU64>,
}

impl CountFeed {
    fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self {
            tx: Arc::new(tx),
            revision: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Publish new counts. Identical counts do not wake receivers.
    pub fn publish(&self, counts: VoteCount) {
        self.tx.send_if_modified(|current| replace_if_changed(current, counts));
    }

    /// Publish the counts of aggregate revision `revision`, unless a later
    /// revision was already published. Deliveries may arrive out of commit
    /// order; only the newest revision is kept. An item without an aggregate
    /// is revision 0.
    pub fn publish_revision(&self, revision: u64, counts: VoteCount) {
        self.tx.send_if_modified(|current| {
            // Checked under the channel's lock so racing publishers serialize.
            if current.is_some() && revision < self.revision.load(Ordering::Acquire) {
                trace!(revision, "Dropping out-of-order count update");
                return false;
            }
            self.revision.store(revision, Ordering::Release);
            replace_if_changed(current, counts)
        });
    }

    /// Most recently published counts.
    pub fn latest(&self) -> Option<VoteCount> {
        *self.tx.borrow()
    }

    fn receiver(&self) -> watch::Receiver<Option<VoteCount>> {
        self.tx.subscribe()
    }
}

fn replace_if_changed(current: &mut Option<VoteCount>, counts: VoteCount) -> bool {
    if *current == Some(counts) {
        false
    } else {
        *current = Some(counts);
        true
    }
}

impl std::fmt::Debug for CountFeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CountFeed")
            .field("latest", &self.latest())
            .field("receivers", &self.tx.receiver_count())
            .finish()
    }
}

struct PoolEntry {
    ref_count: usize,
    feed: CountFeed,
    /// Set once the store subscription is open.
    unsubscribe: Option<Unsubscribe>,
    /// Serializes opening the store subscription.
    opening: Arc<tokio::sync::Mutex<()>>,
    /// Bumped on every acquire and every release to zero; a pending teardown
    /// only proceeds if the generation it saw is still current.
    generation: u64,
    idle_since: Option<Instant>,
}

impl PoolEntry {
    fn new() -> Self {
        Self {
            ref_count: 0,
            feed: CountFeed::new(),
            unsubscribe: None,
            opening: Arc::new(tokio::sync::Mutex::new(())),
            generation: 0,
            idle_since: None,
        }
    }
}

struct PoolInner {
    entries: Mutex<HashMap<String, PoolEntry>>,
    config: SubscriptionConfig,
    metrics: Arc<VoteMetrics>,
}

impl PoolInner {
    fn release(self: &Arc<Self>, item_id: &str) {
        let generation = {
            let mut entries = self.entries.lock();
            let Some(entry) = entries.get_mut(item_id) else {
                return;
            };
            entry.ref_count = entry.ref_count.saturating_sub(1);
            if entry.ref_count > 0 {
                return;
            }
            entry.generation += 1;
            entry.idle_since = Some(Instant::now());
            entry.generation
        };

        debug!(item_id, grace_ms = self.config.grace_period.as_millis() as u64, "Last lease released");
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let inner = Arc::clone(self);
                let item_id = item_id.to_string();
                let grace = self.config.grace_period;
                handle.spawn(async move {
                    tokio::time::sleep(grace).await;
                    inner.teardown_if_idle(&item_id, Some(generation));
                });
            }
            // No runtime to run the grace timer on.
            Err(_) => {
                self.teardown_if_idle(item_id, Some(generation));
            }
        }
    }

    /// Give back a reference taken by an acquire that did not complete.
    ///
    /// An entry that never got its store subscription is removed at once;
    /// an open one goes through the normal grace-period release.
    fn abandon(self: &Arc<Self>, item_id: &str) {
        {
            let mut entries = self.entries.lock();
            let Some(entry) = entries.get_mut(item_id) else {
                return;
            };
            if entry.unsubscribe.is_none() {
                entry.ref_count = entry.ref_count.saturating_sub(1);
                if entry.ref_count == 0 {
                    entries.remove(item_id);
                }
                return;
            }
        }
        self.release(item_id);
    }

    /// Remove the entry if it is unreferenced and, when given, still at
    /// `generation`. Returns whether it was removed.
    fn teardown_if_idle(&self, item_id: &str, generation: Option<u64>) -> bool {
        let entry = {
            let mut entries = self.entries.lock();
            match entries.get(item_id) {
                Some(e) if e.ref_count == 0 && generation.map_or(true, |g| g == e.generation) => {
                    entries.remove(item_id)
                }
                _ => None,
            }
        };
        match entry {
            Some(entry) => {
                self.close_entry(item_id, entry);
                true
            }
            None => false,
        }
    }

    fn close_entry(&self, item_id: &str, mut entry: PoolEntry) {
        if let Some(mut unsubscribe) = entry.unsubscribe.take() {
            unsubscribe.unsubscribe();
            self.metrics.subscriptions_closed.inc();
            self.metrics.subscriptions_active.dec();
            info!(item_id, "Live subscription closed");
        }
    }
}

/// Pool of shared live subscriptions keyed by item.
#[derive(Clone)]
pub struct SubscriptionPool {
    inner: Arc<PoolInner>,
}

impl SubscriptionPool {
    pub fn new(config: SubscriptionConfig, metrics: Arc<VoteMetrics>) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                entries: Mutex::new(HashMap::new()),
                config,
                metrics,
            }),
        }
    }

    /// Take a lease on the live counts of `item_id`.
    ///
    /// If no subscription is open for the item, `create` is called with the
    /// item's [`CountFeed`] and must return the handle that closes the store
    /// subscription. Concurrent acquires for the same item call `create` at
    /// most once between them. If `create` fails, or the returned future is
    /// dropped before it completes, the reference taken by this call is given
    /// back.
    pub async fn acquire<F, Fut>(&self, item_id: &str, create: F) -> Result<SubscriptionLease>
    where
        F: FnOnce(CountFeed) -> Fut,
        Fut: Future<Output = Result<Unsubscribe>>,
    {
        let (opening, open) = {
            let mut entries = self.inner.entries.lock();
            let entry = entries
                .entry(item_id.to_string())
                .or_insert_with(PoolEntry::new);
            entry.ref_count += 1;
            entry.generation += 1;
            entry.idle_since = None;
            (entry.opening.clone(), entry.unsubscribe.is_some())
        };
        let mut pending = PendingAcquire {
            pool: Arc::clone(&self.inner),
            item_id,
            armed: true,
        };

        if !open {
            let _guard = opening.lock().await;
            let feed = {
                let entries = self.inner.entries.lock();
                entries
                    .get(item_id)
                    .filter(|e| e.unsubscribe.is_none())
                    .map(|e| e.feed.clone())
            };

            if let Some(feed) = feed {
                match create(feed).await {
                    Ok(unsubscribe) => {
                        let mut entries = self.inner.entries.lock();
                        if let Some(entry) = entries.get_mut(item_id) {
                            entry.unsubscribe = Some(unsubscribe);
                        }
                        self.inner.metrics.subscriptions_opened.inc();
                        self.inner.metrics.subscriptions_active.inc();
                        info!(item_id, "Live subscription opened");
                    }
                    Err(err) => {
                        warn!(item_id, error = %err, "Failed to open live subscription");
                        return Err(err);
                    }
                }
            }
        }

        let receiver = {
            let entries = self.inner.entries.lock();
            match entries.get(item_id) {
                Some(entry) => entry.feed.receiver(),
                // The pool was shut down while this acquire was waiting.
                None => return Err(Error::Cancelled),
            }
        };
        pending.armed = false;

        Ok(SubscriptionLease {
            pool: Arc::clone(&self.inner),
            item_id: item_id.to_string(),
            receiver,
            released: false,
        })
    }

    /// Number of live leases on `item_id`.
    pub fn ref_count(&self, item_id: &str) -> usize {
        self.inner
            .entries
            .lock()
            .get(item_id)
            .map_or(0, |e| e.ref_count)
    }

    /// Whether a store subscription is open for `item_id`.
    pub fn is_open(&self, item_id: &str) -> bool {
        self.inner
            .entries
            .lock()
            .get(item_id)
            .is_some_and(|e| e.unsubscribe.is_some())
    }

    /// Number of entries in the pool, including ones awaiting teardown.
    pub fn len(&self) -> usize {
        self.inner.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Tear down unreferenced entries idle for longer than the idle timeout.
    pub fn sweep_idle(&self) -> usize {
        let idle_timeout = self.inner.config.idle_timeout;
        let idle: Vec<String> = self
            .inner
            .entries
            .lock()
            .iter()
            .filter(|(_, e)| {
                e.ref_count == 0 && e.idle_since.is_some_and(|t| t.elapsed() >= idle_timeout)
            })
            .map(|(k, _)| k.clone())
            .collect();

        let removed = idle
            .iter()
            .filter(|item_id| self.inner.teardown_if_idle(item_id, None))
            .count();
        if removed > 0 {
            debug!(removed, "Idle subscription sweep");
        }
        removed
    }

    /// Periodically sweep idle entries until a shutdown signal arrives.
    pub async fn run_sweep_loop(self, interval: Duration, mut shutdown: mpsc::Receiver<()>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.sweep_idle();
                }
                _ = shutdown.recv() => {
                    debug!("Subscription sweep loop shutting down");
                    break;
                }
            }
        }
    }

    /// Close every subscription regardless of outstanding leases.
    pub fn close_all(&self) {
        let entries: Vec<(String, PoolEntry)> = self.inner.entries.lock().drain().collect();
        for (item_id, entry) in entries {
            self.inner.close_entry(&item_id, entry);
        }
    }
}

impl std::fmt::Debug for SubscriptionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionPool")
            .field("entries", &self.len())
            .field("config", &self.inner.config)
            .finish()
    }
}

/// Reference taken by an in-progress acquire. Dropped while armed (the
/// acquire failed or its future was dropped), it gives the reference back.
struct PendingAcquire<'a> {
    pool: Arc<PoolInner>,
    item_id: &'a str,
    armed: bool,
}

impl Drop for PendingAcquire<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.pool.abandon(self.item_id);
        }
    }
}

/// A reference on an item's live subscription.
///
/// Releasing is idempotent; dropping an unreleased lease releases it.
pub struct SubscriptionLease {
    pool: Arc<PoolInner>,
    item_id: String,
    receiver: watch::Receiver<Option<VoteCount>>,
    released: bool,
}

impl SubscriptionLease {
    pub fn item_id(&self) -> &str {
        &self.item_id
    }

    /// Latest counts delivered by the store, if any yet.
    pub fn counts(&self) -> Option<VoteCount> {
        *self.receiver.borrow()
    }

    /// A receiver of the item's counts, independent of this lease.
    pub fn watch(&self) -> watch::Receiver<Option<VoteCount>> {
        self.receiver.clone()
    }

    /// Wait for the next change of counts.
    ///
    /// Fails with [`Error::Cancelled`] once the subscription is torn down.
    pub async fn changed(&mut self) -> Result<Option<VoteCount>> {
        self.receiver.changed().await.map_err(|_| Error::Cancelled)?;
        Ok(*self.receiver.borrow_and_update())
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.pool.release(&self.item_id);
    }
}

impl Drop for SubscriptionLease {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for SubscriptionLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionLease")
            .field("item_id", &self.item_id)
            .field("released", &self.released)
            .finish()
    }
}
