//! Per-(identity, item) vote debouncing.
//!
//! A vote is held for a quiet window before it is written. Another vote for
//! the same key within the window replaces it, so a burst of toggles becomes a
//! single store write carrying the last value.
//!
//! Writes for one key never overlap: a vote whose window elapses while an
//! earlier write for the key is still running (for example, retrying) waits
//! for it, so the store always ends with the last submitted vote.

use crate::config::DebounceConfig;
use crate::error::{Error, Result};
use crate::metrics::VoteMetrics;
use crate::types::{VoteKey, VoteOutcome, VoteType};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// How a debounced submission resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DebounceOutcome {
    /// This submission was the one written.
    Committed(VoteOutcome),
    /// A later submission for the same key replaced this one.
    Superseded,
}

struct Pending {
    generation: u64,
    vote_type: VoteType,
    waiter: oneshot::Sender<Result<DebounceOutcome>>,
    timer: JoinHandle<()>,
}

type WriteLock = Arc<tokio::sync::Mutex<()>>;

struct DebounceInner {
    pending: Mutex<HashMap<VoteKey, Pending>>,
    /// Per-key write serialization, present while a write runs or waits.
    writers: Mutex<HashMap<VoteKey, WriteLock>>,
    next_generation: AtomicU64,
    metrics: Arc<VoteMetrics>,
}

impl DebounceInner {
    fn writer(&self, key: &VoteKey) -> WriteLock {
        Arc::clone(self.writers.lock().entry(key.clone()).or_default())
    }

    /// Drop the key's write lock once nobody holds or waits on it.
    fn forget_writer(&self, key: &VoteKey) {
        let mut writers = self.writers.lock();
        if writers.get(key).is_some_and(|w| Arc::strong_count(w) == 1) {
            writers.remove(key);
        }
    }

    fn update_gauge(&self, pending: &HashMap<VoteKey, Pending>) {
        self.metrics.debounce_pending.set(pending.len() as i64);
    }
}

/// Debouncer shared by all sessions of an engine.
#[derive(Clone)]
pub struct VoteDebouncer {
    inner: Arc<DebounceInner>,
    window: Duration,
}

impl VoteDebouncer {
    pub fn new(config: &DebounceConfig, metrics: Arc<VoteMetrics>) -> Self {
        Self {
            inner: Arc::new(DebounceInner {
                pending: Mutex::new(HashMap::new()),
                writers: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(0),
                metrics,
            }),
            window: config.window,
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Submit `vote_type` for `key`.
    ///
    /// Resolves once this submission is written (`Committed`), replaced by a
    /// newer one (`Superseded`), or cancelled (`Err(Cancelled)`). `perform`
    /// runs at most once, after the window elapses with no newer submission.
    /// Once started, `perform` is never interrupted by later submissions, and
    /// a later submission's `perform` starts only after it has finished.
    pub async fn submit<F, Fut>(
        &self,
        key: VoteKey,
        vote_type: VoteType,
        perform: F,
    ) -> Result<DebounceOutcome>
    where
        F: FnOnce(VoteType) -> Fut + Send + 'static,
        Fut: Future<Output = Result<VoteOutcome>> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);

        let replaced = {
            let mut pending = self.inner.pending.lock();

            // Spawned under the lock so the entry exists before the timer can look for it.
            let timer = {
                let inner = Arc::clone(&self.inner);
                let key = key.clone();
                let window = self.window;
                tokio::spawn(async move {
                    tokio::time::sleep(window).await;
                    fire(inner, key, generation, perform).await;
                })
            };

            let replaced = pending.insert(
                key.clone(),
                Pending {
                    generation,
                    vote_type,
                    waiter: tx,
                    timer,
                },
            );
            self.inner.update_gauge(&pending);
            replaced
        };

        if let Some(previous) = replaced {
            previous.timer.abort();
            let _ = previous.waiter.send(Ok(DebounceOutcome::Superseded));
            self.inner.metrics.debounce_superseded.inc();
            trace!(key = %key, replaced = %previous.vote_type, with = %vote_type, "Pending vote superseded");
        }

        rx.await.map_err(|_| Error::Cancelled)?
    }

    /// Cancel the pending vote for `key`; its submitter sees `Err(Cancelled)`.
    /// Returns whether anything was pending.
    pub fn cancel(&self, key: &VoteKey) -> bool {
        let removed = {
            let mut pending = self.inner.pending.lock();
            let removed = pending.remove(key);
            self.inner.update_gauge(&pending);
            removed
        };
        match removed {
            Some(p) => {
                self.reject(p);
                debug!(key = %key, "Pending vote cancelled");
                true
            }
            None => false,
        }
    }

    /// Cancel every pending vote.
    pub fn cancel_all(&self) -> usize {
        let drained: Vec<Pending> = {
            let mut pending = self.inner.pending.lock();
            let drained = pending.drain().map(|(_, p)| p).collect();
            self.inner.update_gauge(&pending);
            drained
        };
        let count = drained.len();
        for p in drained {
            self.reject(p);
        }
        if count > 0 {
            debug!(count, "Cancelled all pending votes");
        }
        count
    }

    /// Whether a vote for `key` is waiting for its window to elapse.
    pub fn is_pending(&self, key: &VoteKey) -> bool {
        self.inner.pending.lock().contains_key(key)
    }

    /// The vote waiting for `key`, if any.
    pub fn pending_vote(&self, key: &VoteKey) -> Option<VoteType> {
        self.inner.pending.lock().get(key).map(|p| p.vote_type)
    }

    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().len()
    }

    /// Run `write` for `key` outside the debounce window, ordered after any
    /// write for the key that is already running or waiting.
    pub async fn write_now<T, Fut>(&self, key: &VoteKey, write: Fut) -> T
    where
        Fut: Future<Output = T>,
    {
        let guard = self.inner.writer(key).lock_owned().await;
        let output = write.await;
        drop(guard);
        self.inner.forget_writer(key);
        output
    }

    /// Whether a write for `key` is running or waiting for an earlier one.
    pub fn is_writing(&self, key: &VoteKey) -> bool {
        self.inner.writers.lock().contains_key(key)
    }

    fn reject(&self, pending: Pending) {
        pending.timer.abort();
        let _ = pending.waiter.send(Err(Error::Cancelled));
        self.inner.metrics.debounce_cancelled.inc();
    }
}

impl std::fmt::Debug for VoteDebouncer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VoteDebouncer")
            .field("window", &self.window)
            .field("pending", &self.pending_count())
            .finish()
    }
}

async fn fire<F, Fut>(inner: Arc<DebounceInner>, key: VoteKey, generation: u64, perform: F)
where
    F: FnOnce(VoteType) -> Fut,
    Fut: Future<Output = Result<VoteOutcome>>,
{
    let (entry, writer) = {
        let mut pending = inner.pending.lock();
        let current = pending.get(&key).is_some_and(|p| p.generation == generation);
        if !current {
            return;
        }
        let entry = pending.remove(&key);
        inner.update_gauge(&pending);
        (entry, inner.writer(&key))
    };
    let Some(entry) = entry else {
        return;
    };

    let write = writer.lock_owned().await;
    debug!(key = %key, vote_type = %entry.vote_type, "Debounce window elapsed, writing vote");
    let result = perform(entry.vote_type).await.map(DebounceOutcome::Committed);
    drop(write);
    inner.forget_writer(&key);
    let _ = entry.waiter.send(result);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::VoteCount;

    fn debouncer() -> VoteDebouncer {
        VoteDebouncer::new(&DebounceConfig::default(), Arc::new(VoteMetrics::new()))
    }

    type Writes = Arc<Mutex<Vec<VoteType>>>;

    fn written(vote_type: VoteType) -> VoteOutcome {
        VoteOutcome {
            previous: None,
            current: vote_type,
            counts: VoteCount::default(),
            changed: true,
        }
    }

    fn recording(writes: &Writes) -> impl FnOnce(VoteType) -> std::future::Ready<Result<VoteOutcome>> + Send + 'static {
        let sink = writes.clone();
        move |vote_type| {
            sink.lock().push(vote_type);
            std::future::ready(Ok(written(vote_type)))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_writes_last_value_once() {
        let debouncer = debouncer();
        let writes = Writes::default();
        let key = VoteKey::new("t", "alice");

        let mut handles = Vec::new();
        for vote_type in [VoteType::Up, VoteType::Down, VoteType::Up, VoteType::Down] {
            let d = debouncer.clone();
            let key = key.clone();
            let perform = recording(&writes);
            handles.push(tokio::spawn(async move { d.submit(key, vote_type, perform).await }));
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        let mut outcomes = Vec::new();
        for h in handles {
            outcomes.push(h.await.unwrap().unwrap());
        }

        assert_eq!(*writes.lock(), vec![VoteType::Down]);
        assert!(outcomes[..3].iter().all(|o| *o == DebounceOutcome::Superseded));
        assert!(matches!(
            &outcomes[3],
            DebounceOutcome::Committed(o) if o.current == VoteType::Down
        ));
        assert_eq!(debouncer.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_waits_for_window() {
        let debouncer = debouncer();
        let writes = Writes::default();
        let key = VoteKey::new("t", "alice");

        let d = debouncer.clone();
        let k = key.clone();
        let perform = recording(&writes);
        let handle = tokio::spawn(async move { d.submit(k, VoteType::Up, perform).await });

        tokio::time::sleep(Duration::from_millis(499)).await;
        assert!(writes.lock().is_empty());
        assert_eq!(debouncer.pending_vote(&key), Some(VoteType::Up));

        tokio::time::sleep(Duration::from_millis(2)).await;
        assert_eq!(*writes.lock(), vec![VoteType::Up]);
        assert!(handle.await.unwrap().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_rejects_waiter() {
        let debouncer = debouncer();
        let writes = Writes::default();
        let key = VoteKey::new("t", "alice");

        let d = debouncer.clone();
        let k = key.clone();
        let perform = recording(&writes);
        let handle = tokio::spawn(async move { d.submit(k, VoteType::Up, perform).await });
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(debouncer.cancel(&key));
        assert_eq!(handle.await.unwrap(), Err(Error::Cancelled));

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(writes.lock().is_empty());
        assert!(!debouncer.cancel(&key));
    }

    #[tokio::test(start_paused = true)]
    async fn test_keys_are_independent() {
        let debouncer = debouncer();
        let writes = Writes::default();

        let a = debouncer.submit(VoteKey::new("t", "alice"), VoteType::Up, recording(&writes));
        let b = debouncer.submit(VoteKey::new("t", "bob"), VoteType::Down, recording(&writes));
        let (a, b) = tokio::join!(a, b);

        assert!(matches!(a, Ok(DebounceOutcome::Committed(_))));
        assert!(matches!(b, Ok(DebounceOutcome::Committed(_))));
        assert_eq!(writes.lock().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_perform_error_reaches_submitter() {
        let debouncer = debouncer();
        let result = debouncer
            .submit(VoteKey::new("t", "alice"), VoteType::Up, |_| async {
                Err(Error::Permission("rules".into()))
            })
            .await;
        assert_eq!(result, Err(Error::Permission("rules".into())));
    }

    #[tokio::test(start_paused = true)]
    async fn test_newer_vote_waits_for_running_write() {
        let debouncer = debouncer();
        let writes = Writes::default();
        let key = VoteKey::new("t", "alice");

        let sink = writes.clone();
        let slow = move |vote_type: VoteType| async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            sink.lock().push(vote_type);
            Ok::<_, Error>(written(vote_type))
        };
        let d = debouncer.clone();
        let k = key.clone();
        let first = tokio::spawn(async move { d.submit(k, VoteType::Up, slow).await });

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(debouncer.is_writing(&key));
        let d = debouncer.clone();
        let k = key.clone();
        let perform = recording(&writes);
        let second = tokio::spawn(async move { d.submit(k, VoteType::Down, perform).await });

        // The second window has elapsed but the first write is still running.
        tokio::time::sleep(Duration::from_millis(700)).await;
        assert!(writes.lock().is_empty());

        assert!(matches!(first.await.unwrap(), Ok(DebounceOutcome::Committed(_))));
        assert!(matches!(second.await.unwrap(), Ok(DebounceOutcome::Committed(_))));
        assert_eq!(*writes.lock(), vec![VoteType::Up, VoteType::Down]);
        assert!(!debouncer.is_writing(&key));
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_now_runs_after_running_write() {
        let debouncer = debouncer();
        let writes = Writes::default();
        let key = VoteKey::new("t", "alice");

        let sink = writes.clone();
        let slow = move |vote_type: VoteType| async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            sink.lock().push(vote_type);
            Ok::<_, Error>(written(vote_type))
        };
        let d = debouncer.clone();
        let k = key.clone();
        let pending = tokio::spawn(async move { d.submit(k, VoteType::Up, slow).await });
        tokio::time::sleep(Duration::from_millis(600)).await;

        let sink = writes.clone();
        debouncer
            .write_now(&key, async move { sink.lock().push(VoteType::Down) })
            .await;

        assert_eq!(*writes.lock(), vec![VoteType::Up, VoteType::Down]);
        assert!(pending.await.unwrap().is_ok());
        assert!(!debouncer.is_writing(&key));
    }
}
