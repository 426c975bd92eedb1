//! In-process backing store.

use super::{BackingStore, ChangeCallback, ErrorCallback, Transaction, TransactionBody, Unsubscribe};
use crate::error::{Error, Result};
use crate::types::{Aggregate, Document, DocumentKey, Vote};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

struct Listener {
    id: u64,
    on_change: ChangeCallback,
    on_error: ErrorCallback,
}

type ListenerMap = HashMap<DocumentKey, Vec<Listener>>;

/// Operation counters of an [`InMemoryStore`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub reads: u64,
    pub transactions: u64,
    pub commits: u64,
    pub subscribes: u64,
    pub active_listeners: usize,
}

/// Document store held in memory.
///
/// Documents are stored encoded, the way they would cross a network boundary.
/// Transactions hold the write lock for the duration of their body, which
/// serializes concurrent writers. Failures can be injected to exercise the
/// engine's error handling.
pub struct InMemoryStore {
    documents: RwLock<HashMap<DocumentKey, Bytes>>,
    listeners: Arc<Mutex<ListenerMap>>,
    next_listener_id: AtomicU64,

    /// Errors returned by the next calls, one per call.
    injected: Mutex<VecDeque<Error>>,
    /// Error returned by every call while set.
    outage: Mutex<Option<Error>>,
    /// Simulated round-trip time.
    latency: Mutex<Duration>,

    reads: AtomicU64,
    transactions: AtomicU64,
    commits: AtomicU64,
    subscribes: AtomicU64,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            documents: RwLock::new(HashMap::new()),
            listeners: Arc::new(Mutex::new(HashMap::new())),
            next_listener_id: AtomicU64::new(1),
            injected: Mutex::new(VecDeque::new()),
            outage: Mutex::new(None),
            latency: Mutex::new(Duration::ZERO),
            reads: AtomicU64::new(0),
            transactions: AtomicU64::new(0),
            commits: AtomicU64::new(0),
            subscribes: AtomicU64::new(0),
        }
    }

    /// Make the next call (read, transaction or subscribe) fail with `error`.
    /// Repeated calls queue further failures.
    pub fn fail_next(&self, error: Error) {
        self.injected.lock().push_back(error);
    }

    /// Fail every call with `error` until cleared with `None`.
    pub fn set_outage(&self, error: Option<Error>) {
        *self.outage.lock() = error;
    }

    /// Delay every call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    /// Deliver `error` to every subscriber of `key`.
    pub fn emit_error(&self, key: &DocumentKey, error: Error) {
        let callbacks: Vec<ErrorCallback> = self
            .listeners
            .lock()
            .get(key)
            .map(|ls| ls.iter().map(|l| l.on_error.clone()).collect())
            .unwrap_or_default();
        for callback in callbacks {
            callback(error.clone());
        }
    }

    /// Write a document directly, bypassing transactions but notifying
    /// subscribers. Used to seed or corrupt state in tests.
    pub fn put_document(&self, key: DocumentKey, document: Document) -> Result<()> {
        let bytes = document.to_bytes()?;
        self.documents.write().insert(key.clone(), bytes);
        self.notify(vec![(key, Some(document))]);
        Ok(())
    }

    /// Current aggregate of an item, read without going through the engine.
    pub fn aggregate(&self, item_id: &str) -> Result<Option<Aggregate>> {
        self.decode(&DocumentKey::aggregate(item_id))?
            .map(Document::into_aggregate)
            .transpose()
    }

    /// Current vote rows of an item, read without going through the engine.
    pub fn votes(&self, item_id: &str) -> Result<Vec<Vote>> {
        let documents = self.documents.read();
        collect_votes(&documents, item_id)
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            reads: self.reads.load(Ordering::Relaxed),
            transactions: self.transactions.load(Ordering::Relaxed),
            commits: self.commits.load(Ordering::Relaxed),
            subscribes: self.subscribes.load(Ordering::Relaxed),
            active_listeners: self.listeners.lock().values().map(Vec::len).sum(),
        }
    }

    fn decode(&self, key: &DocumentKey) -> Result<Option<Document>> {
        self.documents
            .read()
            .get(key)
            .map(|bytes| Document::from_bytes(bytes))
            .transpose()
    }

    /// Simulate the round trip and consume any injected failure.
    async fn round_trip(&self) -> Result<()> {
        let latency = *self.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if let Some(err) = self.outage.lock().clone() {
            return Err(err);
        }
        match self.injected.lock().pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn notify(&self, changes: Vec<(DocumentKey, Option<Document>)>) {
        let mut deliveries = Vec::new();
        {
            let listeners = self.listeners.lock();
            for (key, document) in changes {
                if let Some(ls) = listeners.get(&key) {
                    for l in ls {
                        deliveries.push((l.on_change.clone(), document.clone()));
                    }
                }
            }
        }
        // Callbacks run without holding any store lock.
        for (callback, document) in deliveries {
            callback(document);
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InMemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryStore")
            .field("documents", &self.documents.read().len())
            .field("stats", &self.stats())
            .finish()
    }
}

fn collect_votes(documents: &HashMap<DocumentKey, Bytes>, item_id: &str) -> Result<Vec<Vote>> {
    documents
        .iter()
        .filter(|(key, _)| matches!(key, DocumentKey::Vote { item_id: i, .. } if i == item_id))
        .map(|(_, bytes)| Document::from_bytes(bytes)?.into_vote())
        .collect()
}

/// Staged writes of one transaction. `None` marks a delete.
struct MemoryTransaction<'a> {
    committed: &'a HashMap<DocumentKey, Bytes>,
    staged: HashMap<DocumentKey, Option<Document>>,
}

impl MemoryTransaction<'_> {
    fn exists(&mut self, key: &DocumentKey) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }
}

impl Transaction for MemoryTransaction<'_> {
    fn get(&mut self, key: &DocumentKey) -> Result<Option<Document>> {
        if let Some(staged) = self.staged.get(key) {
            return Ok(staged.clone());
        }
        self.committed
            .get(key)
            .map(|bytes| Document::from_bytes(bytes))
            .transpose()
    }

    fn set(&mut self, key: DocumentKey, document: Document) -> Result<()> {
        self.staged.insert(key, Some(document));
        Ok(())
    }

    fn update(&mut self, key: DocumentKey, document: Document) -> Result<()> {
        if !self.exists(&key)? {
            return Err(Error::Validation(format!("cannot update missing document {key}")));
        }
        self.staged.insert(key, Some(document));
        Ok(())
    }

    fn delete(&mut self, key: &DocumentKey) -> Result<()> {
        self.staged.insert(key.clone(), None);
        Ok(())
    }

    fn votes_for_item(&mut self, item_id: &str) -> Result<Vec<Vote>> {
        let mut votes: HashMap<DocumentKey, Vote> = collect_votes(self.committed, item_id)?
            .into_iter()
            .map(|v| (DocumentKey::vote(v.item_id.clone(), v.identity_id.clone()), v))
            .collect();
        for (key, staged) in &self.staged {
            if key.item_id() != item_id || !matches!(key, DocumentKey::Vote { .. }) {
                continue;
            }
            match staged {
                Some(doc) => {
                    votes.insert(key.clone(), doc.clone().into_vote()?);
                }
                None => {
                    votes.remove(key);
                }
            }
        }
        Ok(votes.into_values().collect())
    }
}

#[async_trait]
impl BackingStore for InMemoryStore {
    async fn get_by_id(&self, key: &DocumentKey) -> Result<Option<Document>> {
        self.round_trip().await?;
        self.reads.fetch_add(1, Ordering::Relaxed);
        trace!(key = %key, "Store read");
        self.decode(key)
    }

    async fn run_transaction(&self, body: TransactionBody<'_>) -> Result<()> {
        self.round_trip().await?;
        self.transactions.fetch_add(1, Ordering::Relaxed);

        let changes = {
            let mut documents = self.documents.write();
            let staged = {
                let mut tx = MemoryTransaction {
                    committed: &documents,
                    staged: HashMap::new(),
                };
                body(&mut tx)?;
                tx.staged
            };

            let mut changes = Vec::with_capacity(staged.len());
            let mut encoded = Vec::with_capacity(staged.len());
            for (key, document) in staged {
                let bytes = document.as_ref().map(Document::to_bytes).transpose()?;
                encoded.push((key.clone(), bytes));
                changes.push((key, document));
            }
            for (key, bytes) in encoded {
                match bytes {
                    Some(bytes) => documents.insert(key, bytes),
                    None => documents.remove(&key),
                };
            }
            changes
        };

        if !changes.is_empty() {
            self.commits.fetch_add(1, Ordering::Relaxed);
            debug!(writes = changes.len(), "Store transaction committed");
        }
        self.notify(changes);
        Ok(())
    }

    async fn subscribe(
        &self,
        key: &DocumentKey,
        on_change: ChangeCallback,
        on_error: ErrorCallback,
    ) -> Result<Unsubscribe> {
        self.round_trip().await?;
        self.subscribes.fetch_add(1, Ordering::Relaxed);

        let id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);
        let snapshot = {
            let mut listeners = self.listeners.lock();
            listeners.entry(key.clone()).or_default().push(Listener {
                id,
                on_change: on_change.clone(),
                on_error,
            });
            self.decode(key)?
        };
        on_change(snapshot);
        debug!(key = %key, listener_id = id, "Store subscription opened");

        let listeners = Arc::downgrade(&self.listeners);
        let key = key.clone();
        Ok(Unsubscribe::new(move || {
            if let Some(listeners) = listeners.upgrade() {
                let mut listeners = listeners.lock();
                if let Some(ls) = listeners.get_mut(&key) {
                    ls.retain(|l| l.id != id);
                    if ls.is_empty() {
                        listeners.remove(&key);
                    }
                }
                debug!(key = %key, listener_id = id, "Store subscription closed");
            }
        }))
    }
}
