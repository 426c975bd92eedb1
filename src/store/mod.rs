//! Backing store collaborator.
//!
//! The engine persists two logical collections, votes and aggregates, through
//! the [`BackingStore`] trait. A store must provide:
//! - point reads by [`DocumentKey`]
//! - atomic, all-or-nothing transactions over a synchronous body
//! - push subscriptions delivering the current document and every change
//!
//! [`InMemoryStore`] is a complete in-process implementation used by tests and
//! the demo; production deployments plug in a client for their document store.

mod memory;

pub use memory::{InMemoryStore, StoreStats};

use crate::error::{Error, Result};
use crate::types::{Document, DocumentKey, Vote};
use async_trait::async_trait;
use std::sync::Arc;

/// Called with the latest document (or `None` if it was deleted).
pub type ChangeCallback = Arc<dyn Fn(Option<Document>) + Send + Sync>;

/// Called when a live subscription reports an error.
pub type ErrorCallback = Arc<dyn Fn(Error) + Send + Sync>;

/// Body of a transaction. It may be run again if the store detects a conflict,
/// so it must only communicate through the [`Transaction`] handle and state it
/// resets on entry.
pub type TransactionBody<'a> = &'a mut (dyn FnMut(&mut dyn Transaction) -> Result<()> + Send);

/// Handle passed to a transaction body.
///
/// Reads observe the transaction's own pending writes. Nothing is visible to
/// other readers until the body returns `Ok` and the store commits.
pub trait Transaction: Send {
    /// Read a document.
    fn get(&mut self, key: &DocumentKey) -> Result<Option<Document>>;

    /// Create or replace a document.
    fn set(&mut self, key: DocumentKey, document: Document) -> Result<()>;

    /// Replace an existing document; fails if it does not exist.
    fn update(&mut self, key: DocumentKey, document: Document) -> Result<()>;

    /// Delete a document; deleting a missing document is a no-op.
    fn delete(&mut self, key: &DocumentKey) -> Result<()>;

    /// All vote documents of an item.
    fn votes_for_item(&mut self, item_id: &str) -> Result<Vec<Vote>>;
}

/// Handle that cancels a store subscription.
///
/// Calling [`unsubscribe`](Self::unsubscribe) more than once is harmless.
pub struct Unsubscribe(Option<Box<dyn FnOnce() + Send>>);

impl Unsubscribe {
    pub fn new(f: impl FnOnce() + Send + 'static) -> Self {
        Self(Some(Box::new(f)))
    }

    /// A handle with nothing to cancel.
    pub fn noop() -> Self {
        Self(None)
    }

    pub fn unsubscribe(&mut self) {
        if let Some(f) = self.0.take() {
            f();
        }
    }

    /// Whether the handle has not yet been used.
    pub fn is_active(&self) -> bool {
        self.0.is_some()
    }
}

impl std::fmt::Debug for Unsubscribe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Unsubscribe")
            .field("active", &self.is_active())
            .finish()
    }
}

/// Document store used by the engine.
#[async_trait]
pub trait BackingStore: Send + Sync + std::fmt::Debug {
    /// Read a single document.
    async fn get_by_id(&self, key: &DocumentKey) -> Result<Option<Document>>;

    /// Run `body` atomically. Either every write of the body is committed or
    /// none is; an `Err` from the body aborts the transaction.
    async fn run_transaction(&self, body: TransactionBody<'_>) -> Result<()>;

    /// Subscribe to a document. `on_change` receives the current value once
    /// the subscription is established, then every committed change.
    async fn subscribe(
        &self,
        key: &DocumentKey,
        on_change: ChangeCallback,
        on_error: ErrorCallback,
    ) -> Result<Unsubscribe>;
}
