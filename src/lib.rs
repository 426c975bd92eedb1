//! Vote synchronization engine.
//!
//! This crate keeps up/down votes on items consistent between many clients and
//! a shared document store:
//! - **Transactional writes** keep every item's aggregate equal to the tally
//!   of its vote rows
//! - **Moka** backs a TTL read cache that every confirmed write invalidates
//! - **Pooled live subscriptions** fan one store subscription per item out to
//!   every interested client
//! - **Debounced, optimistic sessions** turn a burst of toggles into one write
//!   and roll back when it fails
//! - **A circuit breaker and classified retries** protect the store
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use votesync::{InMemoryStore, ManualNetworkStatus, VoteSyncConfig, VoteSyncEngine, VoteType};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = Arc::new(InMemoryStore::new());
//!     let network = Arc::new(ManualNetworkStatus::new(true));
//!     let engine = VoteSyncEngine::new(VoteSyncConfig::default(), store, network).await?;
//!
//!     // Writes run as one store transaction
//!     let outcome = engine.submit_vote("track-1", "alice", VoteType::Up, "Intro").await?;
//!     println!("counts: {:?}", outcome.counts);
//!
//!     // Client sessions apply votes optimistically and debounce them
//!     let session = engine.open_session("track-1", "Intro", Some("bob")).await?;
//!     session.vote(VoteType::Down).await?;
//!     println!("session: {:?}", session.state());
//!
//!     engine.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │     ClientVoteSession (optimistic state)    │
//! └─────────────────────────────────────────────┘
//!           │ vote()                ▲ live counts
//!           ▼                       │
//! ┌──────────────────┐    ┌──────────────────────┐
//! │  VoteDebouncer   │    │   SubscriptionPool   │
//! └──────────────────┘    └──────────────────────┘
//!           │                       ▲
//!           ▼                       │
//! ┌──────────────────┐    ┌─────────┴────────────┐
//! │VotingCoordinator │───►│    AggregateCache    │
//! └──────────────────┘    └──────────────────────┘
//!           │
//!           ▼
//! ┌─────────────────────────────────────────────┐
//! │  ResilienceLayer (breaker + retry) ──► store │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! # Consistency Model
//!
//! - **Aggregates**: `up + down == total` and both buckets equal the vote rows,
//!   after every committed transaction
//! - **Reads**: may be up to one TTL stale, never staler than the last write
//!   made through the same engine
//! - **Sessions**: show the optimistic value while a write is pending and the
//!   last confirmed value after a failure

pub mod cache;
pub mod config;
pub mod connectivity;
pub mod coordinator;
pub mod debounce;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod resilience;
pub mod session;
pub mod store;
pub mod subscription;
pub mod testing;
pub mod types;

// Re-export main types for convenience
pub use engine::{VoteSubscription, VoteSyncEngine};
pub use config::{
    CacheConfig, CircuitBreakerConfig, DebounceConfig, RetryConfig, RetryPolicy,
    SubscriptionConfig, VoteSyncConfig,
};
pub use error::{Error, ErrorKind, Result};
pub use types::{Aggregate, Document, DocumentKey, Vote, VoteCount, VoteKey, VoteOutcome, VoteType};

// Re-export component types
pub use cache::{AggregateCache, CacheStats};
pub use coordinator::VotingCoordinator;
pub use debounce::{DebounceOutcome, VoteDebouncer};
pub use resilience::{CircuitBreaker, CircuitState, ResilienceLayer};
pub use session::{ClientVoteSession, SessionState};
pub use subscription::{CountFeed, SubscriptionLease, SubscriptionPool};

// Re-export collaborator types
pub use connectivity::{AlwaysOnline, ManualNetworkStatus, NetworkStatus};
pub use store::{BackingStore, InMemoryStore, StoreStats, Transaction, Unsubscribe};

// Re-export metrics types
pub use metrics::{Counter, Gauge, LabeledCounter, MetricsSnapshot, VoteMetrics};
