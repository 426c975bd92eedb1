//! End-to-end properties of the engine over the in-memory store.

use super::{ChaosConfig, ChaosStore};
use crate::config::{CacheConfig, CircuitBreakerConfig, RetryConfig, VoteSyncConfig};
use crate::connectivity::AlwaysOnline;
use crate::debounce::DebounceOutcome;
use crate::engine::VoteSyncEngine;
use crate::error::Error;
use crate::resilience::CircuitState;
use crate::store::{BackingStore, InMemoryStore};
use crate::types::{VoteCount, VoteType};
use std::sync::Arc;
use std::time::Duration;

async fn engine_over(store: Arc<dyn BackingStore>, config: VoteSyncConfig) -> VoteSyncEngine {
    VoteSyncEngine::new(config, store, Arc::new(AlwaysOnline))
        .await
        .unwrap()
}

fn assert_consistent(store: &InMemoryStore, item_id: &str) {
    let votes = store.votes(item_id).unwrap();
    let up = votes.iter().filter(|v| v.vote_type == VoteType::Up).count() as u64;
    let down = votes.len() as u64 - up;
    match store.aggregate(item_id).unwrap() {
        Some(aggregate) => {
            assert!(aggregate.is_consistent(), "total must equal up + down");
            assert_eq!((aggregate.up_count, aggregate.down_count), (up, down));
        }
        None => assert!(votes.is_empty()),
    }
}

#[tokio::test(start_paused = true)]
async fn test_round_trip() {
    let store = Arc::new(InMemoryStore::new());
    let engine = engine_over(store.clone(), VoteSyncConfig::default()).await;

    engine.submit_vote("t", "alice", VoteType::Down, "Track").await.unwrap();

    assert_eq!(engine.get_identity_vote("t", "alice").await.unwrap(), Some(VoteType::Down));
    assert_eq!(engine.get_vote_counts("t").await.unwrap(), VoteCount::new(0, 1));
}

#[tokio::test(start_paused = true)]
async fn test_invariant_survives_chaos() {
    let inner = Arc::new(InMemoryStore::new());
    let chaos = Arc::new(ChaosStore::new(inner.clone(), ChaosConfig::heavy().with_seed(42)));
    chaos.enable();

    let config = VoteSyncConfig::default()
        .with_breaker_config(CircuitBreakerConfig::new(1_000, Duration::from_secs(1)));
    let engine = Arc::new(engine_over(chaos.clone(), config).await);

    let mut handles = Vec::new();
    for voter in 0..12 {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            let identity = format!("voter-{voter}");
            for round in 0..6 {
                let vote_type = if (voter + round) % 2 == 0 { VoteType::Up } else { VoteType::Down };
                let _ = engine.submit_vote("t", &identity, vote_type, "Track").await;
                if round == 4 && voter % 4 == 0 {
                    let _ = engine.retract_vote("t", &identity).await;
                }
            }
        }));
    }
    for h in handles {
        h.await.unwrap();
    }

    assert!(chaos.stats().failures_injected > 0);
    assert_consistent(&inner, "t");

    chaos.disable();
    let before = inner.aggregate("t").unwrap().map(|a| a.counts()).unwrap_or_default();
    assert_eq!(engine.recount("t").await.unwrap(), before, "recount must find nothing to repair");
}

#[tokio::test(start_paused = true)]
async fn test_cached_counts_expire() {
    let store = Arc::new(InMemoryStore::new());
    let reader = engine_over(store.clone(), VoteSyncConfig::default()).await;
    let writer = engine_over(store.clone(), VoteSyncConfig::default()).await;

    assert_eq!(reader.get_vote_counts("t").await.unwrap(), VoteCount::default());
    writer.submit_vote("t", "alice", VoteType::Up, "Track").await.unwrap();

    // The write went through another engine, so the reader's entry is not
    // invalidated and serves until it expires.
    tokio::time::advance(Duration::from_secs(29)).await;
    assert_eq!(reader.get_vote_counts("t").await.unwrap(), VoteCount::default());

    tokio::time::advance(Duration::from_secs(2)).await;
    assert_eq!(reader.get_vote_counts("t").await.unwrap(), VoteCount::new(1, 0));
    assert_eq!(reader.cache_stats().hits, 1);
}

#[tokio::test(start_paused = true)]
async fn test_breaker_fails_fast_then_recovers() {
    let store = Arc::new(InMemoryStore::new());
    let config = VoteSyncConfig::default().with_retry_config(RetryConfig::disabled());
    let engine = engine_over(store.clone(), config).await;

    store.set_outage(Some(Error::Network("down".into())));
    for identity in ["a", "b", "c"] {
        let result = engine.submit_vote("t", identity, VoteType::Up, "Track").await;
        assert!(matches!(result, Err(Error::Network(_))));
    }
    assert_eq!(engine.breaker_state(), CircuitState::Open);

    let attempts = store.stats().transactions;
    let result = engine.submit_vote("t", "d", VoteType::Up, "Track").await;
    assert!(matches!(result, Err(Error::ServiceUnavailable { .. })));
    assert_eq!(store.stats().transactions, attempts);

    store.set_outage(None);
    tokio::time::advance(Duration::from_secs(30)).await;
    assert_eq!(engine.breaker_state(), CircuitState::HalfOpen);

    engine.submit_vote("t", "d", VoteType::Up, "Track").await.unwrap();
    assert_eq!(engine.breaker_state(), CircuitState::Closed);
    assert_consistent(&store, "t");
}

#[tokio::test(start_paused = true)]
async fn test_many_sessions_share_one_listener() {
    let store = Arc::new(InMemoryStore::new());
    let engine = engine_over(store.clone(), VoteSyncConfig::default()).await;

    let mut sessions = Vec::new();
    for i in 0..5 {
        let identity = format!("user-{i}");
        sessions.push(engine.open_session("t", "Track", Some(&identity)).await.unwrap());
    }
    assert_eq!(store.stats().subscribes, 1);
    assert_eq!(engine.subscriptions().ref_count("t"), 5);

    for session in &sessions {
        let outcome = session.vote(VoteType::Up).await;
        assert!(matches!(outcome, Ok(DebounceOutcome::Committed(_))));
    }
    tokio::time::sleep(Duration::from_millis(1)).await;

    for session in &sessions {
        assert_eq!(session.state().counts, VoteCount::new(5, 0));
    }
    assert_consistent(&store, "t");

    drop(sessions);
    tokio::time::sleep(Duration::from_secs(6)).await;
    assert_eq!(store.stats().active_listeners, 0);
}

#[tokio::test(start_paused = true)]
async fn test_stale_cache_never_shadows_own_write() {
    let store = Arc::new(InMemoryStore::new());
    let config = VoteSyncConfig::default()
        .with_cache_config(CacheConfig::default().with_aggregate_ttl(Duration::from_secs(3600)));
    let engine = engine_over(store.clone(), config).await;

    assert_eq!(engine.get_vote_counts("t").await.unwrap(), VoteCount::default());
    engine.submit_vote("t", "alice", VoteType::Up, "Track").await.unwrap();
    assert_eq!(engine.get_vote_counts("t").await.unwrap(), VoteCount::new(1, 0));

    engine.retract_vote("t", "alice").await.unwrap();
    assert_eq!(engine.get_vote_counts("t").await.unwrap(), VoteCount::default());
}
