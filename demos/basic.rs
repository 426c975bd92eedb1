//! Basic example of using the vote engine over the in-memory store.

use std::sync::Arc;
use std::time::Duration;
use votesync::{
    DebounceOutcome, InMemoryStore, ManualNetworkStatus, VoteSyncConfig, VoteSyncEngine, VoteType,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter("votesync=debug,info")
        .init();

    let store = Arc::new(InMemoryStore::new());
    let network = Arc::new(ManualNetworkStatus::new(true));
    let config = VoteSyncConfig::default();

    println!("Starting vote engine...");
    let engine = VoteSyncEngine::new(config, store.clone(), network.clone()).await?;

    // Live updates for one item
    let subscription = engine
        .subscribe_to_vote_updates("track-1", |counts| {
            println!("  [live] up={} down={} total={}", counts.up, counts.down, counts.total);
        })
        .await?;

    // Direct writes
    println!("\n--- Direct Votes ---");
    for (identity, vote_type) in [("alice", VoteType::Up), ("bob", VoteType::Up), ("carol", VoteType::Down)] {
        let outcome = engine.submit_vote("track-1", identity, vote_type, "Intro").await?;
        println!("{identity} voted {vote_type:?}: changed={} counts={:?}", outcome.changed, outcome.counts);
    }

    // Voting the same way twice is a no-op
    let outcome = engine.submit_vote("track-1", "alice", VoteType::Up, "Intro").await?;
    println!("alice again: changed={}", outcome.changed);

    // A session toggling quickly only writes its final choice
    println!("\n--- Client Session ---");
    let session = engine.open_session("track-1", "Intro", Some("dave")).await?;
    let (a, b, c) = tokio::join!(
        session.vote(VoteType::Up),
        session.vote(VoteType::Down),
        session.vote(VoteType::Up),
    );
    for result in [a, b, c] {
        match result? {
            DebounceOutcome::Committed(outcome) => println!("committed: {:?}", outcome.counts),
            DebounceOutcome::Superseded => println!("superseded by a later toggle"),
        }
    }
    println!("session state: {:?}", session.state());

    // Going offline makes votes fail fast
    network.set_online(false);
    if let Err(e) = session.vote(VoteType::Down).await {
        println!("offline vote rejected: {}", e.user_message());
    }
    network.set_online(true);
    session.retry().await?;
    println!("after retry: {:?}", session.state());

    session.close();
    drop(subscription);
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Show stats
    let stats = engine.cache_stats();
    println!("\nCache stats:");
    println!("  Aggregate entries: {}", stats.aggregate_entries);
    println!("  Hits: {}", stats.hits);
    println!("  Misses: {}", stats.misses);

    let store_stats = store.stats();
    println!("\nStore stats:");
    println!("  Reads: {}", store_stats.reads);
    println!("  Transactions: {}", store_stats.transactions);
    println!("  Commits: {}", store_stats.commits);

    println!("\n--- Metrics ---");
    print!("{}", engine.metrics().to_prometheus());

    engine.shutdown().await;
    println!("\nEngine shut down.");
    Ok(())
}
