//! Testing utilities for the vote engine.
//!
//! This module provides:
//! - [`ChaosStore`], a store wrapper injecting failures and latency
//! - end-to-end property tests of the engine (test builds only)
//!
//! # Chaos Testing Presets
//!
//! - `ChaosConfig::none()` - No failures (default)
//! - `ChaosConfig::light()` - Low probability of failures
//! - `ChaosConfig::moderate()` - Medium failure rates
//! - `ChaosConfig::heavy()` - High failure rates for stress testing
//!
//! # Example
//!
//! ```rust,ignore
//! use votesync::testing::{ChaosConfig, ChaosStore};
//! use votesync::InMemoryStore;
//! use std::sync::Arc;
//!
//! let inner = Arc::new(InMemoryStore::new());
//! let store = Arc::new(ChaosStore::new(inner.clone(), ChaosConfig::moderate().with_seed(42)));
//! store.enable();
//! // hand `store` to VoteSyncEngine::new and check invariants on `inner`
//! ```

mod chaos;

#[cfg(test)]
mod engine_properties;

pub use chaos::{ChaosConfig, ChaosStats, ChaosStore};
