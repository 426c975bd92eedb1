//! Network status collaborator.
//!
//! Sessions consult [`NetworkStatus`] before voting so an offline client fails
//! fast instead of waiting on retries, and listen for transitions to clear
//! their offline error once the client reconnects.

use crate::store::Unsubscribe;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::info;

/// Called with the new online state.
pub type StatusCallback = Arc<dyn Fn(bool) + Send + Sync>;

/// Source of the client's connectivity state.
pub trait NetworkStatus: Send + Sync + std::fmt::Debug {
    fn is_online(&self) -> bool;

    /// Register `callback` for every online/offline transition.
    fn on_status_change(&self, callback: StatusCallback) -> Unsubscribe;
}

/// Status that is always online. Used when the host has no connectivity signal.
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysOnline;

impl NetworkStatus for AlwaysOnline {
    fn is_online(&self) -> bool {
        true
    }

    fn on_status_change(&self, _callback: StatusCallback) -> Unsubscribe {
        Unsubscribe::noop()
    }
}

/// Status flipped explicitly by the host application (or a test).
pub struct ManualNetworkStatus {
    online: AtomicBool,
    listeners: Arc<Mutex<HashMap<u64, StatusCallback>>>,
    next_id: AtomicU64,
}

impl ManualNetworkStatus {
    pub fn new(online: bool) -> Self {
        Self {
            online: AtomicBool::new(online),
            listeners: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(0),
        }
    }

    /// Set the state, notifying listeners if it changed.
    pub fn set_online(&self, online: bool) {
        if self.online.swap(online, Ordering::AcqRel) == online {
            return;
        }
        info!(online, "Network status changed");
        // Callbacks run without the listener lock held.
        let callbacks: Vec<StatusCallback> = self.listeners.lock().values().cloned().collect();
        for callback in callbacks {
            callback(online);
        }
    }

    /// Number of registered status listeners.
    pub fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }
}

impl Default for ManualNetworkStatus {
    fn default() -> Self {
        Self::new(true)
    }
}

impl std::fmt::Debug for ManualNetworkStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManualNetworkStatus")
            .field("online", &self.is_online())
            .field("listeners", &self.listeners.lock().len())
            .finish()
    }
}

impl NetworkStatus for ManualNetworkStatus {
    fn is_online(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }

    fn on_status_change(&self, callback: StatusCallback) -> Unsubscribe {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners.lock().insert(id, callback);

        let listeners = Arc::downgrade(&self.listeners);
        Unsubscribe::new(move || {
            if let Some(listeners) = listeners.upgrade() {
                listeners.lock().remove(&id);
            }
        })
    }
}
