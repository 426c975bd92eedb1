//! Client-side vote session for one (item, identity) pair.
//!
//! A session applies votes optimistically, writes them through the shared
//! debouncer, and rolls back to the last confirmed state if the write fails.
//! It holds a lease on the item's live subscription for its whole lifetime so
//! its counts follow changes made by other voters.

use crate::connectivity::NetworkStatus;
use crate::coordinator::VotingCoordinator;
use crate::debounce::{DebounceOutcome, VoteDebouncer};
use crate::error::{Error, Result};
use crate::resilience::CircuitState;
use crate::store::Unsubscribe;
use crate::subscription::SubscriptionLease;
use crate::types::{VoteCount, VoteKey, VoteType};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Value snapshot of a session, as a UI would render it.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionState {
    pub current_vote: Option<VoteType>,
    pub counts: VoteCount,
    /// A write is in flight or waiting in the debounce window.
    pub pending: bool,
    pub last_error: Option<Error>,
    /// Last connectivity state reported for the client.
    pub online: bool,
    /// An attempt was refused while offline and has not been resent.
    pub unsent: bool,
}

impl SessionState {
    /// Whether the last failure is worth retrying.
    pub fn retryable(&self) -> bool {
        self.unsent || self.last_error.as_ref().is_some_and(|e| e.is_retryable() || *e == Error::Offline)
    }

    /// User-facing text for the last failure.
    pub fn error_message(&self) -> Option<&'static str> {
        self.last_error.as_ref().map(Error::user_message)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Attempt {
    Vote(VoteType),
    Retract,
}

struct Inner {
    state: SessionState,
    /// Last confirmed (vote, counts), taken when a burst of writes starts.
    confirmed: Option<(Option<VoteType>, VoteCount)>,
    /// Incremented by every attempt; only the latest settles `pending`.
    seq: u64,
    last_attempt: Option<Attempt>,
    closed: bool,
}

impl Inner {
    /// Record the state a burst would roll back to and start a new attempt.
    fn begin(&mut self, attempt: Attempt) -> u64 {
        if !self.state.pending {
            self.confirmed = Some((self.state.current_vote, self.state.counts));
        }
        let previous = self.state.current_vote;
        let next = match attempt {
            Attempt::Vote(vote_type) => Some(vote_type),
            Attempt::Retract => None,
        };
        if previous != next {
            self.state.counts = self.state.counts.transition(previous, next);
            self.state.current_vote = next;
        }
        self.state.pending = true;
        self.state.last_error = None;
        self.state.unsent = false;
        self.last_attempt = Some(attempt);
        self.seq += 1;
        self.seq
    }

    fn confirm(&mut self, seq: u64, vote: Option<VoteType>, counts: VoteCount) {
        if seq != self.seq {
            return;
        }
        self.state.current_vote = vote;
        self.state.counts = counts;
        self.state.pending = false;
        self.confirmed = None;
    }

    /// Record a connectivity change. Reconnecting clears an offline error;
    /// the refused attempt stays available to `retry`.
    fn set_online(&mut self, online: bool) {
        self.state.online = online;
        if online && self.state.last_error == Some(Error::Offline) {
            self.state.last_error = None;
        }
    }

    fn roll_back(&mut self, seq: u64, error: Option<Error>) {
        if seq != self.seq {
            return;
        }
        if let Some((vote, counts)) = self.confirmed.take() {
            self.state.current_vote = vote;
            self.state.counts = counts;
        }
        self.state.pending = false;
        self.state.last_error = error;
    }
}

/// Vote session of one identity (or an anonymous reader) on one item.
pub struct ClientVoteSession {
    item_id: String,
    item_label: String,
    identity: Option<String>,
    coordinator: Arc<VotingCoordinator>,
    debouncer: VoteDebouncer,
    network: Arc<dyn NetworkStatus>,
    lease: Mutex<SubscriptionLease>,
    live: watch::Receiver<Option<VoteCount>>,
    inner: Arc<Mutex<Inner>>,
    watcher: JoinHandle<()>,
    status: Mutex<Unsubscribe>,
}

impl ClientVoteSession {
    /// Assemble a session from an acquired lease and the initial reads.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        item_id: String,
        item_label: String,
        identity: Option<String>,
        coordinator: Arc<VotingCoordinator>,
        debouncer: VoteDebouncer,
        network: Arc<dyn NetworkStatus>,
        lease: SubscriptionLease,
        current_vote: Option<VoteType>,
        counts: VoteCount,
    ) -> Self {
        let inner = Arc::new(Mutex::new(Inner {
            state: SessionState {
                current_vote,
                counts: lease.counts().unwrap_or(counts),
                pending: false,
                last_error: None,
                online: network.is_online(),
                unsent: false,
            },
            confirmed: None,
            seq: 0,
            last_attempt: None,
            closed: false,
        }));

        let live = lease.watch();
        let watcher = tokio::spawn(follow_live_counts(lease.watch(), Arc::clone(&inner)));
        let status = {
            let inner = Arc::downgrade(&inner);
            network.on_status_change(Arc::new(move |online: bool| {
                if let Some(inner) = inner.upgrade() {
                    inner.lock().set_online(online);
                }
            }))
        };

        Self {
            item_id,
            item_label,
            identity,
            coordinator,
            debouncer,
            network,
            lease: Mutex::new(lease),
            live,
            inner,
            watcher,
            status: Mutex::new(status),
        }
    }

    pub fn item_id(&self) -> &str {
        &self.item_id
    }

    pub fn identity(&self) -> Option<&str> {
        self.identity.as_deref()
    }

    /// Whether the session can only read.
    pub fn is_read_only(&self) -> bool {
        self.identity.is_none()
    }

    pub fn state(&self) -> SessionState {
        self.inner.lock().state.clone()
    }

    /// Receiver of the item's live counts.
    pub fn live_counts(&self) -> watch::Receiver<Option<VoteCount>> {
        self.live.clone()
    }

    /// Voting should be disabled in the UI while the store is failing fast.
    pub fn voting_disabled(&self) -> bool {
        self.coordinator.resilience().state() == CircuitState::Open
    }

    /// Vote `vote_type`.
    ///
    /// The session state changes immediately; the write happens after the
    /// debounce window. A later vote within the window supersedes this one,
    /// which then resolves with [`DebounceOutcome::Superseded`].
    pub async fn vote(&self, vote_type: VoteType) -> Result<DebounceOutcome> {
        let identity = self.writable(Attempt::Vote(vote_type))?;
        let seq = self.inner.lock().begin(Attempt::Vote(vote_type));
        debug!(item_id = %self.item_id, identity_id = %identity, vote_type = %vote_type, "Optimistic vote applied");

        let coordinator = Arc::clone(&self.coordinator);
        let item_id = self.item_id.clone();
        let label = self.item_label.clone();
        let identity_id = identity.clone();
        let result = self
            .debouncer
            .submit(VoteKey::new(&self.item_id, identity), vote_type, move |latest| async move {
                coordinator
                    .submit_vote(&item_id, &identity_id, latest, &label)
                    .await
            })
            .await;

        match &result {
            Ok(DebounceOutcome::Committed(outcome)) => {
                let counts = self.latest_counts().unwrap_or(outcome.counts);
                self.inner.lock().confirm(seq, Some(outcome.current), counts);
            }
            Ok(DebounceOutcome::Superseded) => {}
            Err(Error::Cancelled) => self.inner.lock().roll_back(seq, None),
            Err(err) => {
                warn!(item_id = %self.item_id, error = %err, "Vote failed, rolling back");
                self.inner.lock().roll_back(seq, Some(err.clone()));
            }
        }
        result
    }

    /// Withdraw the identity's vote, cancelling any vote still in the
    /// debounce window. A vote already being written finishes first. Returns
    /// the vote removed from the store.
    pub async fn retract(&self) -> Result<Option<VoteType>> {
        let identity = self.writable(Attempt::Retract)?;
        let seq = self.inner.lock().begin(Attempt::Retract);
        let key = VoteKey::new(&self.item_id, &identity);
        self.debouncer.cancel(&key);

        let result = self
            .debouncer
            .write_now(&key, self.coordinator.retract_vote(&self.item_id, &identity))
            .await;
        match &result {
            Ok(_) => {
                let mut inner = self.inner.lock();
                let counts = self.latest_counts().unwrap_or(inner.state.counts);
                inner.confirm(seq, None, counts);
            }
            Err(err) => {
                warn!(item_id = %self.item_id, error = %err, "Retraction failed, rolling back");
                self.inner.lock().roll_back(seq, Some(err.clone()));
            }
        }
        result
    }

    /// Re-issue the last attempt after a failure.
    pub async fn retry(&self) -> Result<()> {
        let attempt = {
            let inner = self.inner.lock();
            let failed = inner.state.last_error.is_some() || inner.state.unsent;
            match inner.last_attempt {
                Some(attempt) if failed => attempt,
                _ => return Err(Error::Validation("nothing to retry".into())),
            }
        };
        match attempt {
            Attempt::Vote(vote_type) => self.vote(vote_type).await.map(|_| ()),
            Attempt::Retract => self.retract().await.map(|_| ()),
        }
    }

    /// Cancel any pending vote and release the live subscription.
    pub fn close(&self) {
        let already_closed = std::mem::replace(&mut self.inner.lock().closed, true);
        if already_closed {
            return;
        }
        if let Some(identity) = &self.identity {
            self.debouncer.cancel(&VoteKey::new(&self.item_id, identity));
        }
        self.watcher.abort();
        self.status.lock().unsubscribe();
        self.lease.lock().release();
        debug!(item_id = %self.item_id, "Vote session closed");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Check the session may write, recording offline failures for `retry`.
    fn writable(&self, attempt: Attempt) -> Result<String> {
        let Some(identity) = self.identity.clone() else {
            return Err(Error::Authentication("must authenticate to vote".into()));
        };
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(Error::Cancelled);
        }
        if !self.network.is_online() {
            inner.state.online = false;
            inner.state.last_error = Some(Error::Offline);
            inner.state.unsent = true;
            inner.last_attempt = Some(attempt);
            return Err(Error::Offline);
        }
        Ok(identity)
    }

    fn latest_counts(&self) -> Option<VoteCount> {
        *self.live.borrow()
    }
}

impl Drop for ClientVoteSession {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for ClientVoteSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientVoteSession")
            .field("item_id", &self.item_id)
            .field("identity", &self.identity)
            .field("state", &self.state())
            .finish()
    }
}

/// Copy live counts into the session while no write of its own is pending.
async fn follow_live_counts(mut live: watch::Receiver<Option<VoteCount>>, inner: Arc<Mutex<Inner>>) {
    while live.changed().await.is_ok() {
        let counts = *live.borrow_and_update();
        if let Some(counts) = counts {
            let mut guard = inner.lock();
            if !guard.state.pending {
                guard.state.counts = counts;
            }
        }
    }
}
