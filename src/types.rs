//! Core types used throughout the vote synchronization engine.

use crate::error::{Error, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

/// An identity's choice on an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VoteType {
    Up,
    Down,
}

impl VoteType {
    pub fn as_str(&self) -> &'static str {
        match self {
            VoteType::Up => "up",
            VoteType::Down => "down",
        }
    }

    /// The other choice.
    pub fn opposite(&self) -> VoteType {
        match self {
            VoteType::Up => VoteType::Down,
            VoteType::Down => VoteType::Up,
        }
    }
}

impl fmt::Display for VoteType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VoteType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "up" => Ok(VoteType::Up),
            "down" => Ok(VoteType::Down),
            other => Err(Error::Validation(format!(
                "vote type must be \"up\" or \"down\", got {other:?}"
            ))),
        }
    }
}

/// One identity's current vote on one item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vote {
    pub item_id: String,
    pub identity_id: String,
    pub vote_type: VoteType,
    /// Milliseconds since Unix epoch.
    pub updated_at_ms: u64,
}

/// The per-item running tally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Aggregate {
    pub item_id: String,
    pub up_count: u64,
    pub down_count: u64,
    pub total: u64,
    /// Milliseconds since Unix epoch.
    pub last_updated_ms: u64,
    /// Human-readable label of the item (e.g. the track title).
    pub item_label: String,
    /// Incremented by every committed write of the aggregate.
    pub revision: u64,
}

impl Aggregate {
    /// An empty aggregate, used when an item has never been voted on.
    pub fn empty(item_id: impl Into<String>, item_label: impl Into<String>) -> Self {
        Self {
            item_id: item_id.into(),
            up_count: 0,
            down_count: 0,
            total: 0,
            last_updated_ms: 0,
            item_label: item_label.into(),
            revision: 0,
        }
    }

    /// Mark the aggregate as written at `now_ms`.
    pub fn stamp(&mut self, now_ms: u64) {
        self.last_updated_ms = now_ms;
        self.revision += 1;
    }

    /// Apply a vote transition: remove `previous` (if any) and add `current`.
    pub fn apply(&mut self, previous: Option<VoteType>, current: Option<VoteType>) {
        if let Some(old) = previous {
            match old {
                VoteType::Up => self.up_count = self.up_count.saturating_sub(1),
                VoteType::Down => self.down_count = self.down_count.saturating_sub(1),
            }
        }
        if let Some(new) = current {
            match new {
                VoteType::Up => self.up_count += 1,
                VoteType::Down => self.down_count += 1,
            }
        }
        self.total = self.up_count + self.down_count;
    }

    /// Whether `total` agrees with the partition.
    pub fn is_consistent(&self) -> bool {
        self.total == self.up_count + self.down_count
    }

    pub fn counts(&self) -> VoteCount {
        VoteCount {
            up: self.up_count,
            down: self.down_count,
            total: self.total,
        }
    }
}

/// Read-only projection of an [`Aggregate`]; the only view callers see.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct VoteCount {
    pub up: u64,
    pub down: u64,
    pub total: u64,
}

impl VoteCount {
    pub fn new(up: u64, down: u64) -> Self {
        Self {
            up,
            down,
            total: up + down,
        }
    }

    /// Counts after moving one vote from `previous` to `current`.
    pub fn transition(self, previous: Option<VoteType>, current: Option<VoteType>) -> Self {
        let mut up = self.up;
        let mut down = self.down;
        match previous {
            Some(VoteType::Up) => up = up.saturating_sub(1),
            Some(VoteType::Down) => down = down.saturating_sub(1),
            None => {}
        }
        match current {
            Some(VoteType::Up) => up += 1,
            Some(VoteType::Down) => down += 1,
            None => {}
        }
        Self::new(up, down)
    }
}

/// Key of a per-identity vote entry: the (item, identity) pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VoteKey {
    pub item_id: String,
    pub identity_id: String,
}

impl VoteKey {
    pub fn new(item_id: impl Into<String>, identity_id: impl Into<String>) -> Self {
        Self {
            item_id: item_id.into(),
            identity_id: identity_id.into(),
        }
    }
}

impl fmt::Display for VoteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.item_id, self.identity_id)
    }
}

/// Address of a document in the backing store.
///
/// Vote documents are keyed deterministically by the (item, identity) pair, so
/// a transaction can look up the existing vote without a separate query.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DocumentKey {
    Vote { item_id: String, identity_id: String },
    Aggregate { item_id: String },
}

impl DocumentKey {
    pub fn vote(item_id: impl Into<String>, identity_id: impl Into<String>) -> Self {
        Self::Vote {
            item_id: item_id.into(),
            identity_id: identity_id.into(),
        }
    }

    pub fn aggregate(item_id: impl Into<String>) -> Self {
        Self::Aggregate {
            item_id: item_id.into(),
        }
    }

    /// The item this document belongs to.
    pub fn item_id(&self) -> &str {
        match self {
            DocumentKey::Vote { item_id, .. } | DocumentKey::Aggregate { item_id } => item_id,
        }
    }

    /// Stable string id, `votes/<item>/<identity>` or `aggregates/<item>`.
    pub fn doc_id(&self) -> String {
        match self {
            DocumentKey::Vote {
                item_id,
                identity_id,
            } => format!("votes/{item_id}/{identity_id}"),
            DocumentKey::Aggregate { item_id } => format!("aggregates/{item_id}"),
        }
    }
}

impl From<&VoteKey> for DocumentKey {
    fn from(key: &VoteKey) -> Self {
        DocumentKey::vote(key.item_id.clone(), key.identity_id.clone())
    }
}

impl fmt::Display for DocumentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.doc_id())
    }
}

/// A stored document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Document {
    Vote(Vote),
    Aggregate(Aggregate),
}

impl Document {
    /// Serialize document to bytes.
    pub fn to_bytes(&self) -> Result<Bytes> {
        Ok(Bytes::from(bincode::serialize(self)?))
    }

    /// Deserialize document from bytes.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(data)?)
    }

    pub fn into_vote(self) -> Result<Vote> {
        match self {
            Document::Vote(vote) => Ok(vote),
            Document::Aggregate(agg) => Err(Error::Serialization(format!(
                "expected vote document, found aggregate for {}",
                agg.item_id
            ))),
        }
    }

    pub fn into_aggregate(self) -> Result<Aggregate> {
        match self {
            Document::Aggregate(agg) => Ok(agg),
            Document::Vote(vote) => Err(Error::Serialization(format!(
                "expected aggregate document, found vote for {}/{}",
                vote.item_id, vote.identity_id
            ))),
        }
    }
}

/// What a committed vote transaction did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoteOutcome {
    /// Vote held before the transaction.
    pub previous: Option<VoteType>,
    /// Vote held after the transaction.
    pub current: VoteType,
    /// Aggregate counts after the transaction.
    pub counts: VoteCount,
    /// False when the transaction was an idempotent no-op.
    pub changed: bool,
}

/// Current wall-clock time in milliseconds since Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
