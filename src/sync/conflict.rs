//! Reconciliation of two divergent copies of one player record.
//!
//! Runs before a node loads a player whose stored version moved past what
//! this node last persisted. `latest-wins` picks a whole record; `merge`
//! decides per addressable field and flags fields both sides touched.
//! Neither strategy discards a candidate: losing whole records stay with
//! the storage layer as history, and flagged field pairs go to the
//! [`ConflictResolver`]'s bounded log.

use super::protocol::{self, NodeId};
use crate::config::ConflictStrategy;
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use uuid::Uuid;

/// One addressable piece of a player record.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FieldPath {
    Main(u16),
    Armor(u16),
    Offhand(u16),
    Ender(u16),
    /// Scalar stat (health, balance, xp, ...).
    Stat(String),
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Main(slot) => write!(f, "main[{slot}]"),
            Self::Armor(slot) => write!(f, "armor[{slot}]"),
            Self::Offhand(slot) => write!(f, "offhand[{slot}]"),
            Self::Ender(slot) => write!(f, "ender[{slot}]"),
            Self::Stat(name) => write!(f, "stat.{name}"),
        }
    }
}

/// Opaque serialized field content plus when this copy last changed it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldValue {
    /// `None` is an empty slot.
    pub value: Option<String>,
    /// Epoch millis.
    pub modified_at: i64,
}

impl FieldValue {
    pub fn new(value: impl Into<String>, modified_at: i64) -> Self {
        Self {
            value: Some(value.into()),
            modified_at,
        }
    }

    pub fn empty(modified_at: i64) -> Self {
        Self {
            value: None,
            modified_at,
        }
    }
}

/// A versioned copy of one (player, group) record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordSnapshot {
    pub player: Uuid,
    pub group: String,
    pub version: u64,
    /// Epoch millis of the save that produced this version.
    pub timestamp: i64,
    pub node_id: NodeId,
    pub fields: BTreeMap<FieldPath, FieldValue>,
}

impl RecordSnapshot {
    pub fn new(
        player: Uuid,
        group: impl Into<String>,
        version: u64,
        timestamp: i64,
        node_id: NodeId,
    ) -> Self {
        Self {
            player,
            group: group.into(),
            version,
            timestamp,
            node_id,
            fields: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, path: FieldPath, value: FieldValue) -> Self {
        self.fields.insert(path, value);
        self
    }

    /// Total order used by `latest-wins`: version, then timestamp, then
    /// node id (greater wins).
    fn precedence(&self) -> (u64, i64, &NodeId) {
        (self.version, self.timestamp, &self.node_id)
    }
}

/// Both candidates for one field that could not be decided safely.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldConflict {
    pub path: FieldPath,
    pub local: FieldValue,
    pub remote: FieldValue,
}

/// Side record kept for operator review.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictRecord {
    pub player: Uuid,
    pub group: String,
    pub local_version: u64,
    pub remote_version: u64,
    pub local_node: NodeId,
    pub remote_node: NodeId,
    pub detected_at: i64,
    pub fields: Vec<FieldConflict>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Load the remote record as is.
    AppliedRemote,
    /// The local record stands.
    KeptLocal,
    /// Field-wise combination of both.
    Merged(RecordSnapshot),
    /// Combined record (local value kept for flagged fields) plus the
    /// candidates that need review.
    ConflictFlagged {
        merged: RecordSnapshot,
        record: ConflictRecord,
    },
}

impl Resolution {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AppliedRemote => "applied-remote",
            Self::KeptLocal => "kept-local",
            Self::Merged(_) => "merged",
            Self::ConflictFlagged { .. } => "conflict-flagged",
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::ConflictFlagged { .. })
    }
}

pub struct ConflictResolver {
    strategy: ConflictStrategy,
    log: Mutex<VecDeque<ConflictRecord>>,
    capacity: usize,
}

impl ConflictResolver {
    pub fn new(strategy: ConflictStrategy, log_capacity: usize) -> Self {
        Self {
            strategy,
            log: Mutex::new(VecDeque::new()),
            capacity: log_capacity.max(1),
        }
    }

    pub fn strategy(&self) -> ConflictStrategy {
        self.strategy
    }

    pub fn resolve(&self, local: &RecordSnapshot, remote: &RecordSnapshot) -> Resolution {
        let resolution = match self.strategy {
            ConflictStrategy::LatestWins => latest_wins(local, remote),
            ConflictStrategy::Merge => merge(local, remote),
        };

        match &resolution {
            Resolution::ConflictFlagged { record, .. } => {
                let paths: Vec<String> = record.fields.iter().map(|c| c.path.to_string()).collect();
                tracing::warn!(
                    player = %record.player,
                    group = %record.group,
                    local_version = record.local_version,
                    remote_version = record.remote_version,
                    remote_node = %record.remote_node,
                    fields = ?paths,
                    "Player data conflict flagged for review"
                );
                self.push(record.clone());
            }
            other => tracing::debug!(
                player = %local.player,
                group = %local.group,
                local_version = local.version,
                remote_version = remote.version,
                strategy = self.strategy.as_str(),
                outcome = other.kind(),
                "Player data reconciled"
            ),
        }
        resolution
    }

    fn push(&self, record: ConflictRecord) {
        let mut log = self.log.lock();
        if log.len() >= self.capacity {
            log.pop_front();
        }
        log.push_back(record);
    }

    /// Flagged conflicts still in the log, oldest first.
    pub fn recent_conflicts(&self) -> Vec<ConflictRecord> {
        self.log.lock().iter().cloned().collect()
    }

    /// Hand the log over (e.g. to persistent storage) and clear it.
    pub fn drain_conflicts(&self) -> Vec<ConflictRecord> {
        self.log.lock().drain(..).collect()
    }
}

fn latest_wins(local: &RecordSnapshot, remote: &RecordSnapshot) -> Resolution {
    match remote.precedence().cmp(&local.precedence()) {
        Ordering::Greater => Resolution::AppliedRemote,
        Ordering::Less | Ordering::Equal => Resolution::KeptLocal,
    }
}

fn merge(local: &RecordSnapshot, remote: &RecordSnapshot) -> Resolution {
    let remote_higher = remote.precedence() > local.precedence();
    let mut fields = BTreeMap::new();
    let mut conflicts = Vec::new();
    let (mut took_local, mut took_remote) = (false, false);

    for path in local.fields.keys().chain(remote.fields.keys()) {
        if fields.contains_key(path) {
            continue;
        }
        let chosen = match (local.fields.get(path), remote.fields.get(path)) {
            (Some(l), Some(r)) if l.value == r.value => l.clone(),
            (Some(l), Some(r)) if l.modified_at > remote.timestamp => {
                conflicts.push(FieldConflict {
                    path: path.clone(),
                    local: l.clone(),
                    remote: r.clone(),
                });
                took_local = true;
                l.clone()
            }
            (Some(_), Some(r)) if remote_higher => {
                took_remote = true;
                r.clone()
            }
            (Some(l), Some(_)) => {
                took_local = true;
                l.clone()
            }
            // Present on one side only: keep it.
            (Some(l), None) => {
                took_local = true;
                l.clone()
            }
            (None, Some(r)) => {
                took_remote = true;
                r.clone()
            }
            (None, None) => continue,
        };
        fields.insert(path.clone(), chosen);
    }

    let newer = if remote_higher { remote } else { local };
    let merged = RecordSnapshot {
        player: local.player,
        group: local.group.clone(),
        version: local.version.max(remote.version),
        timestamp: local.timestamp.max(remote.timestamp),
        node_id: newer.node_id.clone(),
        fields,
    };

    if !conflicts.is_empty() {
        let record = ConflictRecord {
            player: local.player,
            group: local.group.clone(),
            local_version: local.version,
            remote_version: remote.version,
            local_node: local.node_id.clone(),
            remote_node: remote.node_id.clone(),
            detected_at: protocol::now_millis(),
            fields: conflicts,
        };
        return Resolution::ConflictFlagged { merged, record };
    }

    match (took_local, took_remote) {
        (true, true) => Resolution::Merged(merged),
        (false, true) => Resolution::AppliedRemote,
        // Nothing differed: the newer side wins the metadata.
        (false, false) if remote_higher => Resolution::AppliedRemote,
        _ => Resolution::KeptLocal,
    }
}
