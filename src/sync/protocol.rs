//! Wire protocol for the player sync channel.
//!
//! Every message is one JSON object with an explicit `type` discriminant and
//! camelCase fields. Decoding never fails loudly: malformed payloads and
//! unknown tags are dropped at debug level, unknown extra fields are ignored.

use crate::bus::MessageBus;
use crate::error::SyncError;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Key pattern matching every player lock (and transfer guard).
pub const LOCK_KEY_PATTERN: &str = "lock:*";

const LOCK_PREFIX: &str = "lock:";
const TRANSFER_SUFFIX: &str = ":transfer";

// ── Node identity ───────────────────────────────────────────────

/// Identity of one running server process.
///
/// Valid for the process lifetime only; never persisted.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// `<hostname>-<8 hex chars>`, unique per process start.
    pub fn generate() -> Self {
        let host = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| "node".to_string());
        let suffix = Uuid::new_v4().simple().to_string();
        Self(format!("{host}-{}", &suffix[..8]))
    }

    /// Environment override first, then the configured id, then a fresh one.
    pub fn resolve(configured: Option<&str>) -> Self {
        let from_env = std::env::var(crate::config::NODE_ID_ENV)
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());
        if let Some(id) = from_env {
            return Self(id);
        }
        match configured.map(str::trim).filter(|v| !v.is_empty()) {
            Some(id) => Self(id.to_string()),
            None => Self::generate(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

// ── Messages ────────────────────────────────────────────────────

/// All messages exchanged on the sync channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum SyncMessage {
    /// A node took the lock for a player.
    AcquireLock {
        player_uuid: Uuid,
        node_id: NodeId,
        ts: i64,
    },

    /// A node gave up (or was swept of) a player's lock.
    ReleaseLock { player_uuid: Uuid, node_id: NodeId },

    /// Ownership moved between nodes without a zero-holder window.
    TransferLock {
        player_uuid: Uuid,
        from_node: NodeId,
        to_node: NodeId,
    },

    /// An authoritative save bumped a (player, group) version.
    DataUpdate {
        player_uuid: Uuid,
        group: String,
        version: u64,
        node_id: NodeId,
        /// Epoch millis of the save. Older senders omit it.
        #[serde(default)]
        ts: i64,
    },

    /// Evict a player's entry (or one group of it) from local caches.
    CacheInvalidate {
        player_uuid: Uuid,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        group: Option<String>,
    },

    Heartbeat {
        node_id: NodeId,
        ts: i64,
        player_count: u32,
    },

    /// Outcome of an acquire decision.
    LockAck {
        player_uuid: Uuid,
        node_id: NodeId,
        granted: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        current_holder: Option<NodeId>,
    },

    /// The sender is stopping; its locks can be reclaimed now.
    ServerShutdown { node_id: NodeId, ts: i64 },
}

impl SyncMessage {
    /// Node that produced the message, when the message names one.
    pub fn origin(&self) -> Option<&NodeId> {
        match self {
            Self::AcquireLock { node_id, .. }
            | Self::ReleaseLock { node_id, .. }
            | Self::DataUpdate { node_id, .. }
            | Self::Heartbeat { node_id, .. }
            | Self::LockAck { node_id, .. }
            | Self::ServerShutdown { node_id, .. } => Some(node_id),
            Self::TransferLock { from_node, .. } => Some(from_node),
            Self::CacheInvalidate { .. } => None,
        }
    }

    /// Player the message concerns, if any.
    pub fn player(&self) -> Option<Uuid> {
        match self {
            Self::AcquireLock { player_uuid, .. }
            | Self::ReleaseLock { player_uuid, .. }
            | Self::TransferLock { player_uuid, .. }
            | Self::DataUpdate { player_uuid, .. }
            | Self::CacheInvalidate { player_uuid, .. }
            | Self::LockAck { player_uuid, .. } => Some(*player_uuid),
            Self::Heartbeat { .. } | Self::ServerShutdown { .. } => None,
        }
    }

    /// Wire tag, for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AcquireLock { .. } => "acquire_lock",
            Self::ReleaseLock { .. } => "release_lock",
            Self::TransferLock { .. } => "transfer_lock",
            Self::DataUpdate { .. } => "data_update",
            Self::CacheInvalidate { .. } => "cache_invalidate",
            Self::Heartbeat { .. } => "heartbeat",
            Self::LockAck { .. } => "lock_ack",
            Self::ServerShutdown { .. } => "server_shutdown",
        }
    }
}

/// Serialize a message for the wire.
pub fn encode(message: &SyncMessage) -> String {
    // Only strings, integers and booleans: serialization cannot fail.
    serde_json::to_string(message).unwrap_or_default()
}

/// Parse a wire payload. Malformed input yields `None`.
pub fn decode(raw: &str) -> Option<SyncMessage> {
    match serde_json::from_str(raw) {
        Ok(message) => Some(message),
        Err(e) => {
            let err = SyncError::Protocol(e.to_string());
            tracing::debug!(len = raw.len(), kind = err.kind(), "Dropping sync message: {err}");
            None
        }
    }
}

/// Encode and publish on `channel`.
pub(crate) async fn publish(bus: &dyn MessageBus, channel: &str, message: &SyncMessage) -> bool {
    let sent = bus.publish(channel, &encode(message)).await;
    if !sent {
        tracing::debug!(kind = message.kind(), "Sync message not published");
    }
    sent
}

/// Wall-clock epoch millis.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// ── Key layout ──────────────────────────────────────────────────

pub fn lock_key(player: Uuid) -> String {
    format!("{LOCK_PREFIX}{player}")
}

pub fn transfer_guard_key(player: Uuid) -> String {
    format!("{LOCK_PREFIX}{player}{TRANSFER_SUFFIX}")
}

pub fn version_key(player: Uuid, group: &str) -> String {
    format!("version:{player}:{group}")
}

/// Player id of a plain lock key. Transfer guards and foreign keys yield `None`.
pub fn player_from_lock_key(key: &str) -> Option<Uuid> {
    let rest = key.strip_prefix(LOCK_PREFIX)?;
    if rest.ends_with(TRANSFER_SUFFIX) {
        return None;
    }
    Uuid::parse_str(rest).ok()
}
