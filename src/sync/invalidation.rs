//! Cross-node cache invalidation and version bookkeeping.
//!
//! On every authoritative save the saving node bumps the shared version
//! record, then publishes `DataUpdate` followed by `CacheInvalidate`. Every
//! other node evicts the (player, group) entry from its write-behind cache
//! on receipt, unconditionally: a stale or duplicated message costs one
//! extra reload, never a stale read.

use super::protocol::{self, NodeId, SyncMessage};
use crate::bus::MessageBus;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

/// Shared version records outlive any realistic offline period.
const VERSION_TTL_SECS: u64 = 30 * 24 * 60 * 60;

/// Attempts of the version compare-and-swap loop under contention.
const VERSION_CAS_ATTEMPTS: usize = 8;

/// How long this node waits for its own `CacheInvalidate` to echo back.
const OWN_ECHO_WINDOW: Duration = Duration::from_secs(10);

/// What a host cache should evict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteInvalidation {
    pub player: Uuid,
    /// `None` evicts every group of the player.
    pub group: Option<String>,
    /// Present when triggered by a `DataUpdate`.
    pub version: Option<u64>,
    pub origin: Option<NodeId>,
}

pub type InvalidationHandler = Arc<dyn Fn(&RemoteInvalidation) + Send + Sync>;

/// How a remote version compares to local knowledge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteVersion {
    /// Strictly greater than anything seen or persisted here.
    Newer,
    /// Already known; ahead of what this node persisted.
    Known,
    /// Not ahead of what this node persisted.
    Stale,
}

/// Entries kept when no capacity is given.
pub const DEFAULT_TRACKED_RECORDS: usize = 10_000;

#[derive(Debug, Clone, Copy)]
struct Versions {
    persisted: Option<u64>,
    remote: Option<u64>,
    touched: Instant,
}

impl Versions {
    fn new() -> Self {
        Self {
            persisted: None,
            remote: None,
            touched: Instant::now(),
        }
    }
}

type RecordKey = (Uuid, String);

/// Node-local last-known version per (player, group).
///
/// Both counters only move forward, so observing the same update any
/// number of times leaves the same state as observing it once.
///
/// The table is bounded. Remote saves for players this node never touches
/// arrive constantly, so a new entry beyond capacity evicts the least
/// recently touched record that holds no local save, falling back to the
/// least recently touched record overall.
#[derive(Debug)]
pub struct VersionTracker {
    capacity: usize,
    versions: Mutex<HashMap<RecordKey, Versions>>,
}

impl Default for VersionTracker {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_TRACKED_RECORDS)
    }
}

impl VersionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            versions: Mutex::new(HashMap::new()),
        }
    }

    /// Record a save made by this node. Refuses to move backwards.
    pub fn record_local_save(&self, player: Uuid, group: &str, version: u64) -> bool {
        let mut versions = self.versions.lock();
        let entry = self.entry(&mut versions, player, group);
        if entry.persisted.is_some_and(|current| version < current) {
            return false;
        }
        entry.persisted = Some(version);
        true
    }

    pub fn observe_remote(&self, player: Uuid, group: &str, version: u64) -> RemoteVersion {
        let mut versions = self.versions.lock();
        let entry = self.entry(&mut versions, player, group);
        if entry.persisted.is_some_and(|persisted| version <= persisted) {
            return RemoteVersion::Stale;
        }
        match entry.remote {
            Some(known) if version <= known => RemoteVersion::Known,
            _ => {
                entry.remote = Some(version);
                RemoteVersion::Newer
            }
        }
    }

    fn entry<'a>(
        &self,
        versions: &'a mut HashMap<RecordKey, Versions>,
        player: Uuid,
        group: &str,
    ) -> &'a mut Versions {
        let key = (player, group.to_string());
        if !versions.contains_key(&key) && versions.len() >= self.capacity {
            let victim = versions
                .iter()
                .filter(|(_, v)| v.persisted.is_none())
                .min_by_key(|(_, v)| v.touched)
                .or_else(|| versions.iter().min_by_key(|(_, v)| v.touched))
                .map(|(k, _)| k.clone());
            if let Some(victim) = victim {
                versions.remove(&victim);
            }
        }
        let entry = versions.entry(key).or_insert_with(Versions::new);
        entry.touched = Instant::now();
        entry
    }

    pub fn tracked_count(&self) -> usize {
        self.versions.lock().len()
    }

    /// A remote version strictly newer than what this node persisted.
    pub fn needs_resolution(&self, player: Uuid, group: &str) -> bool {
        self.versions
            .lock()
            .get(&(player, group.to_string()))
            .is_some_and(|v| match (v.remote, v.persisted) {
                (Some(remote), Some(persisted)) => remote > persisted,
                (Some(_), None) => true,
                _ => false,
            })
    }

    pub fn persisted(&self, player: Uuid, group: &str) -> Option<u64> {
        self.versions
            .lock()
            .get(&(player, group.to_string()))
            .and_then(|v| v.persisted)
    }

    pub fn latest_remote(&self, player: Uuid, group: &str) -> Option<u64> {
        self.versions
            .lock()
            .get(&(player, group.to_string()))
            .and_then(|v| v.remote)
    }

    /// Drop everything known about a player (after quit).
    pub fn forget(&self, player: Uuid) {
        self.versions.lock().retain(|(p, _), _| *p != player);
    }
}

/// Encode a shared version record as `"<version>:<ts>"`.
fn encode_version(version: u64, ts: i64) -> String {
    format!("{version}:{ts}")
}

fn decode_version(raw: &str) -> Option<(u64, i64)> {
    let (version, ts) = raw.split_once(':')?;
    Some((version.parse().ok()?, ts.parse().ok()?))
}

pub struct InvalidationBroadcaster {
    node_id: NodeId,
    bus: Arc<dyn MessageBus>,
    channel: String,
    tracker: VersionTracker,
    handlers: RwLock<Vec<InvalidationHandler>>,
    /// Own `CacheInvalidate`s still expected back from the bus.
    own_pending: Mutex<HashMap<(Uuid, Option<String>), (u32, Instant)>>,
}

impl InvalidationBroadcaster {
    pub fn new(
        node_id: NodeId,
        bus: Arc<dyn MessageBus>,
        channel: impl Into<String>,
        max_tracked: usize,
    ) -> Self {
        Self {
            node_id,
            bus,
            channel: channel.into(),
            tracker: VersionTracker::with_capacity(max_tracked),
            handlers: RwLock::new(Vec::new()),
            own_pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn tracker(&self) -> &VersionTracker {
        &self.tracker
    }

    pub fn on_remote_invalidate(&self, handler: InvalidationHandler) {
        self.handlers.write().push(handler);
    }

    /// Announce an authoritative save. Returns `false` when the version
    /// would move backwards or nothing could be published.
    pub async fn notify_saved(&self, player: Uuid, group: &str, version: u64) -> bool {
        if !self.tracker.record_local_save(player, group, version) {
            tracing::warn!(
                player = %player,
                group,
                version,
                "Refusing to announce a save older than one already persisted"
            );
            return false;
        }

        let ts = protocol::now_millis();
        self.store_version(player, group, version, ts).await;

        let update = SyncMessage::DataUpdate {
            player_uuid: player,
            group: group.to_string(),
            version,
            node_id: self.node_id.clone(),
            ts,
        };
        if !protocol::publish(self.bus.as_ref(), &self.channel, &update).await {
            return false;
        }

        let echo_key = (player, Some(group.to_string()));
        self.expect_echo(echo_key.clone());
        let invalidate = SyncMessage::CacheInvalidate {
            player_uuid: player,
            group: Some(group.to_string()),
        };
        let sent = protocol::publish(self.bus.as_ref(), &self.channel, &invalidate).await;
        if !sent {
            self.consume_echo(&echo_key);
        }
        tracing::debug!(player = %player, group, version, "Save announced");
        sent
    }

    /// Raise the shared version record, never lowering it.
    async fn store_version(&self, player: Uuid, group: &str, version: u64, ts: i64) -> bool {
        let key = protocol::version_key(player, group);
        let value = encode_version(version, ts);
        for _ in 0..VERSION_CAS_ATTEMPTS {
            match self.bus.get(&key).await {
                None => {
                    if self
                        .bus
                        .set_if_absent_with_ttl(&key, &value, VERSION_TTL_SECS)
                        .await
                    {
                        return true;
                    }
                    if !self.bus.is_connected() {
                        return false;
                    }
                }
                Some(current) => {
                    if decode_version(&current).is_some_and(|(stored, _)| stored >= version) {
                        return false;
                    }
                    if self
                        .bus
                        .compare_and_swap(&key, &current, &value, VERSION_TTL_SECS)
                        .await
                    {
                        return true;
                    }
                }
            }
        }
        tracing::debug!(player = %player, group, version, "Version record contended; giving up");
        false
    }

    /// Shared `(version, ts)` for a record, if any.
    pub async fn stored_version(&self, player: Uuid, group: &str) -> Option<(u64, i64)> {
        let raw = self.bus.get(&protocol::version_key(player, group)).await?;
        decode_version(&raw)
    }

    /// Route an inbound message. Other variants are ignored.
    pub fn handle(&self, message: &SyncMessage) {
        match message {
            SyncMessage::DataUpdate {
                player_uuid,
                group,
                version,
                node_id,
                ..
            } => self.handle_data_update(*player_uuid, group, *version, node_id),
            SyncMessage::CacheInvalidate { player_uuid, group } => {
                self.handle_cache_invalidate(*player_uuid, group.as_deref());
            }
            _ => {}
        }
    }

    pub fn handle_data_update(&self, player: Uuid, group: &str, version: u64, origin: &NodeId) {
        if *origin == self.node_id {
            return;
        }
        let seen = self.tracker.observe_remote(player, group, version);
        tracing::debug!(player = %player, group, version, origin = %origin, ?seen, "Remote save observed");
        self.fire(&RemoteInvalidation {
            player,
            group: Some(group.to_string()),
            version: Some(version),
            origin: Some(origin.clone()),
        });
    }

    pub fn handle_cache_invalidate(&self, player: Uuid, group: Option<&str>) {
        if self.consume_echo(&(player, group.map(str::to_string))) {
            return;
        }
        self.fire(&RemoteInvalidation {
            player,
            group: group.map(str::to_string),
            version: None,
            origin: None,
        });
    }

    fn fire(&self, invalidation: &RemoteInvalidation) {
        let handlers = self.handlers.read().clone();
        for handler in handlers {
            handler(invalidation);
        }
    }

    fn expect_echo(&self, key: (Uuid, Option<String>)) {
        let mut pending = self.own_pending.lock();
        let entry = pending.entry(key).or_insert((0, Instant::now()));
        entry.0 += 1;
        entry.1 = Instant::now();
    }

    /// `true` when `key` matches one of this node's own recent invalidations.
    fn consume_echo(&self, key: &(Uuid, Option<String>)) -> bool {
        let mut pending = self.own_pending.lock();
        pending.retain(|_, (_, at)| at.elapsed() <= OWN_ECHO_WINDOW);
        let Some(entry) = pending.get_mut(key) else {
            return false;
        };
        entry.0 -= 1;
        if entry.0 == 0 {
            pending.remove(key);
        }
        true
    }
}
