//! Liveness tracking and dead-node lock reclamation.
//!
//! Each node publishes a heartbeat every interval and records every
//! heartbeat it hears (its own included). A peer unseen for longer than the
//! dead interval is presumed crashed: its locks are swept and a
//! `ReleaseLock` goes out for each one so blocked waiters wake at once.
//!
//! Both tables here are advisory. They start empty on boot, are rebuilt
//! from traffic, and never override what the bus itself says.

use super::lock::LockCoordinator;
use super::protocol::{self, NodeId, SyncMessage};
use crate::bus::MessageBus;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

/// Last thing heard from one node.
#[derive(Debug, Clone, Copy)]
pub struct NodeHeartbeat {
    pub last_seen: Instant,
    /// Sender's wall clock, epoch millis.
    pub remote_ts: i64,
    pub player_count: u32,
}

pub struct HeartbeatMonitor {
    node_id: NodeId,
    bus: Arc<dyn MessageBus>,
    channel: String,
    locks: Arc<LockCoordinator>,
    dead_interval: Duration,
    max_tracked: usize,
    max_holders: usize,
    table: RwLock<HashMap<NodeId, NodeHeartbeat>>,
    /// Advisory holder per player, with when it was last asserted.
    holders: RwLock<HashMap<Uuid, (NodeId, Instant)>>,
}

impl HeartbeatMonitor {
    pub fn new(
        node_id: NodeId,
        bus: Arc<dyn MessageBus>,
        channel: impl Into<String>,
        locks: Arc<LockCoordinator>,
        dead_interval: Duration,
        max_tracked: usize,
        max_holders: usize,
    ) -> Self {
        Self {
            node_id,
            bus,
            channel: channel.into(),
            locks,
            dead_interval,
            max_tracked: max_tracked.max(1),
            max_holders: max_holders.max(1),
            table: RwLock::new(HashMap::new()),
            holders: RwLock::new(HashMap::new()),
        }
    }

    /// Publish this node's heartbeat and record it locally.
    pub async fn beat(&self, player_count: u32) -> bool {
        let ts = protocol::now_millis();
        self.record_heartbeat(&self.node_id, ts, player_count);
        protocol::publish(
            self.bus.as_ref(),
            &self.channel,
            &SyncMessage::Heartbeat {
                node_id: self.node_id.clone(),
                ts,
                player_count,
            },
        )
        .await
    }

    /// Note that `node` was heard from now.
    ///
    /// The table is bounded: a new node beyond capacity evicts the entry
    /// seen longest ago. This node's own entry is never evicted.
    pub fn record_heartbeat(&self, node: &NodeId, remote_ts: i64, player_count: u32) {
        let entry = NodeHeartbeat {
            last_seen: Instant::now(),
            remote_ts,
            player_count,
        };
        let mut table = self.table.write();
        if !table.contains_key(node) && table.len() >= self.max_tracked {
            let oldest = table
                .iter()
                .filter(|(id, _)| **id != self.node_id)
                .min_by_key(|(_, beat)| beat.last_seen)
                .map(|(id, _)| id.clone());
            if let Some(oldest) = oldest {
                table.remove(&oldest);
            }
        }
        let is_new = table.insert(node.clone(), entry).is_none();
        drop(table);
        if is_new && *node != self.node_id {
            tracing::info!(node = %node, "Node joined sync cluster");
        }
    }

    /// Update the advisory tables from one inbound message.
    pub fn observe(&self, message: &SyncMessage) {
        match message {
            SyncMessage::Heartbeat {
                node_id,
                ts,
                player_count,
            } => self.record_heartbeat(node_id, *ts, *player_count),
            SyncMessage::AcquireLock {
                player_uuid,
                node_id,
                ..
            } => self.note_holder(*player_uuid, node_id),
            SyncMessage::ReleaseLock {
                player_uuid,
                node_id,
            } => {
                let mut holders = self.holders.write();
                if holders.get(player_uuid).is_some_and(|(holder, _)| holder == node_id) {
                    holders.remove(player_uuid);
                }
            }
            SyncMessage::TransferLock {
                player_uuid,
                to_node,
                ..
            } => self.note_holder(*player_uuid, to_node),
            SyncMessage::ServerShutdown { node_id, .. } => self.forget(node_id),
            SyncMessage::DataUpdate { .. }
            | SyncMessage::CacheInvalidate { .. }
            | SyncMessage::LockAck { .. } => {}
        }
    }

    /// Locks that lapse by TTL never produce a `ReleaseLock`, so the view
    /// is capped: a new player beyond capacity evicts the entry asserted
    /// longest ago.
    fn note_holder(&self, player: Uuid, node: &NodeId) {
        let mut holders = self.holders.write();
        if !holders.contains_key(&player) && holders.len() >= self.max_holders {
            let oldest = holders
                .iter()
                .min_by_key(|(_, (_, at))| *at)
                .map(|(player, _)| *player);
            if let Some(oldest) = oldest {
                holders.remove(&oldest);
            }
        }
        holders.insert(player, (node.clone(), Instant::now()));
    }

    /// Peers unseen for longer than the dead interval as of `now`.
    pub fn detect_dead(&self, now: Instant) -> Vec<NodeId> {
        let mut dead: Vec<NodeId> = self
            .table
            .read()
            .iter()
            .filter(|(id, _)| **id != self.node_id)
            .filter(|(_, beat)| now.saturating_duration_since(beat.last_seen) > self.dead_interval)
            .map(|(id, _)| id.clone())
            .collect();
        dead.sort();
        dead
    }

    /// Declare every silent peer dead and reclaim its locks.
    pub async fn sweep_dead(&self) -> Vec<NodeId> {
        let dead = self.detect_dead(Instant::now());
        for node in &dead {
            let silent_for = self
                .last_seen(node)
                .map(|seen| seen.elapsed())
                .unwrap_or_default();
            tracing::info!(node = %node, ?silent_for, "Node presumed dead; reclaiming its locks");
            self.reclaim(node).await;
        }
        dead
    }

    /// A peer announced an orderly stop: reclaim immediately.
    pub async fn handle_shutdown(&self, node: &NodeId) -> Vec<Uuid> {
        if *node == self.node_id {
            return Vec::new();
        }
        tracing::info!(node = %node, "Node shut down; reclaiming its locks");
        self.reclaim(node).await
    }

    async fn reclaim(&self, node: &NodeId) -> Vec<Uuid> {
        self.forget(node);
        self.locks.sweep_node(node).await
    }

    fn forget(&self, node: &NodeId) {
        if *node == self.node_id {
            return;
        }
        self.table.write().remove(node);
        self.holders.write().retain(|_, (holder, _)| holder != node);
    }

    /// Every node heard from within the dead interval, self included.
    pub fn live_nodes(&self) -> Vec<NodeId> {
        let now = Instant::now();
        let mut live: Vec<NodeId> = self
            .table
            .read()
            .iter()
            .filter(|(_, beat)| now.saturating_duration_since(beat.last_seen) <= self.dead_interval)
            .map(|(id, _)| id.clone())
            .collect();
        live.sort();
        live
    }

    /// Holder according to observed traffic. Not authoritative.
    pub fn advisory_holder(&self, player: Uuid) -> Option<NodeId> {
        self.holders.read().get(&player).map(|(holder, _)| holder.clone())
    }

    pub fn advisory_count(&self) -> usize {
        self.holders.read().len()
    }

    pub fn last_seen(&self, node: &NodeId) -> Option<Instant> {
        self.table.read().get(node).map(|beat| beat.last_seen)
    }

    pub fn heartbeat_of(&self, node: &NodeId) -> Option<NodeHeartbeat> {
        self.table.read().get(node).copied()
    }

    pub fn tracked_count(&self) -> usize {
        self.table.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::InMemoryBus;

    const DEAD: Duration = Duration::from_secs(15);

    async fn monitor(id: &str, max_tracked: usize) -> (Arc<InMemoryBus>, Arc<LockCoordinator>, HeartbeatMonitor) {
        let bus = Arc::new(InMemoryBus::new());
        assert!(bus.connect().await);
        let dyn_bus: Arc<dyn MessageBus> = bus.clone();
        let locks = Arc::new(LockCoordinator::new(Arc::clone(&dyn_bus), "test"));
        let monitor = HeartbeatMonitor::new(
            NodeId::new(id),
            dyn_bus,
            "test",
            Arc::clone(&locks),
            DEAD,
            max_tracked,
            max_tracked,
        );
        (bus, locks, monitor)
    }

    #[tokio::test(start_paused = true)]
    async fn silent_peer_is_detected_dead() {
        let (_bus, _locks, hb) = monitor("self", 16).await;
        hb.beat(0).await;
        hb.record_heartbeat(&NodeId::new("peer"), 0, 3);

        tokio::time::advance(Duration::from_secs(10)).await;
        hb.beat(0).await;
        assert!(hb.detect_dead(Instant::now()).is_empty());

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(hb.detect_dead(Instant::now()), vec![NodeId::new("peer")]);
        // Self is never reported.
        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(hb.detect_dead(Instant::now()), vec![NodeId::new("peer")]);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_reclaims_dead_peer_locks() {
        let (_bus, locks, hb) = monitor("self", 16).await;
        let player = Uuid::new_v4();
        let peer = NodeId::new("peer");
        assert!(locks.acquire(player, &peer, 60).await.is_granted());
        hb.record_heartbeat(&peer, 0, 1);

        tokio::time::advance(DEAD + Duration::from_secs(1)).await;
        assert_eq!(hb.sweep_dead().await, vec![peer.clone()]);
        assert_eq!(locks.holder(player).await, None);
        assert!(hb.last_seen(&peer).is_none());
    }

    #[tokio::test]
    async fn shutdown_reclaims_immediately() {
        let (_bus, locks, hb) = monitor("self", 16).await;
        let player = Uuid::new_v4();
        let peer = NodeId::new("peer");
        locks.acquire(player, &peer, 60).await;

        assert_eq!(hb.handle_shutdown(&peer).await, vec![player]);
        assert_eq!(locks.holder(player).await, None);
    }

    #[tokio::test]
    async fn own_shutdown_is_ignored() {
        let (_bus, locks, hb) = monitor("self", 16).await;
        let player = Uuid::new_v4();
        locks.acquire(player, &NodeId::new("self"), 60).await;
        assert!(hb.handle_shutdown(&NodeId::new("self")).await.is_empty());
        assert_eq!(locks.holder(player).await, Some(NodeId::new("self")));
    }

    #[tokio::test(start_paused = true)]
    async fn table_is_bounded_and_keeps_self() {
        let (_bus, _locks, hb) = monitor("self", 3).await;
        hb.beat(0).await;
        tokio::time::advance(Duration::from_millis(10)).await;
        hb.record_heartbeat(&NodeId::new("a"), 0, 0);
        tokio::time::advance(Duration::from_millis(10)).await;
        hb.record_heartbeat(&NodeId::new("b"), 0, 0);
        tokio::time::advance(Duration::from_millis(10)).await;
        hb.record_heartbeat(&NodeId::new("c"), 0, 0);

        assert_eq!(hb.tracked_count(), 3);
        assert!(hb.last_seen(&NodeId::new("self")).is_some());
        assert!(hb.last_seen(&NodeId::new("a")).is_none());
        assert!(hb.last_seen(&NodeId::new("c")).is_some());
    }

    #[tokio::test]
    async fn advisory_holders_follow_traffic() {
        let (_bus, _locks, hb) = monitor("self", 16).await;
        let player = Uuid::new_v4();
        hb.observe(&SyncMessage::AcquireLock {
            player_uuid: player,
            node_id: "a".into(),
            ts: 0,
        });
        assert_eq!(hb.advisory_holder(player), Some(NodeId::new("a")));

        hb.observe(&SyncMessage::TransferLock {
            player_uuid: player,
            from_node: "a".into(),
            to_node: "b".into(),
        });
        assert_eq!(hb.advisory_holder(player), Some(NodeId::new("b")));

        // Stale release from the previous holder changes nothing.
        hb.observe(&SyncMessage::ReleaseLock {
            player_uuid: player,
            node_id: "a".into(),
        });
        assert_eq!(hb.advisory_holder(player), Some(NodeId::new("b")));

        hb.observe(&SyncMessage::ServerShutdown {
            node_id: "b".into(),
            ts: 0,
        });
        assert_eq!(hb.advisory_holder(player), None);
    }

    #[tokio::test(start_paused = true)]
    async fn advisory_view_is_bounded() {
        let (_bus, _locks, hb) = monitor("self", 4).await;
        let players: Vec<Uuid> = (0..1_000).map(|_| Uuid::new_v4()).collect();
        for player in &players {
            tokio::time::advance(Duration::from_millis(1)).await;
            hb.observe(&SyncMessage::AcquireLock {
                player_uuid: *player,
                node_id: "a".into(),
                ts: 0,
            });
        }

        assert_eq!(hb.advisory_count(), 4);
        assert_eq!(hb.advisory_holder(players[999]), Some(NodeId::new("a")));
        assert_eq!(hb.advisory_holder(players[0]), None);
    }

    #[tokio::test]
    async fn heartbeat_messages_update_table() {
        let (_bus, _locks, hb) = monitor("self", 16).await;
        hb.observe(&SyncMessage::Heartbeat {
            node_id: "peer".into(),
            ts: 99,
            player_count: 4,
        });
        let beat = hb.heartbeat_of(&NodeId::new("peer")).unwrap();
        assert_eq!(beat.player_count, 4);
        assert_eq!(beat.remote_ts, 99);
        assert_eq!(hb.live_nodes(), vec![NodeId::new("peer")]);
    }
}
