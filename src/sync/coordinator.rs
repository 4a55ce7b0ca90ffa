//! Sync orchestrator: the single entry point the game host talks to.
//!
//! Owns one instance of each component, wires inbound bus traffic to them,
//! and runs the per-node background tasks:
//!
//! - **Dispatcher**: decodes queued payloads and routes them
//! - **Heartbeat ticker**: publishes liveness every interval
//! - **Renewal ticker**: keeps held locks alive at about half the TTL
//! - **Dead-node sweeper**: reclaims locks of silent peers
//! - **Supervisor**: detects outages, reconnects with backoff, and
//!   re-asserts held locks on resume
//!
//! The bus callback itself only enqueues into a bounded channel, so slow
//! work never stalls delivery. Nothing here returns an error to the host:
//! every call yields a plain outcome, and an unreachable bus degrades the
//! node to single-node mode until it comes back.

use super::conflict::{ConflictResolver, RecordSnapshot, Resolution};
use super::heartbeat::HeartbeatMonitor;
use super::invalidation::{InvalidationBroadcaster, InvalidationHandler, VersionTracker};
use super::lock::{LockCoordinator, LockOutcome, RetryPolicy};
use super::protocol::{self, NodeId, SyncMessage};
use crate::bus::{Backoff, MessageBus};
use crate::config::SyncConfig;
use crate::error::SyncError;
use parking_lot::{Mutex, RwLock};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Inbound payloads buffered between the bus callback and the dispatcher.
const INBOUND_QUEUE: usize = 1024;

/// Reconnect backoff while degraded.
const RECONNECT_BASE: Duration = Duration::from_millis(500);
const RECONNECT_MAX: Duration = Duration::from_secs(30);

/// Floor for every ticker period; `interval` rejects zero.
const MIN_TICK: Duration = Duration::from_millis(100);

/// A join refused because another node holds the player.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockDenial {
    pub player: Uuid,
    pub holder: Option<NodeId>,
}

impl From<LockDenial> for SyncError {
    fn from(denial: LockDenial) -> Self {
        SyncError::LockDenied {
            player: denial.player,
            holder: denial
                .holder
                .map_or_else(|| "unknown".to_string(), |h| h.to_string()),
        }
    }
}

pub type LockDeniedHandler = Arc<dyn Fn(&LockDenial) + Send + Sync>;

pub struct SyncOrchestrator {
    config: SyncConfig,
    node_id: NodeId,
    bus: Arc<dyn MessageBus>,
    locks: Arc<LockCoordinator>,
    heartbeat: Arc<HeartbeatMonitor>,
    resolver: ConflictResolver,
    invalidation: InvalidationBroadcaster,
    /// Players this node is authoritative for.
    held: RwLock<HashSet<Uuid>>,
    deny_handlers: RwLock<Vec<LockDeniedHandler>>,
    degraded: AtomicBool,
    started: AtomicBool,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SyncOrchestrator {
    pub fn new(config: SyncConfig, node_id: NodeId, bus: Arc<dyn MessageBus>) -> Arc<Self> {
        let locks = Arc::new(LockCoordinator::new(
            Arc::clone(&bus),
            config.channel.clone(),
        ));
        let heartbeat = Arc::new(HeartbeatMonitor::new(
            node_id.clone(),
            Arc::clone(&bus),
            config.channel.clone(),
            Arc::clone(&locks),
            config.dead_interval(),
            config.max_tracked_nodes,
            config.max_tracked_players,
        ));
        let resolver = ConflictResolver::new(config.conflict_strategy, config.conflict_log_capacity);
        let invalidation = InvalidationBroadcaster::new(
            node_id.clone(),
            Arc::clone(&bus),
            config.channel.clone(),
            config.max_tracked_players,
        );

        Arc::new(Self {
            config,
            node_id,
            bus,
            locks,
            heartbeat,
            resolver,
            invalidation,
            held: RwLock::new(HashSet::new()),
            deny_handlers: RwLock::new(Vec::new()),
            degraded: AtomicBool::new(false),
            started: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    // ── Lifecycle ───────────────────────────────────────────────

    /// Connect, subscribe and spawn the background tasks.
    ///
    /// Returns `false` when the node starts degraded (sync disabled or bus
    /// unreachable). A degraded node still serves every call locally and
    /// the supervisor keeps trying to reconnect. Only the first call does
    /// anything; later calls report the current state.
    pub async fn start(self: &Arc<Self>) -> bool {
        if self.started.swap(true, Ordering::AcqRel) {
            return !self.is_degraded() && !self.cancel.is_cancelled();
        }
        if !self.config.enabled {
            self.degraded.store(true, Ordering::Release);
            tracing::info!(node = %self.node_id, "Player sync disabled; running single-node");
            return false;
        }

        let connected = self.bus.connect().await;
        if !connected {
            self.enter_degraded("connect");
        }

        let (tx, rx) = mpsc::channel::<String>(INBOUND_QUEUE);
        let handler = Arc::new(move |raw: String| {
            if tx.try_send(raw).is_err() {
                tracing::debug!("Inbound sync queue full or closed; dropping message");
            }
        });
        self.bus.subscribe(&self.config.channel, handler).await;

        let mut tasks = self.tasks.lock();
        tasks.push(self.spawn(|this| this.run_dispatcher(rx)));
        tasks.push(self.spawn(|this| this.run_heartbeat()));
        tasks.push(self.spawn(|this| this.run_renewal()));
        tasks.push(self.spawn(|this| this.run_dead_sweeper()));
        tasks.push(self.spawn(|this| this.run_supervisor()));
        drop(tasks);

        tracing::info!(
            node = %self.node_id,
            bus = self.bus.name(),
            channel = %self.config.channel,
            degraded = !connected,
            "Player sync started"
        );
        connected
    }

    fn spawn<F, Fut>(self: &Arc<Self>, task: F) -> JoinHandle<()>
    where
        F: FnOnce(Arc<Self>) -> Fut,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        tokio::spawn(task(Arc::clone(self)))
    }

    /// Release held locks, announce the stop, and halt every task.
    pub async fn shutdown(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        let held: Vec<Uuid> = self.held.write().drain().collect();
        if !self.is_degraded() {
            for player in &held {
                self.locks.release(*player, &self.node_id).await;
            }
            protocol::publish(
                self.bus.as_ref(),
                &self.config.channel,
                &SyncMessage::ServerShutdown {
                    node_id: self.node_id.clone(),
                    ts: protocol::now_millis(),
                },
            )
            .await;
        }

        self.cancel.cancel();
        self.bus.disconnect().await;
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        tracing::info!(node = %self.node_id, released = held.len(), "Player sync stopped");
    }

    // ── Upward API ──────────────────────────────────────────────

    /// Take the player's lock for this node. `false` means another node is
    /// authoritative; registered deny handlers have been told who.
    pub async fn acquire_on_join(&self, player: Uuid) -> bool {
        self.acquire_player(player, RetryPolicy::once()).await
    }

    /// Like [`Self::acquire_on_join`], but waits (bounded by the configured
    /// retry policy) for the previous node to let go. Meant for server
    /// switches where the old node is still saving.
    pub async fn acquire_on_switch(&self, player: Uuid) -> bool {
        let policy = RetryPolicy::new(
            self.config.lock_retry_attempts,
            Duration::from_millis(self.config.lock_retry_base_ms),
        );
        self.acquire_player(player, policy).await
    }

    async fn acquire_player(&self, player: Uuid, policy: RetryPolicy) -> bool {
        if self.is_degraded() {
            self.held.write().insert(player);
            return true;
        }
        let outcome = self
            .locks
            .acquire_with_retry(player, &self.node_id, self.config.lock_ttl_seconds, policy)
            .await;
        match outcome {
            LockOutcome::Granted | LockOutcome::Reacquired => {
                self.held.write().insert(player);
                true
            }
            LockOutcome::Denied { holder } => {
                self.fire_denied(&LockDenial { player, holder });
                false
            }
            LockOutcome::Unavailable => {
                self.enter_degraded("acquire");
                self.held.write().insert(player);
                true
            }
        }
    }

    pub async fn release_on_quit(&self, player: Uuid) -> bool {
        let was_held = self.held.write().remove(&player);
        self.invalidation.tracker().forget(player);
        if !was_held {
            return false;
        }
        if self.is_degraded() {
            return true;
        }
        self.locks.release(player, &self.node_id).await
    }

    /// Announce an authoritative save to the cluster.
    pub async fn notify_data_saved(&self, player: Uuid, group: &str, version: u64) -> bool {
        if !self.config.enabled {
            return self
                .invalidation
                .tracker()
                .record_local_save(player, group, version);
        }
        self.invalidation.notify_saved(player, group, version).await
    }

    /// Hand a held player to another node without a zero-holder window.
    pub async fn transfer(&self, player: Uuid, to: &NodeId) -> bool {
        if !self.held.read().contains(&player) || self.is_degraded() {
            return false;
        }
        let moved = self
            .locks
            .transfer(player, &self.node_id, to, self.config.lock_ttl_seconds)
            .await;
        if moved {
            self.held.write().remove(&player);
        }
        moved
    }

    /// Reconcile two copies of a record before loading it.
    pub fn resolve_before_load(&self, local: &RecordSnapshot, remote: &RecordSnapshot) -> Resolution {
        self.resolver.resolve(local, remote)
    }

    /// Whether another node saved (player, group) past what this node last
    /// persisted, per received updates or the shared version record.
    pub async fn needs_resolution(&self, player: Uuid, group: &str) -> bool {
        let tracker = self.invalidation.tracker();
        if tracker.needs_resolution(player, group) {
            return true;
        }
        let Some(persisted) = tracker.persisted(player, group) else {
            return false;
        };
        if self.is_degraded() {
            return false;
        }
        match self.invalidation.stored_version(player, group).await {
            Some((stored, _)) => stored > persisted,
            None => false,
        }
    }

    pub fn on_remote_invalidate(&self, handler: InvalidationHandler) {
        self.invalidation.on_remote_invalidate(handler);
    }

    pub fn on_lock_denied(&self, handler: LockDeniedHandler) {
        self.deny_handlers.write().push(handler);
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Acquire)
    }

    pub fn held_players(&self) -> Vec<Uuid> {
        let mut players: Vec<Uuid> = self.held.read().iter().copied().collect();
        players.sort();
        players
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn heartbeat(&self) -> &HeartbeatMonitor {
        &self.heartbeat
    }

    pub fn resolver(&self) -> &ConflictResolver {
        &self.resolver
    }

    pub fn versions(&self) -> &VersionTracker {
        self.invalidation.tracker()
    }

    // ── Inbound ─────────────────────────────────────────────────

    /// Route one raw payload. Malformed input is dropped.
    pub async fn dispatch(&self, raw: &str) {
        let Some(message) = protocol::decode(raw) else {
            return;
        };
        tracing::trace!(kind = message.kind(), origin = ?message.origin(), "Sync message received");
        self.heartbeat.observe(&message);

        match &message {
            SyncMessage::ServerShutdown { node_id, .. } if *node_id != self.node_id => {
                self.heartbeat.handle_shutdown(node_id).await;
            }
            SyncMessage::ReleaseLock {
                player_uuid,
                node_id,
            } => {
                if *node_id != self.node_id {
                    self.locks.notify_released();
                } else if self.held.read().contains(player_uuid) {
                    // Swept by a peer that thought we were dead.
                    self.reassert(*player_uuid).await;
                }
            }
            SyncMessage::TransferLock {
                player_uuid,
                from_node,
                to_node,
            } if *to_node == self.node_id || *from_node == self.node_id => {
                // Hand-offs may arrive late or twice; the lock key decides.
                let holder = self.locks.holder(*player_uuid).await;
                if holder.as_ref() == Some(&self.node_id) {
                    if self.held.write().insert(*player_uuid) {
                        tracing::info!(player = %player_uuid, from = %from_node, "Player handed to this node");
                    }
                } else if *from_node == self.node_id {
                    self.held.write().remove(player_uuid);
                } else {
                    tracing::debug!(
                        player = %player_uuid,
                        holder = ?holder.as_ref().map(NodeId::as_str),
                        "Ignoring hand-off the store does not confirm"
                    );
                }
            }
            SyncMessage::AcquireLock {
                player_uuid,
                node_id,
                ..
            } if *node_id != self.node_id && self.held.read().contains(player_uuid) => {
                // Someone else got our player: our lock must have lapsed.
                self.revalidate(*player_uuid).await;
            }
            SyncMessage::DataUpdate { .. } | SyncMessage::CacheInvalidate { .. } => {
                self.invalidation.handle(&message);
            }
            _ => {}
        }
    }

    /// Drop a held player if the bus says someone else owns it.
    async fn revalidate(&self, player: Uuid) {
        match self.locks.holder(player).await {
            Some(holder) if holder == self.node_id => {}
            None if !self.bus.is_connected() => {}
            holder => self.lose(player, holder),
        }
    }

    /// Try to take back a lock this node believes it holds.
    async fn reassert(&self, player: Uuid) -> bool {
        match self
            .locks
            .acquire(player, &self.node_id, self.config.lock_ttl_seconds)
            .await
        {
            LockOutcome::Granted | LockOutcome::Reacquired | LockOutcome::Unavailable => true,
            LockOutcome::Denied { holder } => {
                self.lose(player, holder);
                false
            }
        }
    }

    fn lose(&self, player: Uuid, holder: Option<NodeId>) {
        if !self.held.write().remove(&player) {
            return;
        }
        tracing::warn!(
            player = %player,
            node = %self.node_id,
            holder = ?holder.as_ref().map(NodeId::as_str),
            "Lost player lock to another node"
        );
        self.fire_denied(&LockDenial { player, holder });
    }

    fn fire_denied(&self, denial: &LockDenial) {
        let handlers = self.deny_handlers.read().clone();
        for handler in handlers {
            handler(denial);
        }
    }

    fn enter_degraded(&self, op: &'static str) {
        if !self.degraded.swap(true, Ordering::AcqRel) {
            tracing::warn!(node = %self.node_id, op, "Sync bus unavailable; continuing in single-node mode");
        }
    }

    // ── Background tasks ────────────────────────────────────────

    async fn run_dispatcher(self: Arc<Self>, mut rx: mpsc::Receiver<String>) {
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                raw = rx.recv() => match raw {
                    Some(raw) => self.dispatch(&raw).await,
                    None => break,
                },
            }
        }
    }

    async fn run_heartbeat(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.heartbeat_interval().max(MIN_TICK));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if !self.is_degraded() {
                        let count = u32::try_from(self.held.read().len()).unwrap_or(u32::MAX);
                        self.heartbeat.beat(count).await;
                    }
                }
            }
        }
    }

    async fn run_renewal(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.renew_interval().max(MIN_TICK));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                _ = ticker.tick() => self.renew_all().await,
            }
        }
    }

    /// Extend every held lock; re-take lapsed ones, drop stolen ones.
    pub async fn renew_all(&self) {
        if self.is_degraded() {
            return;
        }
        let held: Vec<Uuid> = self.held.read().iter().copied().collect();
        for player in held {
            if self
                .locks
                .renew(player, &self.node_id, self.config.lock_ttl_seconds)
                .await
            {
                continue;
            }
            if !self.bus.is_connected() {
                return;
            }
            self.reassert(player).await;
        }
    }

    async fn run_dead_sweeper(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.heartbeat_interval().max(MIN_TICK));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if !self.is_degraded() {
                        self.heartbeat.sweep_dead().await;
                    }
                }
            }
        }
    }

    async fn run_supervisor(self: Arc<Self>) {
        let mut backoff = Backoff::new(RECONNECT_BASE, RECONNECT_MAX);
        loop {
            let delay = if self.is_degraded() {
                backoff.next_delay()
            } else {
                self.config.heartbeat_interval().max(MIN_TICK)
            };
            tokio::select! {
                () = self.cancel.cancelled() => break,
                () = tokio::time::sleep(delay) => {}
            }

            if !self.is_degraded() {
                if !self.bus.is_connected() {
                    self.enter_degraded("health check");
                }
                continue;
            }

            if self.bus.connect().await {
                self.degraded.store(false, Ordering::Release);
                backoff.reset();
                self.resume().await;
            } else {
                tracing::debug!(node = %self.node_id, attempt = backoff.attempt(), "Sync bus still unreachable");
            }
        }
    }

    /// Back online: re-assert every lock granted while degraded.
    async fn resume(&self) {
        let held: Vec<Uuid> = self.held.read().iter().copied().collect();
        let mut kept = 0usize;
        for player in &held {
            if self.reassert(*player).await {
                kept += 1;
            }
        }
        tracing::info!(
            node = %self.node_id,
            held = held.len(),
            kept,
            "Sync bus reconnected; locks re-asserted"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::InMemoryBus;
    use crate::config::ConflictStrategy;
    use crate::sync::conflict::{FieldPath, FieldValue};

    fn config() -> SyncConfig {
        SyncConfig {
            lock_retry_attempts: 2,
            lock_retry_base_ms: 10,
            ..SyncConfig::default()
        }
    }

    async fn started(bus: Arc<InMemoryBus>, id: &str) -> Arc<SyncOrchestrator> {
        let node = SyncOrchestrator::new(config(), NodeId::new(id), bus);
        assert!(node.start().await);
        node
    }

    #[tokio::test]
    async fn disabled_node_grants_locally() {
        let cfg = SyncConfig {
            enabled: false,
            ..SyncConfig::default()
        };
        let node = SyncOrchestrator::new(cfg, NodeId::new("solo"), Arc::new(InMemoryBus::new()));
        assert!(!node.start().await);
        assert!(node.is_degraded());

        let player = Uuid::new_v4();
        assert!(node.acquire_on_join(player).await);
        assert_eq!(node.held_players(), vec![player]);
        assert!(node.notify_data_saved(player, "survival", 1).await);
        assert!(node.release_on_quit(player).await);
        node.shutdown().await;
    }

    #[tokio::test]
    async fn unreachable_bus_degrades_but_serves() {
        let bus = Arc::new(InMemoryBus::new());
        bus.set_available(false);
        let node = SyncOrchestrator::new(config(), NodeId::new("n"), bus);
        assert!(!node.start().await);
        assert!(node.is_degraded());
        assert!(node.acquire_on_join(Uuid::new_v4()).await);
        node.shutdown().await;
    }

    #[tokio::test]
    async fn denial_reaches_handlers() {
        let bus = Arc::new(InMemoryBus::new());
        let one = started(Arc::clone(&bus), "node1").await;
        let two = started(Arc::new(bus.peer()), "node2").await;

        let denials = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&denials);
        two.on_lock_denied(Arc::new(move |d: &LockDenial| sink.lock().push(d.clone())));

        let player = Uuid::new_v4();
        assert!(one.acquire_on_join(player).await);
        assert!(!two.acquire_on_join(player).await);
        assert_eq!(
            denials.lock().as_slice(),
            &[LockDenial {
                player,
                holder: Some(NodeId::new("node1"))
            }]
        );

        one.shutdown().await;
        two.shutdown().await;
    }

    #[tokio::test]
    async fn quit_releases_and_switch_waits() {
        let bus = Arc::new(InMemoryBus::new());
        let one = started(Arc::clone(&bus), "node1").await;
        let two = started(Arc::new(bus.peer()), "node2").await;
        let player = Uuid::new_v4();

        assert!(one.acquire_on_join(player).await);
        assert!(one.release_on_quit(player).await);
        assert!(two.acquire_on_switch(player).await);
        assert!(!one.release_on_quit(player).await);

        one.shutdown().await;
        two.shutdown().await;
    }

    #[tokio::test]
    async fn transfer_moves_authority() {
        let bus = Arc::new(InMemoryBus::new());
        let one = started(Arc::clone(&bus), "node1").await;
        let two = started(Arc::new(bus.peer()), "node2").await;
        let player = Uuid::new_v4();

        assert!(one.acquire_on_join(player).await);
        assert!(!two.transfer(player, &NodeId::new("node1")).await);
        assert!(one.transfer(player, &NodeId::new("node2")).await);
        assert!(one.held_players().is_empty());

        // The receiving node learns about it from the broadcast.
        for _ in 0..50 {
            if two.held_players() == vec![player] {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(two.held_players(), vec![player]);

        one.shutdown().await;
        two.shutdown().await;
    }

    #[tokio::test]
    async fn unconfirmed_handoff_is_ignored() {
        let bus = Arc::new(InMemoryBus::new());
        let one = started(Arc::clone(&bus), "node1").await;
        let two = started(Arc::new(bus.peer()), "node2").await;
        let denials = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&denials);
        two.on_lock_denied(Arc::new(move |d: &LockDenial| sink.lock().push(d.clone())));

        let player = Uuid::new_v4();
        assert!(one.acquire_on_join(player).await);
        let stale = protocol::encode(&SyncMessage::TransferLock {
            player_uuid: player,
            from_node: "node0".into(),
            to_node: "node2".into(),
        });
        two.dispatch(&stale).await;
        two.dispatch(&stale).await;

        assert!(two.held_players().is_empty());
        two.renew_all().await;
        assert!(denials.lock().is_empty());
        assert_eq!(one.held_players(), vec![player]);

        one.shutdown().await;
        two.shutdown().await;
    }

    #[tokio::test]
    async fn second_start_is_a_no_op() {
        let bus = Arc::new(InMemoryBus::new());
        let node = started(Arc::clone(&bus), "n").await;
        assert!(node.start().await);
        assert_eq!(node.tasks.lock().len(), 5);
        node.shutdown().await;
        assert!(!node.start().await);
        assert!(node.tasks.lock().is_empty());
    }

    #[tokio::test]
    async fn dispatch_ignores_garbage() {
        let node = started(Arc::new(InMemoryBus::new()), "n").await;
        node.dispatch("{not json").await;
        node.dispatch(r#"{"type":"warp"}"#).await;
        assert!(node.held_players().is_empty());
        node.shutdown().await;
    }

    #[tokio::test]
    async fn resolve_before_load_uses_configured_strategy() {
        let cfg = SyncConfig {
            conflict_strategy: ConflictStrategy::Merge,
            ..config()
        };
        let node = SyncOrchestrator::new(cfg, NodeId::new("n"), Arc::new(InMemoryBus::new()));
        let player = Uuid::new_v4();
        let local = RecordSnapshot::new(player, "survival", 6, 1_600, NodeId::new("n"))
            .with_field(FieldPath::Main(3), FieldValue::new("ItemY", 1_500));
        let remote = RecordSnapshot::new(player, "survival", 5, 1_000, NodeId::new("m"))
            .with_field(FieldPath::Main(3), FieldValue::new("ItemX", 900));
        assert!(node.resolve_before_load(&local, &remote).is_conflict());
        assert_eq!(node.resolver().recent_conflicts().len(), 1);
    }

    #[tokio::test]
    async fn needs_resolution_reads_shared_version() {
        let bus = Arc::new(InMemoryBus::new());
        let one = started(Arc::clone(&bus), "node1").await;
        let two = started(Arc::new(bus.peer()), "node2").await;
        let player = Uuid::new_v4();

        assert!(two.notify_data_saved(player, "survival", 3).await);
        assert!(!two.needs_resolution(player, "survival").await);
        assert!(one.notify_data_saved(player, "survival", 4).await);
        assert!(two.needs_resolution(player, "survival").await);

        one.shutdown().await;
        two.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_is_idempotent() {
        let node = started(Arc::new(InMemoryBus::new()), "n").await;
        node.acquire_on_join(Uuid::new_v4()).await;
        node.shutdown().await;
        node.shutdown().await;
        assert!(node.held_players().is_empty());
    }
}
