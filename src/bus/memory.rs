//! In-process bus with TTL-based auto-expiry.
//!
//! Several [`InMemoryBus`] handles can share one [`MemoryBackend`], which
//! makes them behave like independent nodes on one substrate. Used for
//! single-process deployments and for exercising the protocol in tests.
//! Each handle can be cut off with [`InMemoryBus::set_available`] to
//! simulate a network partition of that node.

use super::health::ConnectionHealth;
use super::{MessageBus, MessageHandler, TTL_ABSENT, TTL_PERSISTENT};
use async_trait::async_trait;
use parking_lot::{Mutex, MutexGuard};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Capacity of each channel's broadcast ring.
const CHANNEL_CAPACITY: usize = 1024;

/// Minimum spacing between expiry sweeps run from the write path.
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Internal value with expiry tracking.
struct Slot {
    value: String,
    expires_at: Option<Instant>,
}

impl Slot {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

/// The shared store and channels behind every attached handle.
#[derive(Default)]
pub struct MemoryBackend {
    slots: Mutex<HashMap<String, Slot>>,
    channels: Mutex<HashMap<String, broadcast::Sender<String>>>,
    last_sweep: Mutex<Option<Instant>>,
}

impl MemoryBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<String> {
        let mut channels = self.channels.lock();
        channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }

    /// Drop expired keys. Returns the number removed.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let mut slots = self.slots.lock();
        *self.last_sweep.lock() = Some(now);
        let before = slots.len();
        slots.retain(|_, slot| slot.is_live(now));
        before - slots.len()
    }

    /// Lock the keyspace for a write, evicting expired keys first when the
    /// last sweep is at least [`SWEEP_INTERVAL`] old.
    fn slots_for_write(&self) -> MutexGuard<'_, HashMap<String, Slot>> {
        let now = Instant::now();
        let mut slots = self.slots.lock();
        let mut last_sweep = self.last_sweep.lock();
        if last_sweep.is_none_or(|at| now.saturating_duration_since(at) >= SWEEP_INTERVAL) {
            slots.retain(|_, slot| slot.is_live(now));
            *last_sweep = Some(now);
        }
        drop(last_sweep);
        slots
    }

    /// Keys held in memory, expired or not.
    pub fn slot_count(&self) -> usize {
        self.slots.lock().len()
    }

    /// Count live keys (for diagnostics).
    pub fn key_count(&self) -> usize {
        let now = Instant::now();
        self.slots.lock().values().filter(|s| s.is_live(now)).count()
    }
}

/// A TTL too large to represent never expires.
fn expiry(ttl_seconds: u64) -> Option<Instant> {
    Instant::now().checked_add(Duration::from_secs(ttl_seconds))
}

/// One node's handle onto a [`MemoryBackend`].
pub struct InMemoryBus {
    backend: Arc<MemoryBackend>,
    health: ConnectionHealth,
    connected: AtomicBool,
    /// Shared with subscription tasks so a partition also stops delivery.
    available: Arc<AtomicBool>,
    cancel: Mutex<CancellationToken>,
}

impl InMemoryBus {
    /// A handle on a brand-new backend.
    pub fn new() -> Self {
        Self::with_backend(MemoryBackend::new())
    }

    pub fn with_backend(backend: Arc<MemoryBackend>) -> Self {
        Self {
            backend,
            health: ConnectionHealth::new("memory"),
            connected: AtomicBool::new(false),
            available: Arc::new(AtomicBool::new(true)),
            cancel: Mutex::new(CancellationToken::new()),
        }
    }

    /// Another handle on the same backend, as if a second node joined.
    pub fn peer(&self) -> Self {
        Self::with_backend(Arc::clone(&self.backend))
    }

    pub fn backend(&self) -> &Arc<MemoryBackend> {
        &self.backend
    }

    /// Cut this handle off from the backend (or restore it).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Release);
    }

    pub fn health(&self) -> &ConnectionHealth {
        &self.health
    }

    /// Gate every call on connection and partition state.
    fn reachable(&self, op: &'static str) -> bool {
        if !self.connected.load(Ordering::Acquire) {
            self.health.mark_down(op, "not connected");
            return false;
        }
        if !self.available.load(Ordering::Acquire) {
            self.health.mark_down(op, "partitioned");
            return false;
        }
        self.health.mark_up();
        true
    }
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageBus for InMemoryBus {
    fn name(&self) -> &str {
        "memory"
    }

    async fn connect(&self) -> bool {
        self.connected.store(true, Ordering::Release);
        self.reachable("connect")
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::Release);
        let mut cancel = self.cancel.lock();
        cancel.cancel();
        *cancel = CancellationToken::new();
        self.health.reset();
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
            && self.available.load(Ordering::Acquire)
    }

    async fn publish(&self, channel: &str, message: &str) -> bool {
        if !self.reachable("publish") {
            return false;
        }
        // No subscribers is not a failure.
        let _ = self.backend.sender(channel).send(message.to_string());
        true
    }

    async fn subscribe(&self, channel: &str, handler: MessageHandler) -> bool {
        let mut rx = self.backend.sender(channel).subscribe();
        let cancel = self.cancel.lock().clone();
        let available = Arc::clone(&self.available);
        let channel_name = channel.to_string();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    received = rx.recv() => match received {
                        Ok(payload) => {
                            if available.load(Ordering::Acquire) {
                                handler(payload);
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(channel = %channel_name, skipped, "Subscriber lagged; messages dropped");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
            tracing::debug!(channel = %channel_name, "In-memory subscription stopped");
        });

        self.is_connected()
    }

    async fn set(&self, key: &str, value: &str, ttl_seconds: Option<u64>) -> bool {
        if !self.reachable("set") {
            return false;
        }
        self.backend.slots_for_write().insert(
            key.to_string(),
            Slot {
                value: value.to_string(),
                expires_at: ttl_seconds.and_then(expiry),
            },
        );
        true
    }

    async fn set_if_absent_with_ttl(&self, key: &str, value: &str, ttl_seconds: u64) -> bool {
        if !self.reachable("set_if_absent") {
            return false;
        }
        let now = Instant::now();
        let mut slots = self.backend.slots_for_write();
        if slots.get(key).is_some_and(|slot| slot.is_live(now)) {
            return false;
        }
        slots.insert(
            key.to_string(),
            Slot {
                value: value.to_string(),
                expires_at: expiry(ttl_seconds),
            },
        );
        true
    }

    async fn get(&self, key: &str) -> Option<String> {
        if !self.reachable("get") {
            return None;
        }
        let now = Instant::now();
        let slots = self.backend.slots.lock();
        slots
            .get(key)
            .filter(|slot| slot.is_live(now))
            .map(|slot| slot.value.clone())
    }

    async fn delete(&self, key: &str) -> bool {
        if !self.reachable("delete") {
            return false;
        }
        let now = Instant::now();
        self.backend
            .slots_for_write()
            .remove(key)
            .is_some_and(|slot| slot.is_live(now))
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> bool {
        if !self.reachable("delete_if_equals") {
            return false;
        }
        let now = Instant::now();
        let mut slots = self.backend.slots_for_write();
        let matches = slots
            .get(key)
            .is_some_and(|slot| slot.is_live(now) && slot.value == expected);
        if matches {
            slots.remove(key);
        }
        matches
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: &str,
        value: &str,
        ttl_seconds: u64,
    ) -> bool {
        if !self.reachable("compare_and_swap") {
            return false;
        }
        let now = Instant::now();
        let mut slots = self.backend.slots_for_write();
        match slots.get_mut(key) {
            Some(slot) if slot.is_live(now) && slot.value == expected => {
                slot.value = value.to_string();
                slot.expires_at = expiry(ttl_seconds);
                true
            }
            _ => false,
        }
    }

    async fn expire(&self, key: &str, seconds: u64) -> bool {
        if !self.reachable("expire") {
            return false;
        }
        let now = Instant::now();
        let mut slots = self.backend.slots_for_write();
        match slots.get_mut(key) {
            Some(slot) if slot.is_live(now) => {
                slot.expires_at = expiry(seconds);
                true
            }
            _ => false,
        }
    }

    async fn ttl(&self, key: &str) -> i64 {
        if !self.reachable("ttl") {
            return TTL_ABSENT;
        }
        let now = Instant::now();
        let slots = self.backend.slots.lock();
        match slots.get(key) {
            Some(slot) if slot.is_live(now) => match slot.expires_at {
                Some(at) => {
                    let remaining = at.saturating_duration_since(now).as_millis();
                    i64::try_from(remaining.div_ceil(1000)).unwrap_or(i64::MAX)
                }
                None => TTL_PERSISTENT,
            },
            _ => TTL_ABSENT,
        }
    }

    async fn keys(&self, pattern: &str) -> Vec<String> {
        if !self.reachable("keys") {
            return Vec::new();
        }
        let matcher = match glob::Pattern::new(pattern) {
            Ok(p) => p,
            Err(e) => {
                tracing::debug!(pattern, "Invalid key pattern: {e}");
                return Vec::new();
            }
        };
        let now = Instant::now();
        let slots = self.backend.slots.lock();
        let mut keys: Vec<String> = slots
            .iter()
            .filter(|(key, slot)| slot.is_live(now) && matcher.matches(key))
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        keys
    }
}

// ── Tests ───────────────────────────────────────────────────────
