//! Client for the shared key-value / pub-sub substrate.
//!
//! Every node talks to the same bus. The sync engine needs only a handful
//! of primitives from it:
//!
//! - **Atomic set-if-absent with TTL**: the foundation of the player lock
//! - **Compare-and-delete / compare-and-swap**: release and renew only what
//!   this node still holds
//! - **Publish/subscribe**: one broadcast channel for protocol messages
//!
//! Calls never fail loudly. An unreachable bus yields `false`, `None` or an
//! empty list, and [`ConnectionHealth`] logs the outage once; callers treat
//! that as "sync unavailable" and keep the game running in single-node mode.

pub mod health;
pub mod memory;
pub mod redis;

pub use health::{Backoff, ConnectionHealth};
pub use memory::InMemoryBus;
pub use self::redis::RedisBus;

use async_trait::async_trait;
use std::sync::Arc;

/// Callback invoked with every raw payload received on a subscribed channel.
///
/// Runs on the subscription task: it must return quickly and hand real work
/// to another task.
pub type MessageHandler = Arc<dyn Fn(String) + Send + Sync>;

/// Remaining-TTL sentinel for a key that does not exist (or a failed call).
pub const TTL_ABSENT: i64 = -2;

/// Remaining-TTL sentinel for a key that exists without an expiry.
pub const TTL_PERSISTENT: i64 = -1;

/// Shared bus operations used by the sync engine.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &str;

    /// Open pooled connections. Returns `false` when the bus is unreachable.
    async fn connect(&self) -> bool;

    /// Stop the subscription task and drop pooled connections.
    async fn disconnect(&self);

    fn is_connected(&self) -> bool;

    async fn publish(&self, channel: &str, message: &str) -> bool;

    /// Start delivering `channel` payloads to `handler` from a dedicated
    /// long-lived connection. The subscription survives outages and resumes
    /// on its own until [`MessageBus::disconnect`].
    async fn subscribe(&self, channel: &str, handler: MessageHandler) -> bool;

    /// Unconditional write, optionally with a TTL.
    async fn set(&self, key: &str, value: &str, ttl_seconds: Option<u64>) -> bool;

    /// Atomic write only when `key` does not exist.
    async fn set_if_absent_with_ttl(&self, key: &str, value: &str, ttl_seconds: u64) -> bool;

    async fn get(&self, key: &str) -> Option<String>;

    async fn delete(&self, key: &str) -> bool;

    /// Atomic delete only while `key` still holds `expected`.
    async fn delete_if_equals(&self, key: &str, expected: &str) -> bool;

    /// Atomic replace of `expected` with `value` and a fresh TTL.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: &str,
        value: &str,
        ttl_seconds: u64,
    ) -> bool;

    async fn expire(&self, key: &str, seconds: u64) -> bool;

    /// Remaining TTL in seconds, [`TTL_PERSISTENT`] or [`TTL_ABSENT`].
    async fn ttl(&self, key: &str) -> i64;

    /// Keys matching a glob pattern (`*` wildcard).
    async fn keys(&self, pattern: &str) -> Vec<String>;
}
