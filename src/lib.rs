//! Player state synchronization across independent server nodes.
//!
//! Keeps one node authoritative per player through a TTL-bounded
//! distributed lock, detects crashed nodes by heartbeat, reconciles
//! divergent saves, and tells every other node to drop stale cache
//! entries. All coordination runs over one shared key-value / pub-sub bus
//! ([`bus::MessageBus`]), normally Redis.

pub mod bus;
pub mod config;
pub mod error;
pub mod sync;

pub use config::{Config, ConflictStrategy, SyncConfig};
pub use error::{Result, SyncError};
pub use sync::{NodeId, SyncMessage, SyncOrchestrator};
