//! Cross-node player synchronization.
//!
//! Layered leaf-first on top of [`crate::bus`]:
//!
//! - [`protocol`]: wire messages, node identity and key layout
//! - [`lock`]: the per-player distributed lock
//! - [`heartbeat`]: liveness tracking and dead-node lock reclamation
//! - [`conflict`]: reconciliation of divergent record copies
//! - [`invalidation`]: save announcements and remote cache eviction
//! - [`coordinator`]: the [`SyncOrchestrator`] façade tying them together

pub mod conflict;
pub mod coordinator;
pub mod heartbeat;
pub mod invalidation;
pub mod lock;
pub mod protocol;

pub use conflict::{
    ConflictRecord, ConflictResolver, FieldConflict, FieldPath, FieldValue, RecordSnapshot,
    Resolution,
};
pub use coordinator::{LockDenial, LockDeniedHandler, SyncOrchestrator};
pub use heartbeat::{HeartbeatMonitor, NodeHeartbeat};
pub use invalidation::{
    InvalidationBroadcaster, InvalidationHandler, RemoteInvalidation, RemoteVersion,
    VersionTracker,
};
pub use lock::{LockCoordinator, LockOutcome, RetryPolicy};
pub use protocol::{decode, encode, NodeId, SyncMessage};
