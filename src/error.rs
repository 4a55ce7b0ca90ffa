//! Error taxonomy for the sync engine.
//!
//! Runtime sync calls (acquire, release, publish, resolve) never return
//! these; they report typed outcomes instead so nothing can unwind into the
//! host's event loop. `SyncError` is used at the startup boundary
//! (configuration, connecting) and for logging a failure with a stable kind.

use thiserror::Error;

/// Everything that can go wrong inside the sync subsystem.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The shared bus is unreachable or a call timed out.
    #[error("bus connection error during {op}: {reason}")]
    Connection { op: &'static str, reason: String },

    /// A message could not be decoded or carried an unknown tag.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Another node holds the player's lock.
    #[error("lock for player {player} is held by node {holder}")]
    LockDenied { player: uuid::Uuid, holder: String },

    /// Two nodes wrote the same record concurrently.
    #[error("conflicting writes for player {player} group {group}")]
    Conflict { player: uuid::Uuid, group: String },

    /// Configuration failed validation.
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Toml(#[from] toml::de::Error),
}

impl SyncError {
    /// Short kind label used as a structured log field.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connection { .. } => "connection",
            Self::Protocol(_) => "protocol",
            Self::LockDenied { .. } => "lock_denied",
            Self::Conflict { .. } => "conflict",
            Self::Config(_) => "config",
            Self::Io(_) => "io",
            Self::Toml(_) => "toml",
        }
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
