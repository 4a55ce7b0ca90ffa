pub mod schema;

pub use schema::{
    Config, ConflictStrategy, LoggingConfig, NodeConfig, SyncConfig, MAX_LOCK_TTL_SECONDS,
    MIN_DEAD_INTERVAL_MULTIPLIER, NODE_ID_ENV,
};
