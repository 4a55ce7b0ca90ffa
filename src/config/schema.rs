use crate::error::{Result, SyncError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Environment variable overriding `node.id`.
pub const NODE_ID_ENV: &str = "PLAYER_SYNC_NODE_ID";

/// Smallest dead-interval multiplier that keeps a live holder safe from
/// heartbeat jitter.
pub const MIN_DEAD_INTERVAL_MULTIPLIER: u32 = 3;

/// Largest accepted lock TTL (one day). Also bounds the heartbeat interval
/// and multiplier, which must fit below it.
pub const MAX_LOCK_TTL_SECONDS: u64 = 86_400;

// ── Top-level config ────────────────────────────────────────────

/// Root configuration file (`player-sync.toml`).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub node: NodeConfig,
    pub sync: SyncConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Read, parse and validate a TOML config file.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config = Self::from_toml(&raw)?;
        tracing::debug!(path = %path.display(), "Loaded sync config");
        Ok(config)
    }

    /// Parse and validate a TOML document.
    pub fn from_toml(raw: &str) -> Result<Self> {
        let config: Config = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(id) = &self.node.id {
            if id.trim().is_empty() {
                return Err(SyncError::Config("node.id cannot be empty".into()));
            }
        }
        self.sync.validate()
    }

    /// Render as TOML with secrets masked (for `check-config`).
    pub fn to_redacted_toml(&self) -> String {
        let mut shown = self.clone();
        if shown.sync.password.is_some() {
            shown.sync.password = Some("***".into());
        }
        toml::to_string_pretty(&shown).unwrap_or_default()
    }
}

// ── Node identity ───────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NodeConfig {
    /// Operator-assigned node id. Generated per process when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

// ── Sync engine ─────────────────────────────────────────────────

/// How two divergent versions of one record are reconciled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictStrategy {
    #[default]
    LatestWins,
    Merge,
}

impl ConflictStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::LatestWins => "latest-wins",
            Self::Merge => "merge",
        }
    }
}

/// Bus connection and protocol timing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SyncConfig {
    /// Master switch. When false the orchestrator runs in single-node mode.
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Connect/read timeout for every request/response call.
    #[serde(alias = "timeoutMs")]
    pub timeout_ms: u64,
    #[serde(alias = "lockTtlSeconds")]
    pub lock_ttl_seconds: u64,
    #[serde(alias = "heartbeatIntervalSeconds")]
    pub heartbeat_interval_seconds: u64,
    #[serde(alias = "deadIntervalMultiplier")]
    pub dead_interval_multiplier: u32,
    #[serde(alias = "conflictStrategy")]
    pub conflict_strategy: ConflictStrategy,
    /// Broadcast channel carrying every protocol message.
    pub channel: String,
    /// Number of pooled request/response connections.
    pub pool_size: usize,
    /// Bounded retry for a contended acquire during a server switch.
    pub lock_retry_attempts: u32,
    pub lock_retry_base_ms: u64,
    /// Upper bound on the last-seen table.
    pub max_tracked_nodes: usize,
    /// Upper bound on per-player state kept for other nodes' traffic
    /// (advisory holders, remote versions).
    pub max_tracked_players: usize,
    /// Upper bound on retained conflict records.
    pub conflict_log_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "127.0.0.1".into(),
            port: 6379,
            password: None,
            timeout_ms: 2_000,
            lock_ttl_seconds: 30,
            heartbeat_interval_seconds: 5,
            dead_interval_multiplier: MIN_DEAD_INTERVAL_MULTIPLIER,
            conflict_strategy: ConflictStrategy::LatestWins,
            channel: "player-sync:protocol".into(),
            pool_size: 4,
            lock_retry_attempts: 5,
            lock_retry_base_ms: 100,
            max_tracked_nodes: 1024,
            max_tracked_players: 10_000,
            conflict_log_capacity: 256,
        }
    }
}

impl SyncConfig {
    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(SyncError::Config("sync.host cannot be empty".into()));
        }
        if self.channel.trim().is_empty() {
            return Err(SyncError::Config("sync.channel cannot be empty".into()));
        }
        if self.timeout_ms == 0 {
            return Err(SyncError::Config("sync.timeout_ms must be positive".into()));
        }
        if self.pool_size == 0 {
            return Err(SyncError::Config("sync.pool_size must be at least 1".into()));
        }
        if self.heartbeat_interval_seconds == 0 {
            return Err(SyncError::Config(
                "sync.heartbeat_interval_seconds must be positive".into(),
            ));
        }
        if self.dead_interval_multiplier < MIN_DEAD_INTERVAL_MULTIPLIER {
            return Err(SyncError::Config(format!(
                "sync.dead_interval_multiplier must be >= {MIN_DEAD_INTERVAL_MULTIPLIER}, got {}",
                self.dead_interval_multiplier
            )));
        }
        if self.lock_ttl_seconds > MAX_LOCK_TTL_SECONDS {
            return Err(SyncError::Config(format!(
                "sync.lock_ttl_seconds must be <= {MAX_LOCK_TTL_SECONDS}, got {}",
                self.lock_ttl_seconds
            )));
        }
        let grace = self
            .heartbeat_interval_seconds
            .saturating_mul(u64::from(self.dead_interval_multiplier));
        if self.lock_ttl_seconds <= grace {
            return Err(SyncError::Config(format!(
                "sync.lock_ttl_seconds ({}) must exceed heartbeat_interval_seconds x dead_interval_multiplier ({grace})",
                self.lock_ttl_seconds
            )));
        }
        if self.max_tracked_nodes == 0 {
            return Err(SyncError::Config(
                "sync.max_tracked_nodes must be at least 1".into(),
            ));
        }
        if self.max_tracked_players == 0 {
            return Err(SyncError::Config(
                "sync.max_tracked_players must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// `redis://[:password@]host:port/`
    pub fn redis_url(&self) -> String {
        match &self.password {
            Some(pw) if !pw.is_empty() => format!("redis://:{pw}@{}:{}/", self.host, self.port),
            _ => format!("redis://{}:{}/", self.host, self.port),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_seconds)
    }

    pub fn dead_interval(&self) -> Duration {
        self.heartbeat_interval()
            .saturating_mul(self.dead_interval_multiplier)
    }

    /// Holders renew at roughly half the TTL.
    pub fn renew_interval(&self) -> Duration {
        (Duration::from_secs(self.lock_ttl_seconds) / 2).max(Duration::from_millis(500))
    }
}

// ── Logging ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info,player_sync=info".into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.sync.conflict_strategy, ConflictStrategy::LatestWins);
        assert_eq!(config.sync.dead_interval(), Duration::from_secs(15));
        assert_eq!(config.sync.renew_interval(), Duration::from_secs(15));
    }

    #[test]
    fn test_config_serde() {
        let toml_str = r#"
[node]
id = "lobby-1"

[sync]
host = "redis.internal"
port = 6380
password = "hunter2"
timeout_ms = 500
lock_ttl_seconds = 45
heartbeat_interval_seconds = 3
dead_interval_multiplier = 4
conflict_strategy = "merge"
"#;
        let config = Config::from_toml(toml_str).unwrap();
        assert_eq!(config.node.id.as_deref(), Some("lobby-1"));
        assert_eq!(config.sync.port, 6380);
        assert_eq!(config.sync.conflict_strategy, ConflictStrategy::Merge);
        assert_eq!(config.sync.redis_url(), "redis://:hunter2@redis.internal:6380/");
        assert_eq!(config.sync.dead_interval(), Duration::from_secs(12));
    }

    #[test]
    fn test_config_serde_camel_case_aliases() {
        let toml_str = r#"
[sync]
timeoutMs = 750
lockTtlSeconds = 60
heartbeatIntervalSeconds = 10
deadIntervalMultiplier = 3
conflictStrategy = "latest-wins"
"#;
        let config = Config::from_toml(toml_str).unwrap();
        assert_eq!(config.sync.timeout_ms, 750);
        assert_eq!(config.sync.lock_ttl_seconds, 60);
        assert_eq!(config.sync.heartbeat_interval_seconds, 10);
    }

    #[test]
    fn test_config_serde_defaults() {
        let config = Config::from_toml("").unwrap();
        assert!(config.sync.enabled);
        assert!(config.node.id.is_none());
        assert!(config.sync.password.is_none());
        assert_eq!(config.sync.redis_url(), "redis://127.0.0.1:6379/");
    }

    #[test]
    fn ttl_must_exceed_heartbeat_grace() {
        let toml_str = r#"
[sync]
lock_ttl_seconds = 15
heartbeat_interval_seconds = 5
dead_interval_multiplier = 3
"#;
        match Config::from_toml(toml_str) {
            Err(SyncError::Config(msg)) => assert!(msg.contains("must exceed")),
            other => panic!("expected config error, got {other:?}"),
        }
    }

    #[test]
    fn multiplier_below_three_rejected() {
        let sync = SyncConfig {
            dead_interval_multiplier: 2,
            ..SyncConfig::default()
        };
        match sync.validate() {
            Err(err) => assert!(err.to_string().contains("dead_interval_multiplier")),
            Ok(()) => panic!("multiplier 2 should be rejected"),
        }
    }

    #[test]
    fn oversized_ttl_rejected_and_intervals_saturate() {
        let sync = SyncConfig {
            lock_ttl_seconds: u64::MAX,
            heartbeat_interval_seconds: u64::MAX / 2,
            dead_interval_multiplier: u32::MAX,
            ..SyncConfig::default()
        };
        match sync.validate() {
            Err(err) => assert!(err.to_string().contains("lock_ttl_seconds")),
            Ok(()) => panic!("u64::MAX ttl should be rejected"),
        }
        assert_eq!(sync.renew_interval(), Duration::from_secs(u64::MAX) / 2);
        assert_eq!(sync.dead_interval(), Duration::MAX);

        let at_limit = SyncConfig {
            lock_ttl_seconds: MAX_LOCK_TTL_SECONDS,
            ..SyncConfig::default()
        };
        assert!(at_limit.validate().is_ok());
    }

    #[test]
    fn empty_node_id_rejected() {
        let toml_str = r#"
[node]
id = "   "
"#;
        assert!(Config::from_toml(toml_str).is_err());
    }

    #[test]
    fn unknown_strategy_rejected() {
        let toml_str = r#"
[sync]
conflict_strategy = "first-wins"
"#;
        assert!(matches!(Config::from_toml(toml_str), Err(SyncError::Toml(_))));
    }

    #[test]
    fn redacted_toml_hides_password() {
        let mut config = Config::default();
        config.sync.password = Some("hunter2".into());
        let rendered = config.to_redacted_toml();
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("***"));
    }

    #[test]
    fn load_from_path_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("player-sync.toml");
        std::fs::write(&path, "[sync]\nport = 7000\n").unwrap();
        let config = Config::load_from_path(&path).unwrap();
        assert_eq!(config.sync.port, 7000);
    }

    #[test]
    fn load_from_missing_path_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.toml");
        assert!(matches!(
            Config::load_from_path(&missing),
            Err(SyncError::Io(_))
        ));
    }
}
