//! Redis-backed bus.
//!
//! Request/response calls are spread round-robin over a small pool of
//! multiplexed [`ConnectionManager`]s, each call bounded by the configured
//! timeout. Pub/sub runs on its own dedicated connection inside a
//! cancellable task so a blocking read never starves normal requests.
//! Atomic check-then-act operations are Lua scripts.

use super::health::{Backoff, ConnectionHealth};
use super::{MessageBus, MessageHandler, TTL_ABSENT};
use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use async_trait::async_trait;
use futures_util::StreamExt;
use parking_lot::{Mutex, RwLock};
use redis::aio::{ConnectionManager, PubSub};
use redis::{RedisError, Script};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Keys fetched per SCAN round trip.
const SCAN_BATCH: usize = 256;

/// First and maximum delay between subscription reconnect attempts.
const RESUBSCRIBE_BASE: Duration = Duration::from_millis(500);
const RESUBSCRIBE_MAX: Duration = Duration::from_secs(30);

const DELETE_IF_EQUALS_LUA: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
";

const COMPARE_AND_SWAP_LUA: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    redis.call('SET', KEYS[1], ARGV[2], 'EX', ARGV[3])
    return 1
end
return 0
";

/// Bus backed by a Redis (or Redis-compatible) server.
pub struct RedisBus {
    client: redis::Client,
    pool: RwLock<Vec<ConnectionManager>>,
    next: AtomicUsize,
    pool_size: usize,
    timeout: Duration,
    health: Arc<ConnectionHealth>,
    cancel: Mutex<CancellationToken>,
    delete_if_equals: Script,
    compare_and_swap: Script,
}

impl RedisBus {
    pub fn new(config: &SyncConfig) -> Result<Self> {
        let client = redis::Client::open(config.redis_url()).map_err(|e| SyncError::Connection {
            op: "open",
            reason: e.to_string(),
        })?;
        Ok(Self {
            client,
            pool: RwLock::new(Vec::new()),
            next: AtomicUsize::new(0),
            pool_size: config.pool_size.max(1),
            timeout: config.timeout(),
            health: Arc::new(ConnectionHealth::new("redis")),
            cancel: Mutex::new(CancellationToken::new()),
            delete_if_equals: Script::new(DELETE_IF_EQUALS_LUA),
            compare_and_swap: Script::new(COMPARE_AND_SWAP_LUA),
        })
    }

    pub fn health(&self) -> &ConnectionHealth {
        &self.health
    }

    /// Next pooled connection, round-robin.
    fn checkout(&self) -> Option<ConnectionManager> {
        let pool = self.pool.read();
        if pool.is_empty() {
            return None;
        }
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % pool.len();
        pool.get(idx).cloned()
    }

    /// Run one call on a pooled connection with the configured timeout.
    ///
    /// Transport failures flip health to down; command errors (wrong type,
    /// script error) are logged but do not count as an outage.
    async fn run<T, F, Fut>(&self, op: &'static str, call: F) -> Option<T>
    where
        F: FnOnce(ConnectionManager) -> Fut,
        Fut: Future<Output = redis::RedisResult<T>>,
    {
        let Some(conn) = self.checkout() else {
            self.health.mark_down(op, "not connected");
            return None;
        };
        match tokio::time::timeout(self.timeout, call(conn)).await {
            Ok(Ok(value)) => {
                self.health.mark_up();
                Some(value)
            }
            Ok(Err(e)) if is_transport_error(&e) => {
                self.health.mark_down(op, &e.to_string());
                None
            }
            Ok(Err(e)) => {
                tracing::debug!(op, "Redis command failed: {e}");
                None
            }
            Err(_) => {
                self.health.mark_down(op, "timed out");
                None
            }
        }
    }
}

fn is_transport_error(e: &RedisError) -> bool {
    e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() || e.is_timeout()
}

/// Open a dedicated pub/sub connection and subscribe to `channel`.
async fn open_pubsub(client: &redis::Client, channel: &str, timeout: Duration) -> Option<PubSub> {
    let attempt = async {
        let mut pubsub = client.get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;
        Ok::<_, RedisError>(pubsub)
    };
    match tokio::time::timeout(timeout, attempt).await {
        Ok(Ok(pubsub)) => Some(pubsub),
        Ok(Err(e)) => {
            tracing::debug!(channel, "Redis subscribe failed: {e}");
            None
        }
        Err(_) => {
            tracing::debug!(channel, "Redis subscribe timed out");
            None
        }
    }
}

/// Subscription loop: deliver payloads, reconnect with backoff when the
/// connection drops, stop when cancelled.
async fn listen(
    client: redis::Client,
    channel: String,
    handler: MessageHandler,
    cancel: CancellationToken,
    health: Arc<ConnectionHealth>,
    timeout: Duration,
    mut pubsub: Option<PubSub>,
) {
    let mut backoff = Backoff::new(RESUBSCRIBE_BASE, RESUBSCRIBE_MAX);

    loop {
        let mut active = match pubsub.take() {
            Some(active) => active,
            None => {
                let delay = backoff.next_delay();
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
                match open_pubsub(&client, &channel, timeout).await {
                    Some(active) => {
                        tracing::info!(channel = %channel, attempts = backoff.attempt(), "Redis subscription restored");
                        active
                    }
                    None => continue,
                }
            }
        };
        backoff.reset();

        let mut stream = std::pin::pin!(active.on_message());
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!(channel = %channel, "Redis subscription stopped");
                    return;
                }
                next = stream.next() => match next {
                    Some(msg) => match msg.get_payload::<String>() {
                        Ok(payload) => handler(payload),
                        Err(e) => tracing::debug!(channel = %channel, "Dropping non-text payload: {e}"),
                    },
                    None => {
                        health.mark_down("subscribe", "pub/sub connection closed");
                        break;
                    }
                },
            }
        }
    }
    tracing::debug!(channel = %channel, "Redis subscription stopped");
}

#[async_trait]
impl MessageBus for RedisBus {
    fn name(&self) -> &str {
        "redis"
    }

    async fn connect(&self) -> bool {
        let mut conns = Vec::with_capacity(self.pool_size);
        for _ in 0..self.pool_size {
            match tokio::time::timeout(self.timeout, self.client.get_connection_manager()).await {
                Ok(Ok(conn)) => conns.push(conn),
                Ok(Err(e)) => {
                    self.health.mark_down("connect", &e.to_string());
                    return false;
                }
                Err(_) => {
                    self.health.mark_down("connect", "timed out");
                    return false;
                }
            }
        }
        *self.pool.write() = conns;
        self.health.mark_up();
        tracing::info!(pool = self.pool_size, "Connected to Redis sync bus");
        true
    }

    async fn disconnect(&self) {
        {
            let mut cancel = self.cancel.lock();
            cancel.cancel();
            *cancel = CancellationToken::new();
        }
        self.pool.write().clear();
        self.health.reset();
    }

    fn is_connected(&self) -> bool {
        !self.pool.read().is_empty() && self.health.is_up()
    }

    async fn publish(&self, channel: &str, message: &str) -> bool {
        let mut cmd = redis::cmd("PUBLISH");
        cmd.arg(channel).arg(message);
        let receivers: Option<i64> = self
            .run("publish", |mut conn| async move { cmd.query_async(&mut conn).await })
            .await;
        receivers.is_some()
    }

    async fn subscribe(&self, channel: &str, handler: MessageHandler) -> bool {
        let first = open_pubsub(&self.client, channel, self.timeout).await;
        let subscribed = first.is_some();
        if !subscribed {
            self.health.mark_down("subscribe", "initial subscribe failed");
        }
        let cancel = self.cancel.lock().clone();
        tokio::spawn(listen(
            self.client.clone(),
            channel.to_string(),
            handler,
            cancel,
            Arc::clone(&self.health),
            self.timeout,
            first,
        ));
        subscribed
    }

    async fn set(&self, key: &str, value: &str, ttl_seconds: Option<u64>) -> bool {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl_seconds {
            cmd.arg("EX").arg(ttl.max(1));
        }
        let reply: Option<()> = self
            .run("set", |mut conn| async move { cmd.query_async(&mut conn).await })
            .await;
        reply.is_some()
    }

    async fn set_if_absent_with_ttl(&self, key: &str, value: &str, ttl_seconds: u64) -> bool {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value).arg("NX").arg("EX").arg(ttl_seconds.max(1));
        let reply: Option<Option<String>> = self
            .run("set_if_absent", |mut conn| async move { cmd.query_async(&mut conn).await })
            .await;
        matches!(reply, Some(Some(_)))
    }

    async fn get(&self, key: &str) -> Option<String> {
        let mut cmd = redis::cmd("GET");
        cmd.arg(key);
        let reply: Option<Option<String>> = self
            .run("get", |mut conn| async move { cmd.query_async(&mut conn).await })
            .await;
        reply.flatten()
    }

    async fn delete(&self, key: &str) -> bool {
        let mut cmd = redis::cmd("DEL");
        cmd.arg(key);
        let removed: Option<i64> = self
            .run("delete", |mut conn| async move { cmd.query_async(&mut conn).await })
            .await;
        removed.unwrap_or(0) > 0
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> bool {
        let script = &self.delete_if_equals;
        let removed: Option<i64> = self
            .run("delete_if_equals", |mut conn| async move {
                script.key(key).arg(expected).invoke_async(&mut conn).await
            })
            .await;
        removed.unwrap_or(0) > 0
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: &str,
        value: &str,
        ttl_seconds: u64,
    ) -> bool {
        let script = &self.compare_and_swap;
        let swapped: Option<i64> = self
            .run("compare_and_swap", |mut conn| async move {
                script
                    .key(key)
                    .arg(expected)
                    .arg(value)
                    .arg(ttl_seconds.max(1))
                    .invoke_async(&mut conn)
                    .await
            })
            .await;
        swapped.unwrap_or(0) == 1
    }

    async fn expire(&self, key: &str, seconds: u64) -> bool {
        let mut cmd = redis::cmd("EXPIRE");
        cmd.arg(key).arg(seconds.max(1));
        let applied: Option<i64> = self
            .run("expire", |mut conn| async move { cmd.query_async(&mut conn).await })
            .await;
        applied.unwrap_or(0) == 1
    }

    async fn ttl(&self, key: &str) -> i64 {
        let mut cmd = redis::cmd("TTL");
        cmd.arg(key);
        let remaining: Option<i64> = self
            .run("ttl", |mut conn| async move { cmd.query_async(&mut conn).await })
            .await;
        remaining.unwrap_or(TTL_ABSENT)
    }

    async fn keys(&self, pattern: &str) -> Vec<String> {
        let mut found = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let mut cmd = redis::cmd("SCAN");
            cmd.arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH);
            let page: Option<(u64, Vec<String>)> = self
                .run("keys", |mut conn| async move { cmd.query_async(&mut conn).await })
                .await;
            let Some((next, batch)) = page else {
                return found;
            };
            found.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        found.sort();
        found.dedup();
        found
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unreachable_config() -> SyncConfig {
        SyncConfig {
            host: "127.0.0.1".into(),
            // Reserved port; nothing listens there.
            port: 1,
            timeout_ms: 200,
            pool_size: 2,
            ..SyncConfig::default()
        }
    }

    #[test]
    fn new_accepts_valid_url() {
        let bus = RedisBus::new(&SyncConfig::default()).unwrap();
        assert_eq!(bus.name(), "redis");
        assert!(!bus.is_connected());
    }

    #[tokio::test]
    async fn unreachable_server_fails_quietly() {
        let bus = RedisBus::new(&unreachable_config()).unwrap();
        assert!(!bus.connect().await);
        assert!(!bus.is_connected());
        assert!(!bus.publish("ch", "msg").await);
        assert!(!bus.set_if_absent_with_ttl("lock:a", "node1", 30).await);
        assert!(bus.get("lock:a").await.is_none());
        assert!(!bus.delete_if_equals("lock:a", "node1").await);
        assert_eq!(bus.ttl("lock:a").await, TTL_ABSENT);
        assert!(bus.keys("lock:*").await.is_empty());
        assert!(bus.health().failures() > 0);
    }

    #[tokio::test]
    async fn subscribe_without_server_reports_failure() {
        let bus = RedisBus::new(&unreachable_config()).unwrap();
        let subscribed = bus.subscribe("ch", Arc::new(|_: String| {})).await;
        assert!(!subscribed);
        bus.disconnect().await;
    }
}
