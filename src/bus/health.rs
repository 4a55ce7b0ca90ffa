//! Connection health tracking and reconnect backoff.
//!
//! A bus outage must be visible in the logs exactly once, not once per
//! failed call: the first failure after a healthy period logs a warning,
//! every further failure of the same outage logs at debug, and the first
//! success afterwards logs the recovery.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

/// Up/down state of one bus connection.
#[derive(Debug)]
pub struct ConnectionHealth {
    label: &'static str,
    up: AtomicBool,
    /// Failed calls since the outage began.
    failures: AtomicU64,
}

impl ConnectionHealth {
    /// A fresh tracker starts "down" until the first successful call.
    pub fn new(label: &'static str) -> Self {
        Self {
            label,
            up: AtomicBool::new(false),
            failures: AtomicU64::new(0),
        }
    }

    pub fn is_up(&self) -> bool {
        self.up.load(Ordering::Acquire)
    }

    /// Record a successful call. Returns `true` when this ends an outage.
    pub fn mark_up(&self) -> bool {
        let was_up = self.up.swap(true, Ordering::AcqRel);
        let failed = self.failures.swap(0, Ordering::AcqRel);
        if !was_up && failed > 0 {
            tracing::info!(
                bus = self.label,
                failed_calls = failed,
                "Sync bus reachable again; leaving single-node mode"
            );
            return true;
        }
        !was_up
    }

    /// Record a failed call.
    pub fn mark_down(&self, op: &'static str, reason: &str) {
        let was_up = self.up.swap(false, Ordering::AcqRel);
        let failed = self.failures.fetch_add(1, Ordering::AcqRel);
        if was_up || failed == 0 {
            tracing::warn!(
                bus = self.label,
                op,
                reason,
                "Sync bus unreachable; falling back to single-node mode"
            );
        } else {
            tracing::debug!(bus = self.label, op, reason, "Sync bus call failed");
        }
    }

    /// Mark down without counting a failure (orderly disconnect).
    pub fn reset(&self) {
        self.up.store(false, Ordering::Release);
        self.failures.store(0, Ordering::Release);
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Acquire)
    }
}

/// Exponential backoff: `base`, `2·base`, `4·base`, … capped at `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            attempt: 0,
        }
    }

    /// Delay before the next attempt; advances the sequence.
    pub fn next_delay(&mut self) -> Duration {
        let factor = 1u32.checked_shl(self.attempt.min(16)).unwrap_or(u32::MAX);
        self.attempt = self.attempt.saturating_add(1);
        self.base.saturating_mul(factor).min(self.max)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_until_cap() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(700));
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
        assert_eq!(backoff.next_delay(), Duration::from_millis(200));
        assert_eq!(backoff.next_delay(), Duration::from_millis(400));
        assert_eq!(backoff.next_delay(), Duration::from_millis(700));
        assert_eq!(backoff.next_delay(), Duration::from_millis(700));
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }

    #[test]
    fn backoff_survives_many_attempts() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(30));
        for _ in 0..100 {
            assert!(backoff.next_delay() <= Duration::from_secs(30));
        }
    }

    #[test]
    fn health_counts_failures_per_outage() {
        let health = ConnectionHealth::new("test");
        assert!(!health.is_up());
        assert!(health.mark_up());
        assert!(health.is_up());

        health.mark_down("get", "refused");
        health.mark_down("get", "refused");
        assert!(!health.is_up());
        assert_eq!(health.failures(), 2);

        assert!(health.mark_up());
        assert_eq!(health.failures(), 0);
        // Already up: not a recovery.
        assert!(!health.mark_up());
    }
}
