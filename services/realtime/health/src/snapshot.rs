//! Health counters and pull-based snapshots.

use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use crate::ack::{AckStats, AckTracker};
use crate::risk::RiskTier;

#[derive(Debug)]
struct LastError {
    kind: String,
    at: Instant,
}

/// Health counters of one engine instance.
///
/// Written by the engine loop, read by anyone holding the handle. Counters
/// are atomics; the few composite fields sit behind short-lived locks.
#[derive(Debug)]
pub struct HealthMonitor {
    started: Instant,
    last_inbound: Mutex<Instant>,
    last_error: Mutex<Option<LastError>>,
    state: Mutex<&'static str>,
    risk_tier: Mutex<RiskTier>,
    connected: AtomicBool,
    reconnects: AtomicU64,
    consecutive_failures: AtomicU64,
    frames: AtomicU64,
    messages: AtomicU64,
    errors: AtomicU64,
    backoff_ms: AtomicU64,
    max_backoff_ms: AtomicU64,
    pending_edits: AtomicU64,
    outbound_queue: AtomicU64,
    stale_after_ms: AtomicU64,
    acks: AckTracker,
}

/// Immutable point-in-time view of the engine's health
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    /// Connection state name
    pub state: &'static str,
    /// Risk tier in effect
    pub risk_tier: RiskTier,
    /// Whether the transport is up
    pub connected: bool,
    /// Time since the engine started
    pub uptime_ms: u64,
    /// Time since the last inbound frame
    pub idle_ms: u64,
    /// Reconnects performed
    pub reconnect_count: u64,
    /// Failures since the last ready transition
    pub consecutive_failures: u64,
    /// Kind of the most recent error
    pub last_error: Option<String>,
    /// Age of the most recent error
    pub last_error_age_ms: Option<u64>,
    /// Backoff delay currently scheduled
    pub backoff_ms: u64,
    /// Largest backoff delay observed
    pub max_backoff_ms: u64,
    /// Inbound frames
    pub frames: u64,
    /// Events emitted to the consumer
    pub messages: u64,
    /// Errors recorded
    pub errors: u64,
    /// Ack tracking statistics
    pub acks: AckStats,
    /// Pending edit count reported by the sender
    pub pending_edits: u64,
    /// Outbound queue depth reported by the sender
    pub outbound_queue: u64,
    /// Derived: connected, no failure streak and not idle past the stale threshold
    pub healthy: bool,
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl HealthMonitor {
    /// Create a monitor; `stale_after` is the idle time past which the
    /// engine is reported unhealthy
    pub fn new(risk_tier: RiskTier, stale_after: Duration) -> Self {
        let now = Instant::now();
        Self {
            started: now,
            last_inbound: Mutex::new(now),
            last_error: Mutex::new(None),
            state: Mutex::new("disconnected"),
            risk_tier: Mutex::new(risk_tier),
            connected: AtomicBool::new(false),
            reconnects: AtomicU64::new(0),
            consecutive_failures: AtomicU64::new(0),
            frames: AtomicU64::new(0),
            messages: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            backoff_ms: AtomicU64::new(0),
            max_backoff_ms: AtomicU64::new(0),
            pending_edits: AtomicU64::new(0),
            outbound_queue: AtomicU64::new(0),
            stale_after_ms: AtomicU64::new(stale_after.as_millis() as u64),
            acks: AckTracker::new(),
        }
    }

    /// Any inbound frame
    pub fn on_frame(&self) {
        *lock(&self.last_inbound) = Instant::now();
        self.frames.fetch_add(1, Ordering::Relaxed);
    }

    /// Time since the last inbound frame
    pub fn idle(&self) -> Duration {
        lock(&self.last_inbound).elapsed()
    }

    /// Events delivered to the consumer
    pub fn on_events(&self, count: usize) {
        self.messages.fetch_add(count as u64, Ordering::Relaxed);
    }

    /// Record an error by kind (`message_parse`, `transport`, ...)
    pub fn on_error(&self, kind: &str) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        *lock(&self.last_error) = Some(LastError {
            kind: kind.to_string(),
            at: Instant::now(),
        });
        debug!("Health error recorded: {}", kind);
    }

    /// Connection state changed
    pub fn on_state(&self, state: &'static str, connected: bool) {
        *lock(&self.state) = state;
        self.connected.store(connected, Ordering::Relaxed);
        if connected {
            // The stale clock starts with the connection
            *lock(&self.last_inbound) = Instant::now();
        }
    }

    /// A connection attempt failed or a live connection dropped
    pub fn on_failure(&self) {
        self.consecutive_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// A reconnect is scheduled after `delay`
    pub fn on_reconnect_scheduled(&self, delay: Duration) {
        let ms = delay.as_millis() as u64;
        self.reconnects.fetch_add(1, Ordering::Relaxed);
        self.backoff_ms.store(ms, Ordering::Relaxed);
        self.max_backoff_ms.fetch_max(ms, Ordering::Relaxed);
    }

    /// The session reached readiness
    pub fn on_ready(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
        self.backoff_ms.store(0, Ordering::Relaxed);
    }

    /// Risk tier and stale threshold changed
    pub fn set_risk_tier(&self, tier: RiskTier, stale_after: Duration) {
        *lock(&self.risk_tier) = tier;
        self.stale_after_ms
            .store(stale_after.as_millis() as u64, Ordering::Relaxed);
    }

    /// Queue depths reported by the sending collaborator
    pub fn set_queue_depths(&self, pending_edits: u64, outbound_queue: u64) {
        self.pending_edits.store(pending_edits, Ordering::Relaxed);
        self.outbound_queue.store(outbound_queue, Ordering::Relaxed);
    }

    /// Ack tracker
    pub fn acks(&self) -> &AckTracker {
        &self.acks
    }

    /// Take a snapshot
    pub fn snapshot(&self) -> HealthSnapshot {
        let now = Instant::now();
        let idle = self.idle();
        let (last_error, last_error_age_ms) = match &*lock(&self.last_error) {
            Some(err) => (
                Some(err.kind.clone()),
                Some(now.duration_since(err.at).as_millis() as u64),
            ),
            None => (None, None),
        };
        let connected = self.connected.load(Ordering::Relaxed);
        let consecutive_failures = self.consecutive_failures.load(Ordering::Relaxed);
        let idle_ms = idle.as_millis() as u64;

        HealthSnapshot {
            state: *lock(&self.state),
            risk_tier: *lock(&self.risk_tier),
            connected,
            uptime_ms: now.duration_since(self.started).as_millis() as u64,
            idle_ms,
            reconnect_count: self.reconnects.load(Ordering::Relaxed),
            consecutive_failures,
            last_error,
            last_error_age_ms,
            backoff_ms: self.backoff_ms.load(Ordering::Relaxed),
            max_backoff_ms: self.max_backoff_ms.load(Ordering::Relaxed),
            frames: self.frames.load(Ordering::Relaxed),
            messages: self.messages.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            acks: self.acks.stats(),
            pending_edits: self.pending_edits.load(Ordering::Relaxed),
            outbound_queue: self.outbound_queue.load(Ordering::Relaxed),
            healthy: connected
                && consecutive_failures == 0
                && idle_ms < self.stale_after_ms.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor() -> HealthMonitor {
        HealthMonitor::new(RiskTier::Medium, Duration::from_secs(150))
    }

    #[tokio::test(start_paused = true)]
    async fn test_healthy_requires_connection() {
        let health = monitor();
        assert!(!health.snapshot().healthy);

        health.on_state("ready", true);
        assert!(health.snapshot().healthy);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_past_stale_is_unhealthy() {
        let health = monitor();
        health.on_state("ready", true);
        tokio::time::advance(Duration::from_secs(151)).await;

        let snapshot = health.snapshot();
        assert!(!snapshot.healthy);
        assert!(snapshot.idle_ms >= 151_000);

        health.on_frame();
        assert!(health.snapshot().healthy);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_and_backoff_tracking() {
        let health = monitor();
        health.on_failure();
        health.on_reconnect_scheduled(Duration::from_millis(1_000));
        health.on_failure();
        health.on_reconnect_scheduled(Duration::from_millis(2_000));

        let snapshot = health.snapshot();
        assert_eq!(snapshot.consecutive_failures, 2);
        assert_eq!(snapshot.reconnect_count, 2);
        assert_eq!(snapshot.max_backoff_ms, 2_000);

        health.on_ready();
        let snapshot = health.snapshot();
        assert_eq!(snapshot.consecutive_failures, 0);
        assert_eq!(snapshot.backoff_ms, 0);
        assert_eq!(snapshot.max_backoff_ms, 2_000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_last_error_age() {
        let health = monitor();
        health.on_error("message_parse");
        tokio::time::advance(Duration::from_secs(3)).await;

        let snapshot = health.snapshot();
        assert_eq!(snapshot.last_error.as_deref(), Some("message_parse"));
        assert_eq!(snapshot.last_error_age_ms, Some(3_000));
        assert_eq!(snapshot.errors, 1);
    }

    #[test]
    fn test_snapshot_serializes() {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        let _guard = rt.enter();
        let health = monitor();
        health.set_queue_depths(2, 5);
        let value = serde_json::to_value(health.snapshot()).unwrap();
        assert_eq!(value["risk_tier"], "medium");
        assert_eq!(value["outbound_queue"], 5);
    }
}
