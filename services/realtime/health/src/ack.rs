//! Send-to-ack latency tracking.
//!
//! A sender records the start of an outbound message under its ack key
//! (usually the offline threading id). When the echo of that message comes
//! back over the sync stream the entry is completed and its latency lands in
//! a bounded rolling window.

use dashmap::DashMap;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Number of samples kept in the rolling window
pub const LATENCY_WINDOW: usize = 50;
/// Smoothing factor of the running average
pub const EWMA_ALPHA: f64 = 0.2;
/// Pending sends older than this are discarded by [`AckTracker::purge_stale`]
pub const PENDING_RETENTION: Duration = Duration::from_secs(10 * 60);

/// Rolling latency statistics
#[derive(Debug, Clone, Default)]
pub struct LatencyWindow {
    samples: VecDeque<u64>,
    last_ms: Option<u64>,
    avg_ms: Option<f64>,
}

impl LatencyWindow {
    /// Add a sample in milliseconds
    pub fn record(&mut self, ms: u64) {
        if self.samples.len() == LATENCY_WINDOW {
            self.samples.pop_front();
        }
        self.samples.push_back(ms);
        self.last_ms = Some(ms);
        self.avg_ms = Some(match self.avg_ms {
            Some(avg) => EWMA_ALPHA * ms as f64 + (1.0 - EWMA_ALPHA) * avg,
            None => ms as f64,
        });
    }

    /// Most recent sample
    pub fn last(&self) -> Option<u64> {
        self.last_ms
    }

    /// Exponentially weighted average
    pub fn average(&self) -> Option<f64> {
        self.avg_ms
    }

    /// 95th percentile over the window (nearest rank)
    pub fn p95(&self) -> Option<u64> {
        if self.samples.is_empty() {
            return None;
        }
        let mut sorted: Vec<u64> = self.samples.iter().copied().collect();
        sorted.sort_unstable();
        let rank = ((sorted.len() as f64) * 0.95).ceil() as usize;
        sorted.get(rank.saturating_sub(1)).copied()
    }

    /// Number of samples in the window
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Whether the window holds no samples
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Point-in-time ack statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AckStats {
    /// Sends recorded
    pub sends: u64,
    /// Acks observed, matched or not
    pub acks: u64,
    /// Sends still waiting for an ack
    pub pending: usize,
    /// Latency of the most recent matched ack
    pub last_ack_latency_ms: Option<u64>,
    /// EWMA of matched ack latency
    pub avg_ack_latency_ms: Option<f64>,
    /// p95 of matched ack latency over the window
    pub p95_ack_latency_ms: Option<u64>,
}

/// Correlates recorded sends with their acks
#[derive(Debug, Default)]
pub struct AckTracker {
    pending: Arc<DashMap<String, Instant>>,
    window: Mutex<LatencyWindow>,
    sends: AtomicU64,
    acks: AtomicU64,
}

impl AckTracker {
    /// Create an empty tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the start of an outbound send
    pub fn record_send(&self, key: impl Into<String>) {
        self.pending.insert(key.into(), Instant::now());
        self.sends.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an ack; returns the latency when a matching send was pending
    pub fn record_ack(&self, key: &str) -> Option<Duration> {
        self.acks.fetch_add(1, Ordering::Relaxed);

        let (_, started) = self.pending.remove(key)?;
        let latency = started.elapsed();
        self.window
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .record(latency.as_millis() as u64);
        debug!("Ack for {} after {:?}", key, latency);
        Some(latency)
    }

    /// Drop pending sends that never got an ack
    pub fn purge_stale(&self) -> usize {
        let before = self.pending.len();
        self.pending
            .retain(|_, started| started.elapsed() < PENDING_RETENTION);
        before - self.pending.len()
    }

    /// Snapshot the statistics
    pub fn stats(&self) -> AckStats {
        let window = self.window.lock().unwrap_or_else(|e| e.into_inner());
        AckStats {
            sends: self.sends.load(Ordering::Relaxed),
            acks: self.acks.load(Ordering::Relaxed),
            pending: self.pending.len(),
            last_ack_latency_ms: window.last(),
            avg_ack_latency_ms: window.average(),
            p95_ack_latency_ms: window.p95(),
        }
    }
}
