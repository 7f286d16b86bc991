//! Single timer registry owned by the engine loop.
//!
//! Every scheduled action (keepalive, heartbeat, watchdog, probe deadline,
//! recycle, reconnect, sync grace, connect deadline) is one named deadline.
//! Arming a kind replaces its previous deadline; stopping the engine clears
//! the whole registry at once, so no timer can outlive the engine.

use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

/// Scheduled action kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TimerKind {
    /// MQTT PINGREQ cadence
    KeepAlive,
    /// Risk-tier heartbeat (ping + foreground publish)
    Heartbeat,
    /// Periodic idleness check
    WatchdogTick,
    /// End of a probe wait window
    ProbeDeadline,
    /// Periodic full reconnect
    Recycle,
    /// Backoff reconnect attempt
    Reconnect,
    /// Window for the first sync reply after the initial publish
    SyncGrace,
    /// Upper bound for transport connect + CONNACK
    ConnectDeadline,
}

impl TimerKind {
    /// Label used in logs
    pub fn as_str(self) -> &'static str {
        match self {
            TimerKind::KeepAlive => "keepalive",
            TimerKind::Heartbeat => "heartbeat",
            TimerKind::WatchdogTick => "watchdog",
            TimerKind::ProbeDeadline => "probe_deadline",
            TimerKind::Recycle => "recycle",
            TimerKind::Reconnect => "reconnect",
            TimerKind::SyncGrace => "sync_grace",
            TimerKind::ConnectDeadline => "connect_deadline",
        }
    }
}

/// Named deadlines
#[derive(Debug, Default)]
pub struct TimerRegistry {
    deadlines: HashMap<TimerKind, Instant>,
}

impl TimerRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm `kind` to fire after `delay`, replacing any earlier deadline
    pub fn arm(&mut self, kind: TimerKind, delay: Duration) {
        self.deadlines.insert(kind, Instant::now() + delay);
    }

    /// Disarm `kind`; returns whether it was armed
    pub fn cancel(&mut self, kind: TimerKind) -> bool {
        self.deadlines.remove(&kind).is_some()
    }

    /// Whether `kind` is armed
    pub fn is_armed(&self, kind: TimerKind) -> bool {
        self.deadlines.contains_key(&kind)
    }

    /// Disarm everything
    pub fn clear(&mut self) {
        self.deadlines.clear();
    }

    /// Number of armed timers
    pub fn len(&self) -> usize {
        self.deadlines.len()
    }

    /// Whether nothing is armed
    pub fn is_empty(&self) -> bool {
        self.deadlines.is_empty()
    }

    /// Earliest deadline; ties resolve to the lowest kind
    pub fn next(&self) -> Option<(TimerKind, Instant)> {
        self.deadlines
            .iter()
            .map(|(kind, at)| (*kind, *at))
            .min_by(|a, b| a.1.cmp(&b.1).then(a.0.cmp(&b.0)))
    }

    /// Wait for the earliest deadline and disarm it.
    ///
    /// Pends forever when nothing is armed. Cancel safe: dropping the future
    /// leaves the registry untouched.
    pub async fn expired(&mut self) -> TimerKind {
        match self.next() {
            Some((kind, at)) => {
                tokio::time::sleep_until(at).await;
                self.deadlines.remove(&kind);
                kind
            }
            None => std::future::pending().await,
        }
    }
}
