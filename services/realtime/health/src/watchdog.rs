//! Watchdog decisions.
//!
//! The engine owns the timers; this module only decides. Every check is a
//! pure function of the observed idle time, the connection status and the
//! in-flight guards, which keeps the policy testable without sockets or
//! clocks.

use std::time::Duration;
use tracing::debug;

use crate::risk::WatchdogThresholds;

/// Why a probe was sent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeKind {
    /// Idle past the soft-stale threshold
    SoftStale,
    /// Idle past the ghost threshold while the socket claims to be open
    Ghost,
}

impl ProbeKind {
    /// Label used in logs and error records
    pub fn as_str(self) -> &'static str {
        match self {
            ProbeKind::SoftStale => "soft_stale",
            ProbeKind::Ghost => "ghost",
        }
    }
}

/// Reason for a watchdog driven reconnect
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectReason {
    /// Soft-stale probe went unanswered
    SoftStale,
    /// Ghost probe went unanswered
    Ghost,
    /// Idle beyond the hard limit
    HardIdle,
    /// Periodic recycle
    Recycle,
}

impl ReconnectReason {
    /// Label used in logs and error records
    pub fn as_str(self) -> &'static str {
        match self {
            ReconnectReason::SoftStale => "soft_stale",
            ReconnectReason::Ghost => "ghost_connection",
            ReconnectReason::HardIdle => "hard_watchdog",
            ReconnectReason::Recycle => "periodic_recycle",
        }
    }

    /// Whether the backoff should restart from its base value
    pub fn resets_backoff(self) -> bool {
        matches!(self, ReconnectReason::SoftStale | ReconnectReason::Recycle)
    }
}

/// Outcome of a watchdog check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogAction {
    /// Nothing to do
    None,
    /// Send a probe and wait for any inbound frame
    Probe(ProbeKind),
    /// Tear down and reconnect
    Reconnect(ReconnectReason),
}

/// Outcome of a scheduled recycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecycleDecision {
    /// Recycle now
    Proceed,
    /// Maintenance happened recently; try again later
    Defer(Duration),
}

/// Watchdog policy for one risk tier
#[derive(Debug, Clone, Default)]
pub struct Watchdog {
    thresholds: WatchdogThresholds,
}

impl Watchdog {
    /// Create a watchdog with the given thresholds
    pub fn new(thresholds: WatchdogThresholds) -> Self {
        Self { thresholds }
    }

    /// Thresholds in effect
    pub fn thresholds(&self) -> &WatchdogThresholds {
        &self.thresholds
    }

    /// Replace the thresholds (risk tier change)
    pub fn set_thresholds(&mut self, thresholds: WatchdogThresholds) {
        self.thresholds = thresholds;
    }

    /// Evaluate idleness.
    ///
    /// The hard limit applies whatever the socket reports; probes are only
    /// sent on a connection that claims to be up and never overlap.
    pub fn check(
        &self,
        idle: Duration,
        connected: bool,
        probe_in_flight: bool,
        reconnect_in_flight: bool,
    ) -> WatchdogAction {
        if reconnect_in_flight {
            return WatchdogAction::None;
        }
        if idle >= self.thresholds.hard_idle {
            return WatchdogAction::Reconnect(ReconnectReason::HardIdle);
        }
        if !connected || probe_in_flight {
            return WatchdogAction::None;
        }
        if idle >= self.thresholds.ghost_idle {
            return WatchdogAction::Probe(ProbeKind::Ghost);
        }
        if idle >= self.thresholds.soft_stale {
            return WatchdogAction::Probe(ProbeKind::SoftStale);
        }
        WatchdogAction::None
    }

    /// Decide what an unanswered probe leads to
    pub fn probe_expired(&self, kind: ProbeKind) -> ReconnectReason {
        match kind {
            ProbeKind::SoftStale => ReconnectReason::SoftStale,
            ProbeKind::Ghost => ReconnectReason::Ghost,
        }
    }

    /// Decide whether a due recycle runs now or is deferred.
    ///
    /// `since_maintenance` is the time since the last refresh or heavy
    /// reconnect, if any happened.
    pub fn recycle(&self, since_maintenance: Option<Duration>) -> RecycleDecision {
        match since_maintenance {
            Some(elapsed) if elapsed < self.thresholds.maintenance_spacing => {
                let delay = self.thresholds.next_deferral();
                debug!(
                    "Recycle deferred by {:?}: maintenance {:?} ago",
                    delay, elapsed
                );
                RecycleDecision::Defer(delay)
            }
            _ => RecycleDecision::Proceed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::risk::RiskTier;

    fn medium() -> Watchdog {
        Watchdog::new(WatchdogThresholds::for_tier(RiskTier::Medium))
    }

    #[test]
    fn test_active_connection_is_left_alone() {
        assert_eq!(
            medium().check(Duration::from_secs(30), true, false, false),
            WatchdogAction::None
        );
    }

    #[test]
    fn test_soft_stale_probe() {
        assert_eq!(
            medium().check(Duration::from_secs(151), true, false, false),
            WatchdogAction::Probe(ProbeKind::SoftStale)
        );
        // Probes never overlap
        assert_eq!(
            medium().check(Duration::from_secs(151), true, true, false),
            WatchdogAction::None
        );
    }

    #[test]
    fn test_ghost_takes_priority_over_soft() {
        assert_eq!(
            medium().check(Duration::from_secs(9 * 60 + 1), true, false, false),
            WatchdogAction::Probe(ProbeKind::Ghost)
        );
    }

    #[test]
    fn test_hard_idle_ignores_socket_state() {
        let idle = Duration::from_secs(12 * 60);
        assert_eq!(
            medium().check(idle, false, true, false),
            WatchdogAction::Reconnect(ReconnectReason::HardIdle)
        );
        assert_eq!(medium().check(idle, false, false, true), WatchdogAction::None);

        let high = Watchdog::new(WatchdogThresholds::for_tier(RiskTier::High));
        assert_eq!(
            high.check(Duration::from_secs(8 * 60), true, false, false),
            WatchdogAction::Reconnect(ReconnectReason::HardIdle)
        );
    }

    #[test]
    fn test_probe_expiry() {
        let watchdog = medium();
        assert_eq!(
            watchdog.probe_expired(ProbeKind::SoftStale),
            ReconnectReason::SoftStale
        );
        assert!(watchdog.probe_expired(ProbeKind::SoftStale).resets_backoff());
        assert!(!watchdog.probe_expired(ProbeKind::Ghost).resets_backoff());
    }

    #[test]
    fn test_recycle_spacing() {
        let watchdog = medium();
        assert_eq!(watchdog.recycle(None), RecycleDecision::Proceed);
        assert_eq!(
            watchdog.recycle(Some(Duration::from_secs(46 * 60))),
            RecycleDecision::Proceed
        );
        match watchdog.recycle(Some(Duration::from_secs(10 * 60))) {
            RecycleDecision::Defer(delay) => {
                assert!(delay >= Duration::from_secs(5 * 60));
                assert!(delay < Duration::from_secs(15 * 60));
            }
            other => panic!("expected deferral, got {:?}", other),
        }
    }
}
