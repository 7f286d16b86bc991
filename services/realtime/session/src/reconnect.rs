//! Connection state machine, error classification and backoff.

use msgr_health::BackoffPolicy;
use rand::Rng;
use std::time::Duration;
use tracing::{debug, warn};

/// Markers that identify an invalidated session
pub const AUTH_MARKERS: [&str; 3] = ["not logged in", "login.php", "checkpoint"];

/// Markers of frames or payloads that failed to decode
const DECODE_MARKERS: [&str; 3] = ["message_parse", "json error", "malformed"];

/// Connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No transport
    Disconnected,
    /// Transport opening
    Connecting,
    /// CONNECT sent, waiting for CONNACK
    Handshaking,
    /// Subscribed, waiting for the first sync reply
    Syncing,
    /// Receiving deltas
    Ready,
    /// Authentication lost; terminal
    LoggedOut,
}

impl ConnectionState {
    /// Lowercase name
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Handshaking => "handshaking",
            ConnectionState::Syncing => "syncing",
            ConnectionState::Ready => "ready",
            ConnectionState::LoggedOut => "logged_out",
        }
    }

    /// Whether a transport is up
    pub fn is_connected(self) -> bool {
        matches!(
            self,
            ConnectionState::Handshaking | ConnectionState::Syncing | ConnectionState::Ready
        )
    }
}

/// Error taxonomy driving recovery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Network errors, timeouts, unexpected closes; retried with backoff
    Transient,
    /// Malformed frames; logged and dropped, connection kept
    Decode,
    /// Session invalidated; terminal
    Authentication,
}

/// Classify an error message
pub fn classify(message: &str) -> ErrorClass {
    let lower = message.to_ascii_lowercase();
    if AUTH_MARKERS.iter().any(|m| lower.contains(m)) {
        ErrorClass::Authentication
    } else if DECODE_MARKERS.iter().any(|m| lower.contains(m)) {
        ErrorClass::Decode
    } else {
        ErrorClass::Transient
    }
}

/// Exponential backoff with jitter
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    current: Option<Duration>,
    attempts: u32,
}

impl Backoff {
    /// Create a backoff for the given policy
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            current: None,
            attempts: 0,
        }
    }

    /// Next delay: base on the first failure, then `min(cap, current * factor)`,
    /// with jitter applied to the returned value only
    pub fn next_delay(&mut self) -> Duration {
        let raw = match self.current {
            None => self.policy.base,
            Some(current) => current.mul_f64(self.policy.factor).min(self.policy.cap),
        };
        self.current = Some(raw);
        self.attempts += 1;
        jittered(raw, self.policy.jitter)
    }

    /// Back to the base delay
    pub fn reset(&mut self) {
        self.current = None;
        self.attempts = 0;
    }

    /// Replace the policy, keeping the attempt count
    pub fn set_policy(&mut self, policy: BackoffPolicy) {
        self.policy = policy;
        if let Some(current) = self.current {
            self.current = Some(current.min(policy.cap));
        }
    }

    /// Failures since the last reset
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Delay before jitter of the most recent attempt
    pub fn current(&self) -> Option<Duration> {
        self.current
    }
}

fn jittered(delay: Duration, ratio: f64) -> Duration {
    if ratio <= 0.0 {
        return delay;
    }
    let factor = rand::thread_rng().gen_range((1.0 - ratio)..=(1.0 + ratio));
    delay.mul_f64(factor.max(0.0))
}

/// Owns the connection state, the backoff and the single in-flight guard
#[derive(Debug)]
pub struct Reconnector {
    state: ConnectionState,
    backoff: Backoff,
    in_flight: bool,
}

impl Reconnector {
    /// Create a reconnector in the `Disconnected` state
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            backoff: Backoff::new(policy),
            in_flight: false,
        }
    }

    /// Current state
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Move to `state`; `LoggedOut` is never left
    pub fn transition(&mut self, state: ConnectionState) -> bool {
        if self.state == ConnectionState::LoggedOut || self.state == state {
            return false;
        }
        debug!("Connection state {} -> {}", self.state.as_str(), state.as_str());
        self.state = state;
        true
    }

    /// Whether a reconnect is scheduled or being attempted
    pub fn in_flight(&self) -> bool {
        self.in_flight
    }

    /// Schedule a reconnect; returns the delay, or `None` when one is
    /// already in flight or the session is logged out
    pub fn schedule(&mut self, reset_backoff: bool) -> Option<Duration> {
        if self.in_flight || self.state == ConnectionState::LoggedOut {
            return None;
        }
        if reset_backoff {
            self.backoff.reset();
        }
        self.in_flight = true;
        self.transition(ConnectionState::Disconnected);
        let delay = self.backoff.next_delay();
        debug!(
            "Reconnect attempt {} scheduled in {:?} (base {:?})",
            self.backoff.attempts(),
            delay,
            self.backoff.current()
        );
        Some(delay)
    }

    /// The scheduled attempt starts
    pub fn begin_attempt(&mut self) {
        self.transition(ConnectionState::Connecting);
    }

    /// The attempt finished, successfully or not; a new one may be scheduled
    pub fn attempt_finished(&mut self) {
        self.in_flight = false;
    }

    /// Readiness reached: clear the guard and reset the backoff
    pub fn on_ready(&mut self) {
        self.in_flight = false;
        self.backoff.reset();
        self.transition(ConnectionState::Ready);
    }

    /// Authentication lost: terminal, nothing is scheduled anymore
    pub fn logged_out(&mut self) {
        if self.state != ConnectionState::LoggedOut {
            warn!("Session logged out; reconnection disabled");
        }
        self.state = ConnectionState::LoggedOut;
        self.in_flight = false;
    }

    /// Backoff state
    pub fn backoff(&self) -> &Backoff {
        &self.backoff
    }

    /// Replace the backoff policy (risk tier change)
    pub fn set_policy(&mut self, policy: BackoffPolicy) {
        self.backoff.set_policy(policy);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use msgr_health::RiskTier;

    fn within_jitter(delay: Duration, expected_ms: u64) -> bool {
        let ms = delay.as_millis() as f64;
        let expected = expected_ms as f64;
        ms >= expected * 0.75 - 1.0 && ms <= expected * 1.25 + 1.0
    }

    #[test]
    fn test_classify() {
        assert_eq!(classify("Not logged in."), ErrorClass::Authentication);
        assert_eq!(
            classify("upgrade rejected with status 302 (redirect to https://www.facebook.com/login.php)"),
            ErrorClass::Authentication
        );
        assert_eq!(classify("redirect to /checkpoint/123"), ErrorClass::Authentication);
        assert_eq!(classify("message_parse: expected value"), ErrorClass::Decode);
        assert_eq!(classify("connection reset by peer"), ErrorClass::Transient);
    }

    #[tokio::test(start_paused = true)]
    async fn test_five_failures_double() {
        let mut backoff = Backoff::new(BackoffPolicy::default());
        for expected in [1_000, 2_000, 4_000, 8_000, 16_000] {
            let delay = backoff.next_delay();
            assert!(within_jitter(delay, expected), "{:?} vs {}", delay, expected);
        }
        assert_eq!(backoff.attempts(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_capped_and_monotonic_before_jitter() {
        let mut backoff = Backoff::new(BackoffPolicy::default());
        let mut previous = Duration::ZERO;
        for _ in 0..20 {
            let delay = backoff.next_delay();
            let raw = backoff.current().unwrap();
            assert!(raw >= previous);
            assert!(raw <= Duration::from_millis(300_000));
            assert!(delay <= Duration::from_millis(375_001));
            previous = raw;
        }
        assert_eq!(backoff.current(), Some(Duration::from_millis(300_000)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ready_resets_to_base() {
        let mut reconnector = Reconnector::new(BackoffPolicy::default());
        for _ in 0..4 {
            assert!(reconnector.schedule(false).is_some());
            reconnector.begin_attempt();
            reconnector.attempt_finished();
        }
        reconnector.on_ready();
        assert_eq!(reconnector.state(), ConnectionState::Ready);
        assert_eq!(reconnector.backoff().attempts(), 0);

        let delay = reconnector.schedule(false).unwrap();
        assert!(within_jitter(delay, 1_000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_reconnect_in_flight() {
        let mut reconnector = Reconnector::new(BackoffPolicy::default());
        assert!(reconnector.schedule(false).is_some());
        assert!(reconnector.schedule(false).is_none());
        assert!(reconnector.schedule(true).is_none());
        reconnector.attempt_finished();
        assert!(reconnector.schedule(false).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_logged_out_is_terminal() {
        let mut reconnector = Reconnector::new(BackoffPolicy::default());
        reconnector.logged_out();
        assert!(reconnector.schedule(true).is_none());
        assert!(!reconnector.transition(ConnectionState::Connecting));
        assert_eq!(reconnector.state(), ConnectionState::LoggedOut);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tier_policies() {
        let mut high = Backoff::new(BackoffPolicy::for_tier(RiskTier::High));
        assert!(within_jitter(high.next_delay(), 500));
        let mut low = Backoff::new(BackoffPolicy::for_tier(RiskTier::Low));
        assert!(within_jitter(low.next_delay(), 2_000));
    }
}
