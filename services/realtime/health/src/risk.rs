//! Risk tiers and the cadences derived from them.
//!
//! The risk tier is computed outside the engine from request error rates and
//! activity. Higher risk shortens heartbeat and watchdog tolerances and
//! speeds up recovery; lower risk stretches them to keep connection churn
//! down.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Range;
use std::str::FromStr;
use std::time::Duration;

use crate::HealthError;

/// Externally computed account risk classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskTier {
    /// Quiet account, minimise churn
    Low,
    /// Default behaviour
    #[default]
    Medium,
    /// Elevated risk, recover fast
    High,
}

impl RiskTier {
    /// Lowercase name
    pub fn as_str(self) -> &'static str {
        match self {
            RiskTier::Low => "low",
            RiskTier::Medium => "medium",
            RiskTier::High => "high",
        }
    }
}

impl fmt::Display for RiskTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RiskTier {
    type Err = HealthError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(RiskTier::Low),
            "medium" => Ok(RiskTier::Medium),
            "high" => Ok(RiskTier::High),
            other => Err(HealthError::UnknownTier(other.to_string())),
        }
    }
}

/// Exponential backoff parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// First delay after a failure
    #[serde(with = "millis")]
    pub base: Duration,
    /// Growth factor per consecutive failure
    pub factor: f64,
    /// Upper bound for the delay before jitter
    #[serde(with = "millis")]
    pub cap: Duration,
    /// Relative jitter applied to every delay (0.25 = ±25%)
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(1_000),
            factor: 2.0,
            cap: Duration::from_millis(300_000),
            jitter: 0.25,
        }
    }
}

impl BackoffPolicy {
    /// Policy for a risk tier
    pub fn for_tier(tier: RiskTier) -> Self {
        match tier {
            RiskTier::Low => Self {
                base: Duration::from_millis(2_000),
                cap: Duration::from_millis(600_000),
                ..Self::default()
            },
            RiskTier::Medium => Self::default(),
            RiskTier::High => Self {
                base: Duration::from_millis(500),
                cap: Duration::from_millis(120_000),
                ..Self::default()
            },
        }
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

/// Watchdog and maintenance cadences for one risk tier
#[derive(Debug, Clone, PartialEq)]
pub struct WatchdogThresholds {
    /// Heartbeat interval range
    pub heartbeat: Range<Duration>,
    /// Idle time before a soft-stale probe
    pub soft_stale: Duration,
    /// How long a probe waits for any inbound frame
    pub probe_wait: Range<Duration>,
    /// Idle time before a ghost probe while the socket claims to be open
    pub ghost_idle: Duration,
    /// Idle time that forces a reconnect unconditionally
    pub hard_idle: Duration,
    /// Periodic recycle interval
    pub recycle_interval: Duration,
    /// Jitter applied to the recycle interval (±)
    pub recycle_jitter: Duration,
    /// Minimum spacing between heavy maintenance actions
    pub maintenance_spacing: Duration,
    /// Deferral range for a recycle that falls inside the spacing window
    pub recycle_deferral: Range<Duration>,
    /// How often the watchdog evaluates idleness
    pub check_interval: Duration,
}

impl WatchdogThresholds {
    /// Thresholds for a risk tier
    pub fn for_tier(tier: RiskTier) -> Self {
        let secs = Duration::from_secs;
        let mins = |m: u64| Duration::from_secs(m * 60);
        let (heartbeat, soft_stale, ghost_idle, hard_idle, spacing) = match tier {
            RiskTier::Low => (secs(85)..secs(100), secs(180), mins(10), mins(12), mins(45)),
            RiskTier::Medium => (secs(70)..secs(85), secs(150), mins(9), mins(12), mins(45)),
            RiskTier::High => (secs(55)..secs(70), secs(120), mins(7), mins(8), mins(30)),
        };
        Self {
            heartbeat,
            soft_stale,
            probe_wait: secs(6)..secs(8),
            ghost_idle,
            hard_idle,
            recycle_interval: mins(6 * 60),
            recycle_jitter: mins(30),
            maintenance_spacing: spacing,
            recycle_deferral: mins(5)..mins(15),
            check_interval: secs(15),
        }
    }

    /// Pick the next heartbeat delay
    pub fn next_heartbeat(&self) -> Duration {
        pick(&self.heartbeat)
    }

    /// Pick a probe wait window
    pub fn next_probe_wait(&self) -> Duration {
        pick(&self.probe_wait)
    }

    /// Pick the next recycle delay (interval ± jitter)
    pub fn next_recycle(&self) -> Duration {
        let low = self.recycle_interval.saturating_sub(self.recycle_jitter);
        let high = self.recycle_interval + self.recycle_jitter;
        pick(&(low..high))
    }

    /// Pick a deferral for a recycle inside the spacing window
    pub fn next_deferral(&self) -> Duration {
        pick(&self.recycle_deferral)
    }
}

impl Default for WatchdogThresholds {
    fn default() -> Self {
        Self::for_tier(RiskTier::default())
    }
}

/// Uniform pick from a duration range; an empty range yields its start
pub fn pick(range: &Range<Duration>) -> Duration {
    if range.start >= range.end {
        return range.start;
    }
    let ms = rand::thread_rng().gen_range(range.start.as_millis() as u64..range.end.as_millis() as u64);
    Duration::from_millis(ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_parsing() {
        assert_eq!("HIGH".parse::<RiskTier>().unwrap(), RiskTier::High);
        assert_eq!(" low ".parse::<RiskTier>().unwrap(), RiskTier::Low);
        assert!("extreme".parse::<RiskTier>().is_err());
        assert_eq!(RiskTier::default(), RiskTier::Medium);
    }

    #[test]
    fn test_backoff_by_tier() {
        let low = BackoffPolicy::for_tier(RiskTier::Low);
        let high = BackoffPolicy::for_tier(RiskTier::High);
        assert!(low.base > high.base);
        assert!(low.cap > high.cap);
        assert_eq!(BackoffPolicy::for_tier(RiskTier::Medium), BackoffPolicy::default());
    }

    #[test]
    fn test_thresholds_tighten_with_risk() {
        let low = WatchdogThresholds::for_tier(RiskTier::Low);
        let medium = WatchdogThresholds::for_tier(RiskTier::Medium);
        let high = WatchdogThresholds::for_tier(RiskTier::High);

        assert!(low.soft_stale > medium.soft_stale && medium.soft_stale > high.soft_stale);
        assert!(low.heartbeat.start > high.heartbeat.end);
        assert!(high.hard_idle < medium.hard_idle);
        assert_eq!(medium.ghost_idle, Duration::from_secs(9 * 60));
        assert_eq!(high.maintenance_spacing, Duration::from_secs(30 * 60));
    }

    #[test]
    fn test_minute_thresholds() {
        let t = WatchdogThresholds::for_tier(RiskTier::Low);
        assert_eq!(t.hard_idle, Duration::from_secs(720));
        assert_eq!(t.maintenance_spacing, Duration::from_secs(2700));
        assert_eq!(t.recycle_interval, Duration::from_secs(6 * 3600));
        assert_eq!(t.recycle_jitter, Duration::from_secs(1800));
        assert_eq!(t.recycle_deferral, Duration::from_secs(300)..Duration::from_secs(900));
    }

    #[test]
    fn test_picks_within_range() {
        let t = WatchdogThresholds::default();
        for _ in 0..100 {
            assert!(t.heartbeat.contains(&t.next_heartbeat()));
            assert!(t.probe_wait.contains(&t.next_probe_wait()));
            let recycle = t.next_recycle();
            assert!(recycle >= Duration::from_secs(330 * 60));
            assert!(recycle < Duration::from_secs(390 * 60));
        }
    }

    #[test]
    fn test_backoff_policy_serde() {
        let policy: BackoffPolicy = serde_json::from_str(
            r#"{"base":250,"factor":3.0,"cap":10000,"jitter":0.1}"#,
        )
        .unwrap();
        assert_eq!(policy.base, Duration::from_millis(250));
        assert_eq!(policy.cap, Duration::from_secs(10));
    }
}
