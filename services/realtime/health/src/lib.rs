//! Connection health for the realtime engine.
//!
//! - **Risk tiers**: [`RiskTier`] selects a [`BackoffPolicy`] and
//!   [`WatchdogThresholds`]
//! - **Watchdog**: pure decisions on soft-stale probes, ghost probes, the
//!   hard idle limit and periodic recycling
//! - **Ack tracking**: send-to-echo latency over a rolling window
//! - **Snapshots**: [`HealthMonitor`] counters read as [`HealthSnapshot`]

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod ack;
pub mod error;
pub mod risk;
pub mod snapshot;
pub mod watchdog;

// Re-export main types
pub use ack::{AckStats, AckTracker, LatencyWindow};
pub use error::HealthError;
pub use risk::{BackoffPolicy, RiskTier, WatchdogThresholds};
pub use snapshot::{HealthMonitor, HealthSnapshot};
pub use watchdog::{ProbeKind, ReconnectReason, RecycleDecision, Watchdog, WatchdogAction};
