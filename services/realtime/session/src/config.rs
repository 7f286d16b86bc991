//! Engine configuration.

use msgr_delta::DecodeOptions;
use msgr_health::{BackoffPolicy, RiskTier, WatchdogThresholds};
use msgr_wire::{DEFAULT_CHAT_PATH, DEFAULT_EDGE_HOST, DEFAULT_MAX_PACKET_SIZE, WEB_APP_ID};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Engine settings; every field has a default
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Edge chat host
    pub edge_host: String,
    /// Path of the chat endpoint
    pub chat_path: String,
    /// Region override, takes precedence over the session context
    pub region: Option<String>,
    /// Application id in the connect payload
    pub app_id: String,
    /// MQTT keepalive in seconds; PINGREQ cadence while connected
    pub keepalive_secs: u16,
    /// Capacity of the consumer event channel
    pub event_capacity: usize,
    /// Emit a `ready` event on every ready transition
    pub emit_ready: bool,
    /// Emit events authored by the session user
    pub self_listen: bool,
    /// Emit non-message events
    pub listen_events: bool,
    /// Emit typing indicators
    pub listen_typing: bool,
    /// Emit presence updates
    pub emit_presence: bool,
    /// Override of the context's online flag
    pub online: Option<bool>,
    /// Override of the context's foreground flag
    pub foreground: Option<bool>,
    /// Window for the first sync reply, in milliseconds
    pub sync_grace_ms: u64,
    /// Upper bound for each resolver call, in milliseconds
    pub resolve_timeout_ms: u64,
    /// Upper bound for transport open plus CONNACK, in milliseconds
    pub connect_timeout_ms: u64,
    /// Upper bound for a task reply, in milliseconds
    pub request_timeout_ms: u64,
    /// Backoff override; the risk tier policy applies otherwise
    pub backoff: Option<BackoffPolicy>,
    /// Largest inbound packet accepted
    pub max_packet_size: usize,
    /// Watchdog override; the risk tier thresholds apply otherwise
    #[serde(skip)]
    pub watchdog: Option<WatchdogThresholds>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            edge_host: DEFAULT_EDGE_HOST.to_string(),
            chat_path: DEFAULT_CHAT_PATH.to_string(),
            region: None,
            app_id: WEB_APP_ID.to_string(),
            keepalive_secs: 30,
            event_capacity: 1024,
            emit_ready: false,
            self_listen: false,
            listen_events: true,
            listen_typing: false,
            emit_presence: false,
            online: None,
            foreground: None,
            sync_grace_ms: 5_000,
            resolve_timeout_ms: 10_000,
            connect_timeout_ms: 20_000,
            request_timeout_ms: 60_000,
            backoff: None,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            watchdog: None,
        }
    }
}

impl EngineConfig {
    /// MQTT keepalive
    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(u64::from(self.keepalive_secs.max(1)))
    }

    /// Sync grace window
    pub fn sync_grace(&self) -> Duration {
        Duration::from_millis(self.sync_grace_ms)
    }

    /// Connect deadline
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Task reply deadline
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Backoff policy for a risk tier, honouring the override
    pub fn backoff_for(&self, tier: RiskTier) -> BackoffPolicy {
        self.backoff.unwrap_or_else(|| BackoffPolicy::for_tier(tier))
    }

    /// Watchdog thresholds for a risk tier, honouring the override
    pub fn watchdog_for(&self, tier: RiskTier) -> WatchdogThresholds {
        self.watchdog
            .clone()
            .unwrap_or_else(|| WatchdogThresholds::for_tier(tier))
    }

    /// Decoder options
    pub fn decode_options(&self) -> DecodeOptions {
        DecodeOptions {
            self_listen: self.self_listen,
            listen_events: self.listen_events,
            listen_typing: self.listen_typing,
            emit_presence: self.emit_presence,
            resolve_timeout: Duration::from_millis(self.resolve_timeout_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.keepalive(), Duration::from_secs(30));
        assert_eq!(config.sync_grace(), Duration::from_secs(5));
        assert_eq!(config.chat_path, "/chat");
        assert!(config.listen_events);
        assert!(!config.self_listen);
    }

    #[test]
    fn test_partial_deserialize() {
        let config: EngineConfig = serde_json::from_str(
            r#"{"region":"prn","listen_typing":true,"backoff":{"base":100,"factor":3.0,"cap":1000,"jitter":0.0}}"#,
        )
        .unwrap();
        assert_eq!(config.region.as_deref(), Some("prn"));
        assert!(config.decode_options().listen_typing);
        assert_eq!(config.backoff_for(RiskTier::High).base, Duration::from_millis(100));
        assert_eq!(config.edge_host, DEFAULT_EDGE_HOST);
    }

    #[test]
    fn test_tier_fallbacks() {
        let config = EngineConfig::default();
        assert_eq!(config.backoff_for(RiskTier::Low), BackoffPolicy::for_tier(RiskTier::Low));
        assert_eq!(
            config.watchdog_for(RiskTier::High),
            WatchdogThresholds::for_tier(RiskTier::High)
        );
    }
}
