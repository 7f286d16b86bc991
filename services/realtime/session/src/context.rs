//! Session context supplied by the login collaborator.

use msgr_delta::SyncCursor;
use msgr_health::RiskTier;
use serde::{Deserialize, Serialize};

/// User agent sent when the context does not carry one
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";

/// An authentication cookie
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cookie {
    /// Cookie name
    pub name: String,
    /// Cookie value
    pub value: String,
    /// Cookie domain, informational
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
}

impl Cookie {
    /// Create a cookie
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            domain: None,
        }
    }
}

fn yes() -> bool {
    true
}

fn default_user_agent() -> String {
    DEFAULT_USER_AGENT.to_string()
}

/// Everything the engine needs to know about the logged-in session.
///
/// The engine owns its copy while running and only ever writes the sync
/// cursor back; [`EngineHandle::stop`](crate::EngineHandle::stop) returns
/// the updated context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionContext {
    /// Logged-in user id
    pub user_id: String,
    /// Cookie jar
    #[serde(default)]
    pub cookies: Vec<Cookie>,
    /// Region hint for the edge endpoint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    /// Sync resumption cursor
    #[serde(flatten)]
    pub cursor: SyncCursor,
    /// HTTP proxy URL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<String>,
    /// User agent for the upgrade request and connect payload
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// Reconnect automatically after failures
    #[serde(default = "yes")]
    pub auto_reconnect: bool,
    /// Current risk tier
    #[serde(default)]
    pub risk_tier: RiskTier,
    /// Announce chat availability
    #[serde(default = "yes")]
    pub online: bool,
    /// Announce the client as foreground
    #[serde(default = "yes")]
    pub foreground: bool,
}

impl SessionContext {
    /// Context with defaults for everything but the user and cookies
    pub fn new(user_id: impl Into<String>, cookies: Vec<Cookie>) -> Self {
        Self {
            user_id: user_id.into(),
            cookies,
            region: None,
            cursor: SyncCursor::default(),
            proxy: None,
            user_agent: default_user_agent(),
            auto_reconnect: true,
            risk_tier: RiskTier::default(),
            online: true,
            foreground: true,
        }
    }

    /// Value of the `Cookie` header
    pub fn cookie_header(&self) -> String {
        self.cookies
            .iter()
            .map(|c| format!("{}={}", c.name, c.value))
            .collect::<Vec<_>>()
            .join("; ")
    }

    /// Look up a cookie value by name
    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies
            .iter()
            .find(|c| c.name == name)
            .map(|c| c.value.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cookie_header() {
        let ctx = SessionContext::new(
            "100",
            vec![Cookie::new("c_user", "100"), Cookie::new("xs", "abc")],
        );
        assert_eq!(ctx.cookie_header(), "c_user=100; xs=abc");
        assert_eq!(ctx.cookie("xs"), Some("abc"));
        assert_eq!(ctx.cookie("missing"), None);
    }

    #[test]
    fn test_deserialize_minimal() {
        let ctx: SessionContext = serde_json::from_str(
            r#"{"user_id":"100","last_seq_id":"55","sync_token":"tok","risk_tier":"high"}"#,
        )
        .unwrap();
        assert_eq!(ctx.cursor.last_seq_id, 55);
        assert_eq!(ctx.cursor.sync_token.as_deref(), Some("tok"));
        assert_eq!(ctx.risk_tier, RiskTier::High);
        assert!(ctx.auto_reconnect);
        assert_eq!(ctx.user_agent, DEFAULT_USER_AGENT);
    }

    #[test]
    fn test_roundtrip_keeps_cursor_flat() {
        let mut ctx = SessionContext::new("100", Vec::new());
        ctx.cursor.last_seq_id = 9;
        let value = serde_json::to_value(&ctx).unwrap();
        assert_eq!(value["last_seq_id"], 9);
        assert!(value.get("cursor").is_none());
    }
}
