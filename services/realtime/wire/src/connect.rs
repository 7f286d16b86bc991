//! Session descriptor carried in the CONNECT username field.
//!
//! The edge endpoint does not use MQTT credentials; instead the username is a
//! JSON object describing the user, the session and the client flags.

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::WireError;

/// Application id of the web messenger client
pub const WEB_APP_ID: &str = "219994525426954";

/// Default edge host
pub const DEFAULT_EDGE_HOST: &str = "edge-chat.facebook.com";

/// Default chat path on the edge host
pub const DEFAULT_CHAT_PATH: &str = "/chat";

/// JSON username payload sent with CONNECT
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectPayload {
    /// User id
    pub u: String,
    /// Random session id
    pub s: u64,
    /// Chat availability
    pub chat_on: bool,
    /// Foreground flag
    pub fg: bool,
    /// Client (device) id
    pub d: String,
    /// Connection type
    pub ct: String,
    /// Application id
    pub aid: String,
    /// MQTT session id, left empty by web clients
    pub mqtt_sid: String,
    /// Capabilities
    pub cp: u32,
    /// Endpoint capabilities
    pub ecp: u32,
    /// Subscribed topics carried in the connect (none; subscribe follows)
    pub st: Vec<String>,
    /// Publish-on-connect messages (none)
    pub pm: Vec<serde_json::Value>,
    /// Data center hint
    pub dc: String,
    /// Do not auto-foreground on connect
    pub no_auto_fg: bool,
    /// Reserved
    pub gas: Option<serde_json::Value>,
    /// Reserved
    pub pack: Vec<serde_json::Value>,
    /// User agent string
    pub a: String,
    /// Reserved
    pub aids: Option<serde_json::Value>,
}

/// Inputs for building the connect payload
#[derive(Debug, Clone)]
pub struct ConnectParams<'a> {
    /// User id
    pub user_id: &'a str,
    /// Random session id shared with the endpoint query string
    pub session_id: u64,
    /// Client (device) id
    pub client_id: &'a str,
    /// Application id
    pub app_id: &'a str,
    /// User agent
    pub user_agent: &'a str,
    /// Chat availability
    pub online: bool,
    /// Foreground flag
    pub foreground: bool,
}

impl ConnectPayload {
    /// Build the payload for the web client profile
    pub fn new(params: &ConnectParams<'_>) -> Self {
        Self {
            u: params.user_id.to_string(),
            s: params.session_id,
            chat_on: params.online,
            fg: params.foreground,
            d: params.client_id.to_string(),
            ct: "websocket".to_string(),
            aid: params.app_id.to_string(),
            mqtt_sid: String::new(),
            cp: 3,
            ecp: 10,
            st: Vec::new(),
            pm: Vec::new(),
            dc: String::new(),
            no_auto_fg: true,
            gas: None,
            pack: Vec::new(),
            a: params.user_agent.to_string(),
            aids: None,
        }
    }

    /// Serialize to the JSON string placed in the username field
    pub fn to_username(&self) -> Result<String, WireError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Generate a random session id.
///
/// Kept within the range a JavaScript number represents exactly, since the
/// endpoint parses it as one.
pub fn random_session_id() -> u64 {
    rand::thread_rng().gen_range(1..(1u64 << 53))
}

/// Build the edge endpoint URL for a session
pub fn endpoint_url(host: &str, path: &str, region: Option<&str>, session_id: u64) -> String {
    match region {
        Some(region) if !region.is_empty() => format!(
            "wss://{}{}?region={}&sid={}",
            host,
            path,
            region.to_lowercase(),
            session_id
        ),
        _ => format!("wss://{}{}?sid={}", host, path, session_id),
    }
}
