//! Connect, subscribe and initial sync packets for one connection attempt.

use msgr_wire::{
    client_settings, endpoint_url, foreground_state, initial_sync, topics, ConnectParams,
    ConnectPayload, Packet, Publish, QoS, Subscribe, WireError,
};

use crate::bridge::OpenRequest;
use crate::config::EngineConfig;
use crate::context::SessionContext;

/// Origin expected by the edge endpoint
pub const ORIGIN: &str = "https://www.facebook.com";
/// Referer sent with the upgrade request
pub const REFERER: &str = "https://www.facebook.com/";
/// Accept-Language sent with the upgrade request
pub const ACCEPT_LANGUAGE: &str = "en-US,en;q=0.9";

/// Identity of one engine's connections
#[derive(Debug, Clone)]
pub struct Handshake {
    /// Random session id, shared by the URL and the connect payload
    pub session_id: u64,
    /// Random client (device) id
    pub client_id: String,
}

impl Handshake {
    /// New random identity
    pub fn new() -> Self {
        Self {
            session_id: msgr_wire::random_session_id(),
            client_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    /// Upgrade request for the edge endpoint
    pub fn open_request(&self, ctx: &SessionContext, config: &EngineConfig) -> OpenRequest {
        let region = config.region.as_deref().or(ctx.region.as_deref());
        let url = endpoint_url(&config.edge_host, &config.chat_path, region, self.session_id);
        let mut headers = vec![
            ("Origin".to_string(), ORIGIN.to_string()),
            ("Referer".to_string(), REFERER.to_string()),
            ("User-Agent".to_string(), ctx.user_agent.clone()),
            ("Accept-Language".to_string(), ACCEPT_LANGUAGE.to_string()),
        ];
        if !ctx.cookies.is_empty() {
            headers.push(("Cookie".to_string(), ctx.cookie_header()));
        }
        OpenRequest {
            url,
            headers,
            proxy: ctx.proxy.clone(),
        }
    }

    /// CONNECT carrying the JSON session descriptor
    pub fn connect_packet(&self, ctx: &SessionContext, config: &EngineConfig) -> Result<Packet, WireError> {
        let payload = ConnectPayload::new(&ConnectParams {
            user_id: &ctx.user_id,
            session_id: self.session_id,
            client_id: &self.client_id,
            app_id: &config.app_id,
            user_agent: &ctx.user_agent,
            online: config.online.unwrap_or(ctx.online),
            foreground: config.foreground.unwrap_or(ctx.foreground),
        });
        Ok(Packet::Connect(msgr_wire::Connect::web_client(
            payload.to_username()?,
            config.keepalive_secs,
        )))
    }
}

impl Default for Handshake {
    fn default() -> Self {
        Self::new()
    }
}

/// One SUBSCRIBE per topic of the fixed set, QoS 0
pub fn subscribe_packets(mut next_id: impl FnMut() -> u16) -> Vec<Packet> {
    topics::SUBSCRIBE_TOPICS
        .iter()
        .map(|topic| {
            Packet::Subscribe(Subscribe {
                packet_id: next_id(),
                topics: vec![(topic.to_string(), QoS::AtMostOnce)],
            })
        })
        .collect()
}

/// Initial sync, foreground state and client settings publishes, QoS 1
pub fn sync_packets(
    ctx: &SessionContext,
    config: &EngineConfig,
    mut next_id: impl FnMut() -> u16,
) -> Result<Vec<Packet>, WireError> {
    let sync = initial_sync(
        &ctx.user_id,
        ctx.cursor.last_seq_id,
        ctx.cursor.sync_token.as_deref(),
    );
    let foreground = config.foreground.unwrap_or(ctx.foreground);
    Ok(vec![
        Packet::Publish(Publish::at_least_once(
            sync.topic,
            next_id(),
            serde_json::to_vec(&sync.body)?,
        )),
        Packet::Publish(Publish::at_least_once(
            topics::FOREGROUND_STATE,
            next_id(),
            serde_json::to_vec(&foreground_state(foreground))?,
        )),
        Packet::Publish(Publish::at_least_once(
            topics::SET_CLIENT_SETTINGS,
            next_id(),
            serde_json::to_vec(&client_settings())?,
        )),
    ])
}
