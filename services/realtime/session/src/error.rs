//! Error types for the session layer.

use thiserror::Error;

/// Errors raised by a transport bridge
#[derive(Debug, Error)]
pub enum TransportError {
    /// Endpoint or proxy URL could not be used
    #[error("invalid url: {0}")]
    Url(String),

    /// Header name or value rejected
    #[error("invalid header {0}")]
    Header(String),

    /// WebSocket protocol or handshake failure
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Upgrade refused with an HTTP response
    #[error("upgrade rejected with status {status}{}", location.as_deref().map(|l| format!(" (redirect to {})", l)).unwrap_or_default())]
    Rejected {
        /// HTTP status
        status: u16,
        /// Redirect target, if any
        location: Option<String>,
    },

    /// Proxy tunnel could not be established
    #[error("proxy error: {0}")]
    Proxy(String),

    /// Socket I/O failure
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Write on a bridge whose stream already ended
    #[error("bridge closed")]
    Closed,
}

/// Errors raised by session collaborators
#[derive(Debug, Error)]
pub enum ServiceError {
    /// The session is no longer authenticated
    #[error("not logged in: {0}")]
    NotLoggedIn(String),

    /// HTTP request failed
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Unexpected response
    #[error("unexpected response: {0}")]
    Unexpected(String),
}

/// Errors returned by the engine handle
#[derive(Debug, Error)]
pub enum EngineError {
    /// The engine stopped
    #[error("engine stopped")]
    Stopped,

    /// Outbound packet could not be encoded
    #[error("wire error: {0}")]
    Wire(#[from] msgr_wire::WireError),

    /// Payload could not be serialized
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Not connected; the publish was not sent
    #[error("not connected")]
    NotConnected,
}
