//! Error types for delta decoding and dependent fetches.

use thiserror::Error;

/// Errors raised while decoding an inbound publish
#[derive(Debug, Error)]
pub enum DecodeError {
    /// Payload is not valid JSON
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),

    /// A required field is missing or has the wrong shape
    #[error("missing or malformed field: {0}")]
    Field(&'static str),

    /// Nested client payload could not be unpacked
    #[error("invalid client payload: {0}")]
    ClientPayload(String),
}

/// Errors raised by a [`Resolver`](crate::Resolver)
#[derive(Debug, Error)]
pub enum ResolveError {
    /// The call did not finish within the configured timeout
    #[error("resolve timed out")]
    Timeout,

    /// No resolver is available for this session
    #[error("resolver unavailable")]
    Unavailable,

    /// The referenced object does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// The upstream call failed
    #[error("upstream error: {0}")]
    Upstream(String),
}
