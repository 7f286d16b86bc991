//! Wire protocol error types.

use thiserror::Error;

/// Wire protocol errors
#[derive(Error, Debug)]
pub enum WireError {
    /// Size limit exceeded
    #[error("size limit exceeded: {0}")]
    Size(usize),

    /// Remaining length field longer than four bytes
    #[error("malformed remaining length")]
    RemainingLength,

    /// Unknown control packet type
    #[error("unknown packet type {0}")]
    Type(u8),

    /// Topic or string field is not valid UTF-8
    #[error("invalid utf-8 in {0}")]
    Utf8(&'static str),

    /// QoS 2 or reserved QoS bits
    #[error("unsupported qos {0}")]
    Qos(u8),

    /// Malformed packet structure
    #[error("malformed packet")]
    Malformed,

    /// JSON body could not be produced
    #[error("json encoding failed: {0}")]
    Json(#[from] serde_json::Error),
}
