//! Unpacking of `ClientPayload` deltas.
//!
//! A `ClientPayload` delta carries its real content as a byte array holding
//! a JSON document `{"deltas": [...]}`. Each inner delta is an object with a
//! single key naming its kind.

use serde_json::Value;

use crate::DecodeError;

/// Kind of a nested client payload delta
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubDeltaKind {
    /// `deltaMessageReaction`
    Reaction,
    /// `deltaRecallMessageData`
    Unsend,
    /// `deltaMessageReply`
    Reply,
    /// Anything else; ignored
    Unknown,
}

/// Keys recognised inside a client payload delta, in lookup order
static SUB_DELTA_TABLE: &[(&str, SubDeltaKind)] = &[
    ("deltaMessageReaction", SubDeltaKind::Reaction),
    ("deltaRecallMessageData", SubDeltaKind::Unsend),
    ("deltaMessageReply", SubDeltaKind::Reply),
];

/// Classify a nested delta, returning its kind and body
pub fn classify(delta: &Value) -> (SubDeltaKind, &Value) {
    for (key, kind) in SUB_DELTA_TABLE {
        if let Some(body) = delta.get(*key) {
            return (*kind, body);
        }
    }
    (SubDeltaKind::Unknown, delta)
}

/// Decode the `payload` field of a `ClientPayload` delta into its deltas
pub fn decode(payload: &Value) -> Result<Vec<Value>, DecodeError> {
    let bytes: Vec<u8> = match payload {
        Value::Array(items) => items
            .iter()
            .map(|item| {
                item.as_u64()
                    .and_then(|b| u8::try_from(b).ok())
                    .ok_or_else(|| DecodeError::ClientPayload("non-byte element".to_string()))
            })
            .collect::<Result<_, _>>()?,
        Value::String(raw) => raw.as_bytes().to_vec(),
        _ => return Err(DecodeError::ClientPayload("unexpected payload type".to_string())),
    };

    let document: Value = serde_json::from_slice(&bytes)
        .map_err(|e| DecodeError::ClientPayload(e.to_string()))?;

    Ok(match document.get("deltas") {
        Some(Value::Array(deltas)) => deltas.clone(),
        _ => Vec::new(),
    })
}
