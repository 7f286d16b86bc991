//! Sync resumption cursor.

use serde::{Deserialize, Deserializer, Serialize};

/// Position in the sync stream: the last sequence id seen and the token of
/// the queue it belongs to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCursor {
    /// Last sequence id seen
    #[serde(default, deserialize_with = "de_seq_id")]
    pub last_seq_id: u64,
    /// Sync queue token, absent before the first queue is created
    #[serde(default)]
    pub sync_token: Option<String>,
}

impl SyncCursor {
    /// Apply envelope level cursor fields from a `/t_ms` payload.
    ///
    /// `firstDeltaSeqId` and `syncToken` only count when both are present;
    /// `lastIssuedSeqId` then advances the sequence id on its own. Returns
    /// whether anything changed.
    pub fn apply(&mut self, envelope: &serde_json::Value) -> bool {
        let before = self.clone();

        let first = envelope.get("firstDeltaSeqId").and_then(seq_from_value);
        let token = envelope.get("syncToken").and_then(|v| v.as_str());
        if let (Some(first), Some(token)) = (first, token) {
            self.last_seq_id = first;
            self.sync_token = Some(token.to_string());
        }
        if let Some(last) = envelope.get("lastIssuedSeqId").and_then(seq_from_value) {
            self.last_seq_id = last;
        }

        *self != before
    }
}

/// Read a sequence id that may arrive as a number or a numeric string
pub fn seq_from_value(value: &serde_json::Value) -> Option<u64> {
    match value {
        serde_json::Value::Number(n) => n.as_u64(),
        serde_json::Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn de_seq_id<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    match value {
        serde_json::Value::Null => Ok(0),
        other => seq_from_value(&other)
            .ok_or_else(|| serde::de::Error::custom("sequence id must be an unsigned integer")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_first_delta_requires_token() {
        let mut cursor = SyncCursor::default();
        assert!(!cursor.apply(&json!({ "firstDeltaSeqId": 10 })));
        assert_eq!(cursor.last_seq_id, 0);

        assert!(cursor.apply(&json!({ "firstDeltaSeqId": 10, "syncToken": "t1" })));
        assert_eq!(cursor.last_seq_id, 10);
        assert_eq!(cursor.sync_token.as_deref(), Some("t1"));
    }

    #[test]
    fn test_last_issued_advances() {
        let mut cursor = SyncCursor {
            last_seq_id: 10,
            sync_token: Some("t1".into()),
        };
        assert!(cursor.apply(&json!({ "lastIssuedSeqId": "15", "deltas": [] })));
        assert_eq!(cursor.last_seq_id, 15);
        assert_eq!(cursor.sync_token.as_deref(), Some("t1"));
        assert!(!cursor.apply(&json!({ "lastIssuedSeqId": 15 })));
    }

    #[test]
    fn test_deserialize_string_seq_id() {
        let cursor: SyncCursor =
            serde_json::from_str(r#"{"last_seq_id":"42","sync_token":null}"#).unwrap();
        assert_eq!(cursor.last_seq_id, 42);
        assert!(cursor.sync_token.is_none());
    }
}
