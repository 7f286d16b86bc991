//! Field extraction helpers shared by the delta handlers.
//!
//! Delta payloads are loosely typed: ids arrive as numbers or strings,
//! optional blocks come and go between client versions. Everything here
//! reads a `serde_json::Value` and degrades to defaults instead of failing,
//! except for the few fields a handler cannot do without.

use serde_json::Value;
use std::collections::BTreeMap;

use crate::event::{Attachment, LogEvent, Message};
use crate::DecodeError;

/// Strip the `fbid:` / `id.` prefixes some ids carry
pub fn format_id(id: &str) -> String {
    id.strip_prefix("fbid:")
        .or_else(|| id.strip_prefix("id."))
        .unwrap_or(id)
        .to_string()
}

/// Read an id or timestamp that may be a string or a number
pub fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Read an id field of `obj`
pub fn field_id(obj: &Value, key: &str) -> Option<String> {
    obj.get(key).and_then(id_string)
}

/// Thread id from a `threadKey`: the group id, else the other user's id
pub fn thread_id(thread_key: &Value) -> Option<String> {
    field_id(thread_key, "threadFbId")
        .or_else(|| field_id(thread_key, "otherUserFbId"))
        .map(|id| format_id(&id))
}

/// Whether a `threadKey` names a group thread
pub fn is_group(thread_key: &Value) -> bool {
    field_id(thread_key, "threadFbId").is_some()
}

/// List of participant ids, stringified
pub fn participant_ids(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(|v| v.as_array())
        .map(|ids| ids.iter().filter_map(id_string).collect())
        .unwrap_or_default()
}

/// Slice `text` by UTF-16 code unit offsets, clamped to the text length
pub fn utf16_slice(text: &str, offset: usize, length: usize) -> String {
    let units: Vec<u16> = text.encode_utf16().collect();
    let start = offset.min(units.len());
    let end = offset.saturating_add(length).min(units.len());
    String::from_utf16_lossy(&units[start..end])
}

/// Build the mention map from a `prng` range list.
///
/// Each range is `{i: user id, o: offset, l: length}` with offsets counted in
/// UTF-16 code units. The list arrives either as a JSON string or inline.
pub fn mentions_from_prng(body: &str, prng: Option<&Value>) -> BTreeMap<String, String> {
    let parsed;
    let ranges = match prng {
        Some(Value::String(raw)) => {
            parsed = serde_json::from_str::<Value>(raw).unwrap_or(Value::Null);
            &parsed
        }
        Some(inline) => inline,
        None => return BTreeMap::new(),
    };

    ranges
        .as_array()
        .map(|ranges| {
            ranges
                .iter()
                .filter_map(|range| {
                    let id = field_id(range, "i")?;
                    let offset = range.get("o")?.as_u64()? as usize;
                    let length = range.get("l")?.as_u64()? as usize;
                    Some((id, utf16_slice(body, offset, length)))
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Whitespace separated words of a message body
pub fn args(body: &str) -> Vec<String> {
    body.split_whitespace().map(str::to_string).collect()
}

fn kind_from_typename(typename: &str) -> &'static str {
    match typename {
        "MessageImage" => "photo",
        "MessageAnimatedImage" => "animated_image",
        "MessageVideo" => "video",
        "MessageAudio" => "audio",
        "MessageFile" => "file",
        "MessageLocation" => "location",
        _ => "unknown",
    }
}

fn dimension(value: &Value, key: &str) -> Option<u64> {
    value.get(key).and_then(|v| v.as_u64())
}

/// Format one attachment.
///
/// Accepts the legacy `mercury.attach_type` shape, the blob shape
/// (`mercury.blob_attachment.__typename`), stickers and shares, as well as a
/// `mercuryJSON` string in place of the `mercury` object.
pub fn format_attachment(raw: &Value) -> Attachment {
    let parsed_mercury = raw
        .get("mercuryJSON")
        .and_then(|v| v.as_str())
        .and_then(|s| serde_json::from_str::<Value>(s).ok());
    let mercury = raw
        .get("mercury")
        .or(parsed_mercury.as_ref())
        .unwrap_or(raw);

    let fallback_id = field_id(raw, "fbid").or_else(|| field_id(raw, "id"));

    if let Some(blob) = mercury.get("blob_attachment") {
        let typename = blob.get("__typename").and_then(|v| v.as_str()).unwrap_or("");
        let preview = blob
            .get("large_preview")
            .or_else(|| blob.get("preview"))
            .or_else(|| blob.get("animated_image"));
        return Attachment {
            kind: kind_from_typename(typename).to_string(),
            id: field_id(blob, "legacy_attachment_id")
                .or(fallback_id)
                .unwrap_or_default(),
            filename: blob.get("filename").and_then(|v| v.as_str()).map(str::to_string),
            url: preview
                .and_then(|p| p.get("uri"))
                .or_else(|| blob.get("playable_url"))
                .or_else(|| blob.get("url"))
                .and_then(|v| v.as_str())
                .map(str::to_string),
            width: blob
                .get("original_dimensions")
                .and_then(|d| dimension(d, "x"))
                .or_else(|| preview.and_then(|p| dimension(p, "width"))),
            height: blob
                .get("original_dimensions")
                .and_then(|d| dimension(d, "y"))
                .or_else(|| preview.and_then(|p| dimension(p, "height"))),
        };
    }

    if let Some(sticker) = mercury.get("sticker_attachment") {
        return Attachment {
            kind: "sticker".to_string(),
            id: field_id(sticker, "id").or(fallback_id).unwrap_or_default(),
            filename: None,
            url: sticker.get("url").and_then(|v| v.as_str()).map(str::to_string),
            width: dimension(sticker, "width"),
            height: dimension(sticker, "height"),
        };
    }

    if let Some(share) = mercury.get("extensible_attachment") {
        let story = share.get("story_attachment").unwrap_or(&Value::Null);
        return Attachment {
            kind: "share".to_string(),
            id: field_id(share, "legacy_attachment_id")
                .or(fallback_id)
                .unwrap_or_default(),
            filename: None,
            url: story.get("url").and_then(|v| v.as_str()).map(str::to_string),
            width: None,
            height: None,
        };
    }

    let metadata = mercury.get("metadata").unwrap_or(&Value::Null);
    let dims = metadata.get("dimensions").unwrap_or(&Value::Null);
    Attachment {
        kind: mercury
            .get("attach_type")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown")
            .to_string(),
        id: field_id(metadata, "fbid").or(fallback_id).unwrap_or_default(),
        filename: mercury.get("name").and_then(|v| v.as_str()).map(str::to_string),
        url: metadata
            .get("url")
            .or_else(|| mercury.get("url"))
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(str::to_string),
        width: dimension(dims, "width"),
        height: dimension(dims, "height"),
    }
}

fn attachments(value: Option<&Value>) -> Vec<Attachment> {
    value
        .and_then(|v| v.as_array())
        .map(|list| list.iter().map(format_attachment).collect())
        .unwrap_or_default()
}

/// Format a message from a delta body carrying `messageMetadata`.
///
/// Used for `NewMessage` deltas and for the message/replied-to parts of a
/// reply sub-delta.
pub fn format_message(delta: &Value) -> Result<Message, DecodeError> {
    let metadata = delta
        .get("messageMetadata")
        .ok_or(DecodeError::Field("messageMetadata"))?;
    let thread_key = metadata
        .get("threadKey")
        .ok_or(DecodeError::Field("messageMetadata.threadKey"))?;

    let body = delta
        .get("body")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();
    let prng = delta.get("data").and_then(|d| d.get("prng"));

    Ok(Message {
        thread_id: thread_id(thread_key).ok_or(DecodeError::Field("threadKey"))?,
        message_id: field_id(metadata, "messageId").ok_or(DecodeError::Field("messageId"))?,
        sender_id: field_id(metadata, "actorFbId")
            .map(|id| format_id(&id))
            .ok_or(DecodeError::Field("actorFbId"))?,
        mentions: mentions_from_prng(&body, prng),
        args: args(&body),
        attachments: attachments(delta.get("attachments")),
        timestamp: field_id(metadata, "timestamp").unwrap_or_default(),
        is_group: is_group(thread_key),
        participant_ids: participant_ids(delta.get("participants")),
        offline_threading_id: field_id(metadata, "offlineThreadingId"),
        body,
    })
}

/// Format a thread administration delta
pub fn format_log_event(
    delta: &Value,
    log_type: &str,
    data: Value,
) -> Result<LogEvent, DecodeError> {
    let metadata = delta
        .get("messageMetadata")
        .ok_or(DecodeError::Field("messageMetadata"))?;
    let thread_key = metadata
        .get("threadKey")
        .ok_or(DecodeError::Field("messageMetadata.threadKey"))?;

    Ok(LogEvent {
        thread_id: thread_id(thread_key).ok_or(DecodeError::Field("threadKey"))?,
        log_message_type: log_type.to_string(),
        log_message_data: data,
        log_message_body: metadata
            .get("adminText")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string(),
        author: field_id(metadata, "actorFbId").unwrap_or_default(),
        participant_ids: participant_ids(delta.get("participants")),
        timestamp: field_id(metadata, "timestamp").unwrap_or_default(),
    })
}

/// Format a message node returned by a message fetch (`UserMessage`)
pub fn format_fetched_message(node: &Value, thread_id: &str) -> Result<Message, DecodeError> {
    let sender = node
        .get("message_sender")
        .and_then(|s| field_id(s, "id"))
        .ok_or(DecodeError::Field("message_sender.id"))?;
    let body = node
        .get("message")
        .and_then(|m| m.get("text"))
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();

    let mentions = node
        .get("message")
        .and_then(|m| m.get("ranges"))
        .and_then(|v| v.as_array())
        .map(|ranges| {
            ranges
                .iter()
                .filter_map(|r| {
                    let id = r.get("entity").and_then(|e| field_id(e, "id"))?;
                    let offset = r.get("offset")?.as_u64()? as usize;
                    let length = r.get("length")?.as_u64()? as usize;
                    Some((id, utf16_slice(&body, offset, length)))
                })
                .collect()
        })
        .unwrap_or_default();

    let mut attachments: Vec<Attachment> = node
        .get("blob_attachments")
        .and_then(|v| v.as_array())
        .map(|list| {
            list.iter()
                .map(|blob| format_attachment(&serde_json::json!({ "blob_attachment": blob })))
                .collect()
        })
        .unwrap_or_default();
    if let Some(share) = node.get("extensible_attachment").filter(|v| !v.is_null()) {
        attachments.push(format_attachment(
            &serde_json::json!({ "extensible_attachment": share }),
        ));
    }

    Ok(Message {
        thread_id: thread_id.to_string(),
        message_id: field_id(node, "message_id").ok_or(DecodeError::Field("message_id"))?,
        is_group: sender != thread_id,
        sender_id: sender,
        args: args(&body),
        mentions,
        attachments,
        timestamp: field_id(node, "timestamp_precise").unwrap_or_default(),
        participant_ids: Vec::new(),
        offline_threading_id: None,
        body,
    })
}

/// Format a `ThreadImageMessage` node as a `log:thread-image` event
pub fn format_thread_image(node: &Value, thread_id: &str) -> LogEvent {
    let image = node.get("image_with_metadata").unwrap_or(&Value::Null);
    let dims = image.get("original_dimensions").unwrap_or(&Value::Null);
    LogEvent {
        thread_id: format_id(thread_id),
        log_message_type: "log:thread-image".to_string(),
        log_message_data: serde_json::json!({
            "image": {
                "attachmentID": field_id(image, "legacy_attachment_id"),
                "width": dimension(dims, "x"),
                "height": dimension(dims, "y"),
                "url": image.get("preview").and_then(|p| p.get("uri")),
            }
        }),
        log_message_body: node
            .get("snippet")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string(),
        author: node
            .get("message_sender")
            .and_then(|s| field_id(s, "id"))
            .unwrap_or_default(),
        participant_ids: Vec::new(),
        timestamp: field_id(node, "timestamp_precise").unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_format_id_prefixes() {
        assert_eq!(format_id("fbid:123"), "123");
        assert_eq!(format_id("id.456"), "456");
        assert_eq!(format_id("789"), "789");
    }

    #[test]
    fn test_thread_id_prefers_group() {
        assert_eq!(
            thread_id(&json!({ "threadFbId": 1, "otherUserFbId": 2 })).as_deref(),
            Some("1")
        );
        assert_eq!(thread_id(&json!({ "otherUserFbId": "2" })).as_deref(), Some("2"));
        assert!(thread_id(&json!({})).is_none());
    }

    #[test]
    fn test_mentions_use_utf16_offsets() {
        // The emoji takes two UTF-16 code units
        let body = "😀 @Alice hi";
        let prng = json!(r#"[{"i":"100","o":3,"l":6}]"#);
        let mentions = mentions_from_prng(body, Some(&prng));
        assert_eq!(mentions.get("100").map(String::as_str), Some("@Alice"));
    }

    #[test]
    fn test_mentions_clamped_to_body() {
        let prng = json!([{ "i": 5, "o": 2, "l": 100 }]);
        let mentions = mentions_from_prng("hey", Some(&prng));
        assert_eq!(mentions.get("5").map(String::as_str), Some("y"));
    }

    #[test]
    fn test_legacy_photo_attachment() {
        let raw = json!({
            "fbid": "999",
            "mercury": { "attach_type": "photo", "name": "a.jpg", "metadata": { "fbid": 999 } }
        });
        let attachment = format_attachment(&raw);
        assert_eq!(attachment.kind, "photo");
        assert_eq!(attachment.id, "999");
        assert!(attachment.needs_photo_url());
    }

    #[test]
    fn test_blob_attachment() {
        let raw = json!({
            "mercury": { "blob_attachment": {
                "__typename": "MessageImage",
                "legacy_attachment_id": "55",
                "filename": "image.png",
                "original_dimensions": { "x": 640, "y": 480 },
                "large_preview": { "uri": "https://cdn/x.png" }
            }}
        });
        let attachment = format_attachment(&raw);
        assert_eq!(attachment.kind, "photo");
        assert_eq!(attachment.url.as_deref(), Some("https://cdn/x.png"));
        assert_eq!((attachment.width, attachment.height), (Some(640), Some(480)));
        assert!(!attachment.needs_photo_url());
    }

    #[test]
    fn test_format_message_group_flag() {
        let delta = json!({
            "body": "hello  world",
            "messageMetadata": {
                "threadKey": { "threadFbId": "321" },
                "messageId": "mid.x",
                "actorFbId": 7,
                "timestamp": "1700",
                "offlineThreadingId": "6900"
            },
            "participants": [7, 8]
        });
        let message = format_message(&delta).unwrap();
        assert_eq!(message.thread_id, "321");
        assert!(message.is_group);
        assert_eq!(message.args, vec!["hello", "world"]);
        assert_eq!(message.participant_ids, vec!["7", "8"]);
        assert_eq!(message.ack_key(), "6900");
    }

    #[test]
    fn test_format_message_missing_metadata() {
        assert!(matches!(
            format_message(&json!({ "body": "x" })),
            Err(DecodeError::Field("messageMetadata"))
        ));
    }

    #[test]
    fn test_fetched_message_one_to_one() {
        let node = json!({
            "__typename": "UserMessage",
            "message_id": "mid.r",
            "message_sender": { "id": "44" },
            "message": { "text": "original" },
            "timestamp_precise": "1699"
        });
        let message = format_fetched_message(&node, "44").unwrap();
        assert!(!message.is_group);
        assert_eq!(message.body, "original");
        assert_eq!(message.timestamp, "1699");
    }
}
