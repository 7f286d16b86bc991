//! Inbound publish decoding.
//!
//! Decoding runs in two phases. A synchronous pass walks the payload and
//! dispatches each delta through a static class table, producing either a
//! finished event or a pending step that still needs a [`Resolver`] call.
//! An async pass then resolves pending steps strictly in delta order, so a
//! message whose photo needs resolving is still emitted before the delta
//! that followed it.

use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

use msgr_wire::topics;

use crate::client_payload::{self, SubDeltaKind};
use crate::cursor::SyncCursor;
use crate::event::{
    AdminKind, DeltaEvent, ForcedFetch, FriendRequest, Message, MessageReply, Presence, Reaction,
    Read, ReadReceipt, Typing, Unsend,
};
use crate::format::{
    self, field_id, format_fetched_message, format_id, format_log_event, format_message,
    format_thread_image, id_string,
};
use crate::resolver::{with_timeout, Resolver};
use crate::DecodeError;

/// What an inbound publish topic carries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// Sync envelope with deltas (`/t_ms`)
    SyncDeltas,
    /// Typing notification
    Typing,
    /// Presence list
    Presence,
    /// Legacy web notification
    LegacyWeb,
    /// RPC reply, routed to task correlation instead of the decoder
    TaskReply,
    /// Subscribed but not decoded
    Other,
}

/// Route a topic to the decoder branch handling it
pub fn route(topic: &str) -> FrameKind {
    match topic {
        topics::SYNC_DELTAS => FrameKind::SyncDeltas,
        topics::THREAD_TYPING | topics::ORCA_TYPING => FrameKind::Typing,
        topics::ORCA_PRESENCE => FrameKind::Presence,
        topics::LEGACY_WEB => FrameKind::LegacyWeb,
        topics::LS_RESP => FrameKind::TaskReply,
        _ => FrameKind::Other,
    }
}

/// Filtering and resolving options
#[derive(Debug, Clone)]
pub struct DecodeOptions {
    /// Emit messages and events authored by the session user
    pub self_listen: bool,
    /// Emit non-message events (reactions, unsends, log events, receipts)
    pub listen_events: bool,
    /// Emit typing indicators
    pub listen_typing: bool,
    /// Emit presence updates
    pub emit_presence: bool,
    /// Upper bound for each resolver call
    pub resolve_timeout: Duration,
}

impl Default for DecodeOptions {
    fn default() -> Self {
        Self {
            self_listen: false,
            listen_events: true,
            listen_typing: false,
            emit_presence: false,
            resolve_timeout: Duration::from_secs(10),
        }
    }
}

/// Result of decoding one publish
#[derive(Debug, Default)]
pub struct Decoded {
    /// Events to emit, in delta order
    pub events: Vec<DeltaEvent>,
    /// Ack keys of the session user's own messages echoed back
    pub acks: Vec<String>,
    /// Whether the sync cursor moved
    pub cursor_changed: bool,
    /// Deltas skipped because their shape did not match
    pub skipped: usize,
}

/// Delta `class` discriminator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeltaClass {
    /// New message
    NewMessage,
    /// Nested payload with reactions, unsends and replies
    ClientPayload,
    /// Read receipt from another participant
    ReadReceipt,
    /// Own read on another device
    MarkRead,
    /// Thread administration
    AdminTextMessage,
    /// Thread rename
    ThreadName,
    /// Participants added
    ParticipantsAdded,
    /// Participant left
    ParticipantLeft,
    /// Reference requiring a fetch
    ForcedFetch,
    /// Anything else; dispatched to a no-op
    Unknown,
}

static CLASS_TABLE: &[(&str, DeltaClass)] = &[
    ("NewMessage", DeltaClass::NewMessage),
    ("ClientPayload", DeltaClass::ClientPayload),
    ("ReadReceipt", DeltaClass::ReadReceipt),
    ("MarkRead", DeltaClass::MarkRead),
    ("AdminTextMessage", DeltaClass::AdminTextMessage),
    ("ThreadName", DeltaClass::ThreadName),
    ("ParticipantsAddedToGroupThread", DeltaClass::ParticipantsAdded),
    ("ParticipantLeftGroupThread", DeltaClass::ParticipantLeft),
    ("ForcedFetch", DeltaClass::ForcedFetch),
];

type DeltaHandler = fn(&Value, &mut Vec<Pending>) -> Result<(), DecodeError>;

impl DeltaClass {
    /// Look up a class name
    pub fn from_class(class: &str) -> Self {
        CLASS_TABLE
            .iter()
            .find(|(name, _)| *name == class)
            .map(|(_, kind)| *kind)
            .unwrap_or(DeltaClass::Unknown)
    }

    fn handler(self) -> DeltaHandler {
        match self {
            DeltaClass::NewMessage => on_new_message,
            DeltaClass::ClientPayload => on_client_payload,
            DeltaClass::ReadReceipt => on_read_receipt,
            DeltaClass::MarkRead => on_mark_read,
            DeltaClass::AdminTextMessage => on_admin_text,
            DeltaClass::ThreadName => on_thread_name,
            DeltaClass::ParticipantsAdded => on_participants_added,
            DeltaClass::ParticipantLeft => on_participant_left,
            DeltaClass::ForcedFetch => on_forced_fetch,
            DeltaClass::Unknown => ignore,
        }
    }
}

/// Output of the synchronous pass
#[derive(Debug)]
enum Pending {
    Ready(DeltaEvent),
    Photos(Message),
    Reply {
        reply: MessageReply,
        thread_id: String,
        replied_id: String,
    },
    Fetch {
        thread_id: String,
        message_id: String,
    },
}

fn ignore(_delta: &Value, _out: &mut Vec<Pending>) -> Result<(), DecodeError> {
    Ok(())
}

fn on_new_message(delta: &Value, out: &mut Vec<Pending>) -> Result<(), DecodeError> {
    let message = format_message(delta)?;
    if message.attachments.iter().any(|a| a.needs_photo_url()) {
        out.push(Pending::Photos(message));
    } else {
        out.push(Pending::Ready(DeltaEvent::NewMessage(message)));
    }
    Ok(())
}

fn on_client_payload(delta: &Value, out: &mut Vec<Pending>) -> Result<(), DecodeError> {
    let payload = delta
        .get("payload")
        .ok_or(DecodeError::Field("payload"))?;

    for sub in client_payload::decode(payload)? {
        let (kind, body) = client_payload::classify(&sub);
        match kind {
            SubDeltaKind::Reaction => out.push(Pending::Ready(reaction(body)?)),
            SubDeltaKind::Unsend => out.push(Pending::Ready(unsend(body)?)),
            SubDeltaKind::Reply => out.push(reply(body)?),
            SubDeltaKind::Unknown => debug!("Ignoring unknown client payload delta"),
        }
    }
    Ok(())
}

fn thread_of(body: &Value) -> Result<String, DecodeError> {
    body.get("threadKey")
        .and_then(format::thread_id)
        .ok_or(DecodeError::Field("threadKey"))
}

fn reaction(body: &Value) -> Result<DeltaEvent, DecodeError> {
    let sender = field_id(body, "senderId").filter(|id| id != "0");
    let user = field_id(body, "userId");
    // action 1 removes the reaction
    let removed = body.get("action").and_then(|v| v.as_u64()) == Some(1);

    Ok(DeltaEvent::MessageReaction(Reaction {
        thread_id: thread_of(body)?,
        message_id: field_id(body, "messageId").ok_or(DecodeError::Field("messageId"))?,
        reaction: if removed {
            None
        } else {
            body.get("reaction").and_then(|v| v.as_str()).map(str::to_string)
        },
        sender_id: sender
            .clone()
            .or_else(|| user.clone())
            .ok_or(DecodeError::Field("senderId"))?,
        user_id: user.or(sender).ok_or(DecodeError::Field("userId"))?,
    }))
}

fn unsend(body: &Value) -> Result<DeltaEvent, DecodeError> {
    Ok(DeltaEvent::MessageUnsend(Unsend {
        thread_id: thread_of(body)?,
        message_id: field_id(body, "messageID").ok_or(DecodeError::Field("messageID"))?,
        sender_id: field_id(body, "senderID").ok_or(DecodeError::Field("senderID"))?,
        deletion_timestamp: field_id(body, "deletionTimestamp").unwrap_or_default(),
        timestamp: field_id(body, "timestamp").unwrap_or_default(),
    }))
}

fn reply(body: &Value) -> Result<Pending, DecodeError> {
    let message = format_message(body.get("message").ok_or(DecodeError::Field("message"))?)?;

    if let Some(replied) = body.get("repliedToMessage").filter(|v| !v.is_null()) {
        let replied_to = format_message(replied).ok().map(Box::new);
        return Ok(Pending::Ready(DeltaEvent::MessageReply(MessageReply {
            message,
            replied_to,
        })));
    }

    match body
        .get("replyToMessageId")
        .and_then(|r| field_id(r, "id"))
    {
        Some(replied_id) => Ok(Pending::Reply {
            thread_id: message.thread_id.clone(),
            replied_id,
            reply: MessageReply {
                message,
                replied_to: None,
            },
        }),
        None => Ok(Pending::Ready(DeltaEvent::MessageReply(MessageReply {
            message,
            replied_to: None,
        }))),
    }
}

fn on_read_receipt(delta: &Value, out: &mut Vec<Pending>) -> Result<(), DecodeError> {
    let key = delta
        .get("threadKey")
        .ok_or(DecodeError::Field("threadKey"))?;
    let other = field_id(key, "otherUserFbId");

    out.push(Pending::Ready(DeltaEvent::ReadReceipt(ReadReceipt {
        reader: other
            .clone()
            .or_else(|| field_id(delta, "actorFbId"))
            .ok_or(DecodeError::Field("actorFbId"))?,
        time: field_id(delta, "actionTimestampMs").unwrap_or_default(),
        thread_id: other
            .or_else(|| field_id(key, "threadFbId"))
            .map(|id| format_id(&id))
            .ok_or(DecodeError::Field("threadKey"))?,
    })));
    Ok(())
}

fn on_mark_read(delta: &Value, out: &mut Vec<Pending>) -> Result<(), DecodeError> {
    let time = field_id(delta, "actionTimestamp")
        .or_else(|| field_id(delta, "watermarkTimestampMs"))
        .unwrap_or_default();
    let keys = delta
        .get("threadKeys")
        .and_then(|v| v.as_array())
        .ok_or(DecodeError::Field("threadKeys"))?;

    for key in keys {
        if let Some(thread_id) = format::thread_id(key) {
            out.push(Pending::Ready(DeltaEvent::MarkRead(Read {
                thread_id,
                time: time.clone(),
            })));
        }
    }
    Ok(())
}

fn on_admin_text(delta: &Value, out: &mut Vec<Pending>) -> Result<(), DecodeError> {
    let raw = delta.get("type").and_then(|v| v.as_str()).unwrap_or("");
    let Some(kind) = AdminKind::from_type(raw) else {
        debug!("Ignoring admin text message of type {}", raw);
        return Ok(());
    };
    let data = delta.get("untypedData").cloned().unwrap_or(Value::Null);
    let event = format_log_event(delta, kind.log_type(), data)?;
    out.push(Pending::Ready(DeltaEvent::AdminEvent { kind, event }));
    Ok(())
}

fn on_thread_name(delta: &Value, out: &mut Vec<Pending>) -> Result<(), DecodeError> {
    let data = json!({ "name": delta.get("name").cloned().unwrap_or(Value::Null) });
    let event = format_log_event(delta, "log:thread-name", data)?;
    out.push(Pending::Ready(DeltaEvent::ThreadNameChanged(event)));
    Ok(())
}

fn on_participants_added(delta: &Value, out: &mut Vec<Pending>) -> Result<(), DecodeError> {
    let data = json!({
        "addedParticipants": delta.get("addedParticipants").cloned().unwrap_or(json!([]))
    });
    let event = format_log_event(delta, "log:subscribe", data)?;
    out.push(Pending::Ready(DeltaEvent::ParticipantsAdded(event)));
    Ok(())
}

fn on_participant_left(delta: &Value, out: &mut Vec<Pending>) -> Result<(), DecodeError> {
    let data = json!({
        "leftParticipantFbId": delta.get("leftParticipantFbId").cloned().unwrap_or(Value::Null)
    });
    let event = format_log_event(delta, "log:unsubscribe", data)?;
    out.push(Pending::Ready(DeltaEvent::ParticipantLeft(event)));
    Ok(())
}

fn on_forced_fetch(delta: &Value, out: &mut Vec<Pending>) -> Result<(), DecodeError> {
    let thread_id = delta
        .get("threadKey")
        .and_then(|key| field_id(key, "threadFbId"));
    let message_id = field_id(delta, "messageId");

    if let (Some(thread_id), Some(message_id)) = (thread_id, message_id) {
        out.push(Pending::Fetch {
            thread_id,
            message_id,
        });
    }
    Ok(())
}

fn now_ms() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
        .to_string()
}

/// Decoder for inbound publishes of one session
pub struct Decoder {
    user_id: String,
    options: DecodeOptions,
    resolver: Arc<dyn Resolver>,
}

impl Decoder {
    /// Create a decoder for the given session user
    pub fn new(user_id: impl Into<String>, options: DecodeOptions, resolver: Arc<dyn Resolver>) -> Self {
        Self {
            user_id: user_id.into(),
            options,
            resolver,
        }
    }

    /// Decoding options in effect
    pub fn options(&self) -> &DecodeOptions {
        &self.options
    }

    /// Decode one publish payload.
    ///
    /// A payload that is not JSON fails as a whole; a delta with an
    /// unexpected shape is skipped and counted in [`Decoded::skipped`].
    pub async fn decode(
        &self,
        kind: FrameKind,
        payload: &[u8],
        cursor: &mut SyncCursor,
    ) -> Result<Decoded, DecodeError> {
        let mut decoded = Decoded::default();
        if matches!(kind, FrameKind::TaskReply | FrameKind::Other) {
            return Ok(decoded);
        }

        let value: Value = serde_json::from_slice(payload)?;
        let mut pending = Vec::new();

        match kind {
            FrameKind::SyncDeltas => {
                decoded.cursor_changed = cursor.apply(&value);
                if let Some(deltas) = value.get("deltas").and_then(|v| v.as_array()) {
                    for delta in deltas {
                        let class = delta.get("class").and_then(|v| v.as_str()).unwrap_or("");
                        if let Err(e) = DeltaClass::from_class(class).handler()(delta, &mut pending)
                        {
                            warn!("Skipping {} delta: {}", class, e);
                            decoded.skipped += 1;
                        }
                    }
                }
            }
            FrameKind::Typing => {
                if self.options.listen_typing {
                    pending.push(Pending::Ready(typing(&value)?));
                }
            }
            FrameKind::Presence => {
                if self.options.emit_presence {
                    pending.extend(presence(&value).into_iter().map(Pending::Ready));
                }
            }
            FrameKind::LegacyWeb => {
                if let Some(event) = friend_request(&value) {
                    pending.push(Pending::Ready(event));
                }
            }
            FrameKind::TaskReply | FrameKind::Other => {}
        }

        for step in pending {
            if let Some(event) = self.resolve(step).await {
                self.accept(event, &mut decoded);
            }
        }
        Ok(decoded)
    }

    /// Record own-message acks, then apply the listen filters
    fn accept(&self, event: DeltaEvent, decoded: &mut Decoded) {
        let own = event.author() == Some(self.user_id.as_str());
        if own {
            match &event {
                DeltaEvent::NewMessage(m) => decoded.acks.push(m.ack_key().to_string()),
                DeltaEvent::MessageReply(r) => decoded.acks.push(r.message.ack_key().to_string()),
                _ => {}
            }
            if !self.options.self_listen {
                return;
            }
        }
        if !self.options.listen_events && !event.is_message() {
            return;
        }
        decoded.events.push(event);
    }

    async fn resolve(&self, step: Pending) -> Option<DeltaEvent> {
        let limit = self.options.resolve_timeout;
        match step {
            Pending::Ready(event) => Some(event),
            Pending::Photos(mut message) => {
                // One at a time to keep attachment order
                for attachment in message.attachments.iter_mut() {
                    if !attachment.needs_photo_url() {
                        continue;
                    }
                    match with_timeout(limit, self.resolver.resolve_photo_url(&attachment.id)).await
                    {
                        Ok(url) => attachment.url = Some(url),
                        Err(e) => debug!("Photo {} left unresolved: {}", attachment.id, e),
                    }
                }
                Some(DeltaEvent::NewMessage(message))
            }
            Pending::Reply {
                mut reply,
                thread_id,
                replied_id,
            } => {
                let fetched =
                    with_timeout(limit, self.resolver.fetch_message(&thread_id, &replied_id)).await;
                match fetched {
                    Ok(node) => match format_fetched_message(&node, &thread_id) {
                        Ok(message) => reply.replied_to = Some(Box::new(message)),
                        Err(e) => warn!("Replied-to message {} malformed: {}", replied_id, e),
                    },
                    Err(e) => warn!("Failed to fetch replied-to message {}: {}", replied_id, e),
                }
                Some(DeltaEvent::MessageReply(reply))
            }
            Pending::Fetch {
                thread_id,
                message_id,
            } => {
                let node =
                    match with_timeout(limit, self.resolver.fetch_message(&thread_id, &message_id))
                        .await
                    {
                        Ok(node) => node,
                        Err(e) => {
                            warn!("Forced fetch of {} failed: {}", message_id, e);
                            return None;
                        }
                    };
                match node.get("__typename").and_then(|v| v.as_str()) {
                    Some("ThreadImageMessage") => Some(DeltaEvent::ForcedFetchResolved(
                        ForcedFetch::ThreadImage(format_thread_image(&node, &thread_id)),
                    )),
                    Some("UserMessage") => match format_fetched_message(&node, &thread_id) {
                        Ok(message) => {
                            Some(DeltaEvent::ForcedFetchResolved(ForcedFetch::Message(message)))
                        }
                        Err(e) => {
                            warn!("Forced fetch of {} malformed: {}", message_id, e);
                            None
                        }
                    },
                    other => {
                        debug!("Ignoring forced fetch result of type {:?}", other);
                        None
                    }
                }
            }
        }
    }
}

fn typing(value: &Value) -> Result<DeltaEvent, DecodeError> {
    let from = field_id(value, "sender_fbid").ok_or(DecodeError::Field("sender_fbid"))?;
    let thread = field_id(value, "thread").unwrap_or_else(|| from.clone());
    Ok(DeltaEvent::Typing(Typing {
        is_typing: value.get("state").and_then(|v| v.as_u64()).unwrap_or(0) != 0,
        thread_id: format_id(&thread),
        from,
    }))
}

fn presence(value: &Value) -> Vec<DeltaEvent> {
    value
        .get("list")
        .and_then(|v| v.as_array())
        .map(|list| {
            list.iter()
                .filter_map(|entry| {
                    Some(DeltaEvent::Presence(Presence {
                        user_id: entry.get("u").and_then(id_string)?,
                        timestamp: entry.get("l").and_then(|v| v.as_u64()).unwrap_or(0) * 1000,
                        statuses: entry.get("p").cloned().unwrap_or(Value::Null),
                    }))
                })
                .collect()
        })
        .unwrap_or_default()
}

fn friend_request(value: &Value) -> Option<DeltaEvent> {
    let kind = value.get("type").and_then(|v| v.as_str())?;
    let request = || {
        Some(FriendRequest {
            actor_fb_id: field_id(value, "from")?,
            timestamp: now_ms(),
        })
    };
    match kind {
        "jewel_requests_add" => request().map(DeltaEvent::FriendRequestReceived),
        "jewel_requests_remove_old" => request().map(DeltaEvent::FriendRequestCancel),
        _ => None,
    }
}
