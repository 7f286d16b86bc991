//! Decoded domain events and the consumer facing event stream items.
//!
//! [`DeltaEvent`] is the closed set of things the decoder produces from the
//! channel. [`Event`] is what consumers receive: every delta plus the
//! lifecycle signals (ready, terminal errors) raised by the engine. Events
//! serialize with a `type` discriminator and the field names existing chat
//! bot consumers expect (`threadID`, `senderID`, ...).

use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;

/// An attachment on a message
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Attachment {
    /// Attachment kind (photo, video, audio, file, sticker, share, ...)
    #[serde(rename = "type")]
    pub kind: String,
    /// Attachment id
    #[serde(rename = "ID")]
    pub id: String,
    /// Original filename, when known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    /// Download or preview URL
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Width in pixels
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<u64>,
    /// Height in pixels
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<u64>,
}

impl Attachment {
    /// A photo that still needs its URL resolved by id
    pub fn needs_photo_url(&self) -> bool {
        self.kind == "photo" && self.url.is_none() && !self.id.is_empty()
    }
}

/// A chat message
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Thread id
    #[serde(rename = "threadID")]
    pub thread_id: String,
    /// Message id
    #[serde(rename = "messageID")]
    pub message_id: String,
    /// Author id
    #[serde(rename = "senderID")]
    pub sender_id: String,
    /// Text body, empty for attachment-only messages
    pub body: String,
    /// Whitespace separated words of the body
    pub args: Vec<String>,
    /// Attachments in delivery order
    pub attachments: Vec<Attachment>,
    /// Mentioned user id to mentioned text
    pub mentions: BTreeMap<String, String>,
    /// Server timestamp (ms)
    pub timestamp: String,
    /// Whether the thread is a group
    pub is_group: bool,
    /// Participants of the thread, when the delta carries them
    #[serde(rename = "participantIDs")]
    pub participant_ids: Vec<String>,
    /// Client generated id of an outbound message, used for ack matching
    #[serde(skip)]
    pub offline_threading_id: Option<String>,
}

impl Message {
    /// Key used to match this message against a recorded send
    pub fn ack_key(&self) -> &str {
        self.offline_threading_id
            .as_deref()
            .unwrap_or(&self.message_id)
    }
}

/// A message sent as a reply to another one
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MessageReply {
    /// The reply itself
    #[serde(flatten)]
    pub message: Message,
    /// The replied-to message, absent when it could not be resolved
    #[serde(rename = "messageReply", skip_serializing_if = "Option::is_none")]
    pub replied_to: Option<Box<Message>>,
}

/// Thread administration event (`log:*`)
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEvent {
    /// Thread id
    #[serde(rename = "threadID")]
    pub thread_id: String,
    /// `log:*` type, e.g. `log:thread-name`
    pub log_message_type: String,
    /// Type specific data
    pub log_message_data: Value,
    /// Human readable description
    pub log_message_body: String,
    /// Actor id
    pub author: String,
    /// Participants of the thread
    #[serde(rename = "participantIDs")]
    pub participant_ids: Vec<String>,
    /// Server timestamp (ms)
    pub timestamp: String,
}

/// Subtype of an `AdminTextMessage` delta
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdminKind {
    /// change_thread_theme
    ThreadTheme,
    /// change_thread_nickname
    Nickname,
    /// change_thread_icon
    ThreadIcon,
    /// change_thread_quick_reaction
    QuickReaction,
    /// change_thread_admins
    ThreadAdmins,
    /// group_poll
    GroupPoll,
    /// joinable_group_link_mode_change
    JoinableLinkMode,
    /// magic_words
    MagicWords,
    /// change_thread_approval_mode
    ApprovalMode,
    /// messenger_call_log
    CallLog,
    /// participant_joined_group_call
    JoinedGroupCall,
}

impl AdminKind {
    /// Map the delta `type` field; unknown subtypes yield `None`
    pub fn from_type(raw: &str) -> Option<Self> {
        Some(match raw {
            "change_thread_theme" => AdminKind::ThreadTheme,
            "change_thread_nickname" => AdminKind::Nickname,
            "change_thread_icon" => AdminKind::ThreadIcon,
            "change_thread_quick_reaction" => AdminKind::QuickReaction,
            "change_thread_admins" => AdminKind::ThreadAdmins,
            "group_poll" => AdminKind::GroupPoll,
            "joinable_group_link_mode_change" => AdminKind::JoinableLinkMode,
            "magic_words" => AdminKind::MagicWords,
            "change_thread_approval_mode" => AdminKind::ApprovalMode,
            "messenger_call_log" => AdminKind::CallLog,
            "participant_joined_group_call" => AdminKind::JoinedGroupCall,
            _ => return None,
        })
    }

    /// The `logMessageType` emitted for this subtype
    pub fn log_type(self) -> &'static str {
        match self {
            AdminKind::ThreadTheme => "log:thread-color",
            AdminKind::Nickname => "log:user-nickname",
            AdminKind::ThreadIcon | AdminKind::QuickReaction => "log:thread-icon",
            AdminKind::ThreadAdmins => "log:thread-admins",
            AdminKind::GroupPoll => "log:thread-poll",
            AdminKind::ApprovalMode => "log:thread-approval-mode",
            AdminKind::CallLog | AdminKind::JoinedGroupCall => "log:thread-call",
            AdminKind::JoinableLinkMode => "joinable_group_link_mode_change",
            AdminKind::MagicWords => "magic_words",
        }
    }
}

/// Another participant read a thread
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReadReceipt {
    /// Reader id
    pub reader: String,
    /// Read time (ms)
    pub time: String,
    /// Thread id
    #[serde(rename = "threadID")]
    pub thread_id: String,
}

/// The session user read a thread on another device
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Read {
    /// Thread id
    #[serde(rename = "threadID")]
    pub thread_id: String,
    /// Read time (ms)
    pub time: String,
}

/// Reaction added to or removed from a message
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reaction {
    /// Thread id
    #[serde(rename = "threadID")]
    pub thread_id: String,
    /// Reacted message id
    #[serde(rename = "messageID")]
    pub message_id: String,
    /// Reaction emoji, absent when removed
    pub reaction: Option<String>,
    /// Author of the reacted message
    #[serde(rename = "senderID")]
    pub sender_id: String,
    /// User who reacted
    #[serde(rename = "userID")]
    pub user_id: String,
}

/// A message was unsent
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Unsend {
    /// Thread id
    #[serde(rename = "threadID")]
    pub thread_id: String,
    /// Removed message id
    #[serde(rename = "messageID")]
    pub message_id: String,
    /// Author of the removed message
    #[serde(rename = "senderID")]
    pub sender_id: String,
    /// When the message was removed (ms)
    pub deletion_timestamp: String,
    /// Server timestamp (ms)
    pub timestamp: String,
}

/// Typing indicator change
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Typing {
    /// Whether the user started typing
    pub is_typing: bool,
    /// Typing user id
    pub from: String,
    /// Thread id
    #[serde(rename = "threadID")]
    pub thread_id: String,
}

/// Presence update for one user
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Presence {
    /// User id
    #[serde(rename = "userID")]
    pub user_id: String,
    /// Last active time (ms)
    pub timestamp: u64,
    /// Raw presence status code
    pub statuses: Value,
}

/// Friend request added or withdrawn
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FriendRequest {
    /// Requesting user id
    pub actor_fb_id: String,
    /// Receive time (ms)
    pub timestamp: String,
}

/// Result of a forced fetch
#[derive(Debug, Clone, PartialEq)]
pub enum ForcedFetch {
    /// The referenced item was a regular message
    Message(Message),
    /// The referenced item was a thread image change
    ThreadImage(LogEvent),
}

/// Closed set of events decoded from the channel
#[derive(Debug, Clone, PartialEq)]
pub enum DeltaEvent {
    /// New message
    NewMessage(Message),
    /// Another participant read a thread
    ReadReceipt(ReadReceipt),
    /// The session user read a thread elsewhere
    MarkRead(Read),
    /// Thread administration event
    AdminEvent {
        /// Subtype of the admin delta
        kind: AdminKind,
        /// Formatted event
        event: LogEvent,
    },
    /// Thread renamed
    ThreadNameChanged(LogEvent),
    /// Participants added to a group
    ParticipantsAdded(LogEvent),
    /// Participant left a group
    ParticipantLeft(LogEvent),
    /// Reaction change
    MessageReaction(Reaction),
    /// Message unsent
    MessageUnsend(Unsend),
    /// Reply to a message
    MessageReply(MessageReply),
    /// Typing indicator
    Typing(Typing),
    /// Presence update
    Presence(Presence),
    /// Materialized forced fetch
    ForcedFetchResolved(ForcedFetch),
    /// Friend request received
    FriendRequestReceived(FriendRequest),
    /// Friend request withdrawn
    FriendRequestCancel(FriendRequest),
}

impl DeltaEvent {
    /// Author of a message-like or log event, used for self-listen filtering
    pub fn author(&self) -> Option<&str> {
        match self {
            DeltaEvent::NewMessage(m)
            | DeltaEvent::ForcedFetchResolved(ForcedFetch::Message(m)) => Some(&m.sender_id),
            DeltaEvent::MessageReply(r) => Some(&r.message.sender_id),
            DeltaEvent::AdminEvent { event, .. }
            | DeltaEvent::ThreadNameChanged(event)
            | DeltaEvent::ParticipantsAdded(event)
            | DeltaEvent::ParticipantLeft(event)
            | DeltaEvent::ForcedFetchResolved(ForcedFetch::ThreadImage(event)) => {
                Some(&event.author)
            }
            _ => None,
        }
    }

    /// Whether this is a message or reply (never suppressed by event filtering)
    pub fn is_message(&self) -> bool {
        matches!(
            self,
            DeltaEvent::NewMessage(_)
                | DeltaEvent::MessageReply(_)
                | DeltaEvent::ForcedFetchResolved(ForcedFetch::Message(_))
        )
    }
}

/// Item of the consumer event stream
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// New message
    Message(Message),
    /// Reply to a message
    MessageReply(MessageReply),
    /// Thread administration event
    Event(LogEvent),
    /// Typing indicator
    Typ(Typing),
    /// The session user read a thread elsewhere
    Read(Read),
    /// Another participant read a thread
    ReadReceipt(ReadReceipt),
    /// Reaction change
    MessageReaction(Reaction),
    /// Presence update
    Presence(Presence),
    /// Message unsent
    MessageUnsend(Unsend),
    /// Friend request received
    FriendRequestReceived(FriendRequest),
    /// Friend request withdrawn
    FriendRequestCancel(FriendRequest),
    /// The session reached readiness after connecting
    Ready,
    /// The session is no longer authenticated; no reconnect follows
    NotLoggedIn {
        /// Error that revealed the logout
        error: String,
    },
    /// Listening stopped and will not resume
    StopListen {
        /// Reason listening stopped
        error: String,
    },
    /// The account appears blocked or inactive
    AccountInactive {
        /// Reason reported to the consumer
        error: String,
    },
}

impl Event {
    /// The `type` discriminator of this event
    pub fn kind(&self) -> &'static str {
        match self {
            Event::Message(_) => "message",
            Event::MessageReply(_) => "message_reply",
            Event::Event(_) => "event",
            Event::Typ(_) => "typ",
            Event::Read(_) => "read",
            Event::ReadReceipt(_) => "read_receipt",
            Event::MessageReaction(_) => "message_reaction",
            Event::Presence(_) => "presence",
            Event::MessageUnsend(_) => "message_unsend",
            Event::FriendRequestReceived(_) => "friend_request_received",
            Event::FriendRequestCancel(_) => "friend_request_cancel",
            Event::Ready => "ready",
            Event::NotLoggedIn { .. } => "not_logged_in",
            Event::StopListen { .. } => "stop_listen",
            Event::AccountInactive { .. } => "account_inactive",
        }
    }

    /// Whether the engine stops after emitting this event
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Event::NotLoggedIn { .. } | Event::StopListen { .. } | Event::AccountInactive { .. }
        )
    }
}

impl From<DeltaEvent> for Event {
    fn from(delta: DeltaEvent) -> Self {
        match delta {
            DeltaEvent::NewMessage(m) => Event::Message(m),
            DeltaEvent::ReadReceipt(r) => Event::ReadReceipt(r),
            DeltaEvent::MarkRead(r) => Event::Read(r),
            DeltaEvent::AdminEvent { event, .. }
            | DeltaEvent::ThreadNameChanged(event)
            | DeltaEvent::ParticipantsAdded(event)
            | DeltaEvent::ParticipantLeft(event) => Event::Event(event),
            DeltaEvent::MessageReaction(r) => Event::MessageReaction(r),
            DeltaEvent::MessageUnsend(u) => Event::MessageUnsend(u),
            DeltaEvent::MessageReply(r) => Event::MessageReply(r),
            DeltaEvent::Typing(t) => Event::Typ(t),
            DeltaEvent::Presence(p) => Event::Presence(p),
            DeltaEvent::ForcedFetchResolved(ForcedFetch::Message(m)) => Event::Message(m),
            DeltaEvent::ForcedFetchResolved(ForcedFetch::ThreadImage(e)) => Event::Event(e),
            DeltaEvent::FriendRequestReceived(f) => Event::FriendRequestReceived(f),
            DeltaEvent::FriendRequestCancel(f) => Event::FriendRequestCancel(f),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn message() -> Message {
        Message {
            thread_id: "42".into(),
            message_id: "mid.1".into(),
            sender_id: "7".into(),
            body: "hi there".into(),
            args: vec!["hi".into(), "there".into()],
            attachments: Vec::new(),
            mentions: BTreeMap::new(),
            timestamp: "1700000000000".into(),
            is_group: false,
            participant_ids: Vec::new(),
            offline_threading_id: Some("123".into()),
        }
    }

    #[test]
    fn test_message_serializes_with_type_tag() {
        let value = serde_json::to_value(Event::Message(message())).unwrap();
        assert_eq!(value["type"], "message");
        assert_eq!(value["threadID"], "42");
        assert_eq!(value["messageID"], "mid.1");
        assert_eq!(value["senderID"], "7");
        assert_eq!(value["isGroup"], false);
        assert!(value.get("offline_threading_id").is_none());
    }

    #[test]
    fn test_reply_flattens_message() {
        let reply = MessageReply {
            message: message(),
            replied_to: Some(Box::new(message())),
        };
        let value = serde_json::to_value(Event::MessageReply(reply)).unwrap();
        assert_eq!(value["type"], "message_reply");
        assert_eq!(value["body"], "hi there");
        assert_eq!(value["messageReply"]["messageID"], "mid.1");
    }

    #[test]
    fn test_lifecycle_events() {
        assert_eq!(serde_json::to_value(Event::Ready).unwrap(), json!({ "type": "ready" }));
        let stop = Event::StopListen {
            error: "Connection refused: Server unavailable".into(),
        };
        assert!(stop.is_terminal());
        assert_eq!(serde_json::to_value(&stop).unwrap()["type"], "stop_listen");
        assert!(!Event::Ready.is_terminal());
    }

    #[test]
    fn test_admin_kind_mapping() {
        assert_eq!(
            AdminKind::from_type("change_thread_theme").map(AdminKind::log_type),
            Some("log:thread-color")
        );
        assert_eq!(
            AdminKind::from_type("participant_joined_group_call").map(AdminKind::log_type),
            Some("log:thread-call")
        );
        assert_eq!(
            AdminKind::from_type("magic_words").map(AdminKind::log_type),
            Some("magic_words")
        );
        assert!(AdminKind::from_type("something_new").is_none());
    }

    #[test]
    fn test_ack_key_prefers_offline_id() {
        let mut m = message();
        assert_eq!(m.ack_key(), "123");
        m.offline_threading_id = None;
        assert_eq!(m.ack_key(), "mid.1");
    }

    #[test]
    fn test_delta_event_conversion() {
        let delta = DeltaEvent::Typing(Typing {
            is_typing: true,
            from: "7".into(),
            thread_id: "7".into(),
        });
        let event = Event::from(delta);
        assert_eq!(event.kind(), "typ");
    }
}
