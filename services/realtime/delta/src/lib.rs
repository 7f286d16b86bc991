//! Sync delta decoding for the edge chat channel.
//!
//! Inbound publishes carry JSON: sync envelopes with a list of deltas on
//! `/t_ms`, plus typing, presence and legacy notifications on their own
//! topics. This crate turns them into the closed [`DeltaEvent`] set and the
//! consumer facing [`Event`] stream items.
//!
//! - **Dispatch**: deltas are routed by their `class` through a static table;
//!   unknown classes map to a no-op
//! - **Nested payloads**: `ClientPayload` deltas are unpacked and decoded
//! - **Dependent fetches**: photo URLs, replied-to messages and forced
//!   fetches go through a [`Resolver`], awaited in delta order
//! - **Cursor**: envelope fields advance the [`SyncCursor`]

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod client_payload;
pub mod cursor;
pub mod decoder;
pub mod error;
pub mod event;
pub mod format;
pub mod resolver;

// Re-export main types
pub use cursor::SyncCursor;
pub use decoder::{route, DecodeOptions, Decoded, Decoder, DeltaClass, FrameKind};
pub use error::{DecodeError, ResolveError};
pub use event::{
    AdminKind, Attachment, DeltaEvent, Event, ForcedFetch, FriendRequest, LogEvent, Message,
    MessageReply, Presence, Reaction, Read, ReadReceipt, Typing, Unsend,
};
pub use resolver::{NoopResolver, Resolver};
