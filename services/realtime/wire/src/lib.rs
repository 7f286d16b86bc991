//! MQTT framing and payload formats for the edge chat channel.
//!
//! The realtime endpoint speaks a reverse-engineered MQTT 3.1 profile over a
//! WebSocket. This crate covers everything that is bit-exact on the wire:
//!
//! - **Packets**: CONNECT/CONNACK, SUBSCRIBE/SUBACK, PUBLISH/PUBACK, PING
//! - **Incremental decoding**: packets split or batched across frames
//! - **Connect payload**: the JSON session descriptor in the username field
//! - **Topics**: the fixed subscribe set and request topics
//! - **Publish bodies**: initial sync, foreground state, `/ls_req` envelopes
//!
//! ## Packet Layout
//!
//! ```text
//! +-----------------------+----------------------------------+
//! | u8 type<<4 | flags    | control packet type + flags      |
//! +-----------------------+----------------------------------+
//! | varint remaining_len  | 1..4 bytes, 7 bits per byte      |
//! +-----------------------+----------------------------------+
//! | variable header       | topic / packet id / connect vars |
//! +-----------------------+----------------------------------+
//! | payload               | JSON for publishes               |
//! +-----------------------+----------------------------------+
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod codec;
pub mod connect;
pub mod error;
pub mod packet;
pub mod publish;
pub mod topics;

// Re-export main types
pub use codec::{PacketDecoder, DEFAULT_MAX_PACKET_SIZE};
pub use connect::{
    endpoint_url, random_session_id, ConnectParams, ConnectPayload, DEFAULT_CHAT_PATH, DEFAULT_EDGE_HOST,
    WEB_APP_ID,
};
pub use error::WireError;
pub use packet::{
    ConnAck, Connect, ConnectFlags, Packet, PacketType, Publish, QoS, SubAck, Subscribe,
};
pub use publish::{
    client_settings, foreground_state, initial_sync, ls_request, offline_threading_id,
    InitialSync, LsTask,
};
