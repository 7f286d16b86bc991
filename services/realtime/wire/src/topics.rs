//! Topic names used on the edge chat channel.

/// Sync delta stream
pub const SYNC_DELTAS: &str = "/t_ms";
/// Typing notifications (threads)
pub const THREAD_TYPING: &str = "/thread_typing";
/// Typing notifications (one-to-one)
pub const ORCA_TYPING: &str = "/orca_typing_notifications";
/// Presence list updates
pub const ORCA_PRESENCE: &str = "/orca_presence";
/// Legacy web notifications (friend requests)
pub const LEGACY_WEB: &str = "/legacy_web";
/// RPC request envelopes
pub const LS_REQ: &str = "/ls_req";
/// RPC responses
pub const LS_RESP: &str = "/ls_resp";
/// Create a fresh sync queue
pub const SYNC_CREATE_QUEUE: &str = "/messenger_sync_create_queue";
/// Resume an existing sync queue
pub const SYNC_GET_DIFFS: &str = "/messenger_sync_get_diffs";
/// Foreground / availability state
pub const FOREGROUND_STATE: &str = "/foreground_state";
/// Client settings
pub const SET_CLIENT_SETTINGS: &str = "/set_client_settings";

/// Fixed set subscribed after every CONNACK, in subscription order
pub const SUBSCRIBE_TOPICS: [&str; 19] = [
    LEGACY_WEB,
    "/webrtc",
    "/rtc_multi",
    "/onevc",
    "/br_sr",
    "/sr_res",
    SYNC_DELTAS,
    THREAD_TYPING,
    ORCA_TYPING,
    "/notify_disconnect",
    ORCA_PRESENCE,
    "/inbox",
    "/mercury",
    "/messaging_events",
    "/orca_message_notifications",
    "/pp",
    "/webrtc_response",
    LS_REQ,
    LS_RESP,
];
