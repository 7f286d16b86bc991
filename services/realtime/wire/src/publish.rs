//! JSON bodies of the client's outbound publishes.

use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::topics::{SYNC_CREATE_QUEUE, SYNC_GET_DIFFS};
use crate::WireError;

/// Application id used inside `/ls_req` envelopes
pub const LS_APP_ID: &str = "2220391788200892";
/// Version id used inside `/ls_req` task batches
pub const LS_VERSION_ID: &str = "7191105584331330";
/// Envelope type for task batches
pub const LS_REQUEST_TYPE: u32 = 3;

/// Sync API version requested on connect
pub const SYNC_API_VERSION: u32 = 10;

/// Initial sync request published right after subscribing
#[derive(Debug, Clone, PartialEq)]
pub struct InitialSync {
    /// Topic the request goes to (create queue or get diffs)
    pub topic: &'static str,
    /// JSON body
    pub body: Value,
}

/// Build the initial sync request.
///
/// Without a sync token a fresh queue is created, seeded with the last known
/// sequence id; with one, the diffs since `(sync_token, last_seq_id)` are
/// requested instead.
pub fn initial_sync(user_id: &str, last_seq_id: u64, sync_token: Option<&str>) -> InitialSync {
    let mut body = json!({
        "sync_api_version": SYNC_API_VERSION,
        "max_deltas_able_to_process": 1000,
        "delta_batch_size": 500,
        "encoding": "JSON",
        "entity_fbid": user_id,
        "device_params": null,
    });

    match sync_token {
        Some(token) if !token.is_empty() => {
            body["last_seq_id"] = json!(last_seq_id);
            body["sync_token"] = json!(token);
            InitialSync {
                topic: SYNC_GET_DIFFS,
                body,
            }
        }
        _ => {
            body["initial_titan_sequence_id"] = json!(last_seq_id);
            InitialSync {
                topic: SYNC_CREATE_QUEUE,
                body,
            }
        }
    }
}

/// Body of `/foreground_state`
pub fn foreground_state(foreground: bool) -> Value {
    json!({ "foreground": foreground })
}

/// Body of `/set_client_settings`
pub fn client_settings() -> Value {
    json!({ "make_user_available_when_in_foreground": true })
}

/// A single task inside an `/ls_req` batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LsTask {
    /// Task label understood by the endpoint (e.g. "46" for send message)
    pub label: String,
    /// Task payload, serialized to a JSON string on the wire
    pub payload: Value,
    /// Queue the task is ordered in, usually the thread id
    pub queue_name: String,
}

/// Generate an offline threading id: milliseconds shifted left by 22 bits
/// with random low bits.
pub fn offline_threading_id() -> u64 {
    let ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64;
    let random: u64 = rand::thread_rng().gen_range(0..(1u64 << 22));
    (ms << 22) | random
}

/// Build an `/ls_req` envelope carrying one task
pub fn ls_request(request_id: u64, task_id: u64, task: &LsTask) -> Result<Vec<u8>, WireError> {
    let task_value = json!({
        "label": task.label,
        "payload": serde_json::to_string(&task.payload)?,
        "queue_name": task.queue_name,
        "task_id": task_id,
        "failure_count": null,
    });
    let batch = json!({
        "tasks": [task_value],
        "epoch_id": offline_threading_id(),
        "version_id": LS_VERSION_ID,
    });
    let envelope = json!({
        "app_id": LS_APP_ID,
        "payload": serde_json::to_string(&batch)?,
        "request_id": request_id,
        "type": LS_REQUEST_TYPE,
    });
    Ok(serde_json::to_vec(&envelope)?)
}
