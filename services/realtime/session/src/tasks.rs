//! Request/response correlation over `/ls_req` and `/ls_resp`.
//!
//! A request publishes one task under a fresh request id and parks a oneshot
//! sender here. The reply arrives on `/ls_resp` carrying the same request id
//! and a JSON-in-a-string payload whose `step` array is a positional tree.
//! Each task type has its own extraction rule; a shape mismatch resolves the
//! request with [`TaskError::Schema`] instead of failing the engine.

use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Label of the send message task
pub const LABEL_SEND_MESSAGE: &str = "46";
/// Label of the set reaction task
pub const LABEL_SET_REACTION: &str = "29";
/// Label of the edit message task
pub const LABEL_EDIT_MESSAGE: &str = "742";

/// Kind of request, selects the reply schema
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TaskType {
    /// Send a message into a thread
    SendMessage,
    /// Set or clear a reaction
    SetReaction,
    /// Edit a sent message
    EditMessage,
    /// Any other task; the reply is returned unparsed
    Generic(String),
}

impl TaskType {
    /// Wire label
    pub fn label(&self) -> &str {
        match self {
            TaskType::SendMessage => LABEL_SEND_MESSAGE,
            TaskType::SetReaction => LABEL_SET_REACTION,
            TaskType::EditMessage => LABEL_EDIT_MESSAGE,
            TaskType::Generic(label) => label,
        }
    }

    fn extract(&self, step: &Value) -> Result<TaskResponse, TaskError> {
        match self {
            TaskType::SendMessage => send_message_v1(step),
            TaskType::SetReaction => set_reaction_v1(step),
            TaskType::EditMessage => edit_message_v1(step),
            TaskType::Generic(_) => Ok(TaskResponse::Raw(step.clone())),
        }
    }
}

/// Extracted reply
#[derive(Debug, Clone, PartialEq)]
pub enum TaskResponse {
    /// Message accepted
    Sent {
        /// Thread the message landed in
        thread_id: String,
        /// Server message id
        message_id: String,
    },
    /// Reaction applied
    Reaction {
        /// Reacted message id
        message_id: String,
    },
    /// Edit applied
    Edited {
        /// Edited message id
        message_id: String,
    },
    /// Unparsed `step` tree of a generic task
    Raw(Value),
}

/// Errors a pending request can resolve with
#[derive(Debug, Error)]
pub enum TaskError {
    /// Reply did not match the schema of the task type
    #[error("reply schema mismatch for task {label}: missing {path}")]
    Schema {
        /// Task label
        label: String,
        /// Path that could not be read
        path: &'static str,
    },

    /// Reply envelope was not readable
    #[error("invalid reply payload: {0}")]
    Payload(String),

    /// Dropped on disconnect or stop
    #[error("request dropped: {0}")]
    Dropped(&'static str),

    /// No reply within the request timeout
    #[error("request timed out")]
    Timeout,

    /// The engine is gone
    #[error("engine closed")]
    Closed,

    /// The request could not be published
    #[error("publish failed: {0}")]
    Publish(String),
}

/// Read a scalar id; the endpoint encodes large ints as strings, numbers or
/// `[19, "id"]` pairs
fn scalar(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Array(pair) if pair.len() == 2 && pair[0].as_i64() == Some(19) => scalar(&pair[1]),
        _ => None,
    }
}

fn at<'a>(value: &'a Value, path: &[usize]) -> Option<&'a Value> {
    path.iter().try_fold(value, |v, i| v.get(*i))
}

fn field(step: &Value, path: &[usize], label: &str, name: &'static str) -> Result<String, TaskError> {
    at(step, path).and_then(scalar).ok_or_else(|| TaskError::Schema {
        label: label.to_string(),
        path: name,
    })
}

/// Send message reply: thread at `step[1][2][2][1][2]`, message id at
/// `step[1][2][2][1][3]`
pub fn send_message_v1(step: &Value) -> Result<TaskResponse, TaskError> {
    Ok(TaskResponse::Sent {
        thread_id: field(step, &[1, 2, 2, 1, 2], LABEL_SEND_MESSAGE, "step[1][2][2][1][2]")?,
        message_id: field(step, &[1, 2, 2, 1, 3], LABEL_SEND_MESSAGE, "step[1][2][2][1][3]")?,
    })
}

/// Set reaction reply: message id at `step[1][2][2][1][4]`
pub fn set_reaction_v1(step: &Value) -> Result<TaskResponse, TaskError> {
    Ok(TaskResponse::Reaction {
        message_id: field(step, &[1, 2, 2, 1, 4], LABEL_SET_REACTION, "step[1][2][2][1][4]")?,
    })
}

/// Edit message reply: message id at `step[1][2][2][1][2]`
pub fn edit_message_v1(step: &Value) -> Result<TaskResponse, TaskError> {
    Ok(TaskResponse::Edited {
        message_id: field(step, &[1, 2, 2, 1, 2], LABEL_EDIT_MESSAGE, "step[1][2][2][1][2]")?,
    })
}

/// Request id and unwrapped `step` tree of an `/ls_resp` payload
pub fn parse_reply(raw: &[u8]) -> Result<(u64, Value), TaskError> {
    let envelope: Value =
        serde_json::from_slice(raw).map_err(|e| TaskError::Payload(e.to_string()))?;
    let request_id = envelope
        .get("request_id")
        .and_then(|v| v.as_u64().or_else(|| v.as_str().and_then(|s| s.parse().ok())))
        .ok_or_else(|| TaskError::Payload("missing request_id".to_string()))?;
    let inner = match envelope.get("payload") {
        Some(Value::String(s)) => {
            serde_json::from_str(s).map_err(|e| TaskError::Payload(e.to_string()))?
        }
        Some(other) => other.clone(),
        None => Value::Null,
    };
    let step = inner.get("step").cloned().unwrap_or(Value::Null);
    Ok((request_id, step))
}

/// Result delivered to a request's waiter
pub type TaskResult = Result<TaskResponse, TaskError>;

#[derive(Debug)]
struct PendingTask {
    task_type: TaskType,
    reply: oneshot::Sender<TaskResult>,
    created: Instant,
}

/// Pending requests keyed by request id
#[derive(Debug, Default)]
pub struct TaskRegistry {
    pending: HashMap<u64, PendingTask>,
    next_request_id: u64,
    next_task_id: u64,
}

impl TaskRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a request id and a task id
    pub fn next_ids(&mut self) -> (u64, u64) {
        self.next_request_id += 1;
        self.next_task_id += 1;
        (self.next_request_id, self.next_task_id)
    }

    /// Park a request's reply channel
    pub fn register(&mut self, request_id: u64, task_type: TaskType, reply: oneshot::Sender<TaskResult>) {
        self.pending.insert(
            request_id,
            PendingTask {
                task_type,
                reply,
                created: Instant::now(),
            },
        );
    }

    /// Route an `/ls_resp` payload.
    ///
    /// Returns `true` when a pending request was resolved. Replies for
    /// unknown request ids are ignored without error.
    pub fn resolve(&mut self, raw: &[u8]) -> bool {
        let (request_id, step) = match parse_reply(raw) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!("Unreadable task reply: {}", e);
                return false;
            }
        };
        let Some(task) = self.pending.remove(&request_id) else {
            debug!("Reply for unknown request {}", request_id);
            return false;
        };
        let result = task.task_type.extract(&step);
        if let Err(ref e) = result {
            warn!("Request {} failed: {}", request_id, e);
        }
        // The waiter may have given up already
        let _ = task.reply.send(result);
        true
    }

    /// Fail every pending request
    pub fn drop_all(&mut self, reason: &'static str) -> usize {
        let count = self.pending.len();
        for (_, task) in self.pending.drain() {
            let _ = task.reply.send(Err(TaskError::Dropped(reason)));
        }
        if count > 0 {
            debug!("Dropped {} pending requests: {}", count, reason);
        }
        count
    }

    /// Fail requests older than `timeout`
    pub fn purge_expired(&mut self, timeout: Duration) -> usize {
        let expired: Vec<u64> = self
            .pending
            .iter()
            .filter(|(_, task)| task.created.elapsed() >= timeout)
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            if let Some(task) = self.pending.remove(id) {
                let _ = task.reply.send(Err(TaskError::Timeout));
            }
        }
        expired.len()
    }

    /// Number of pending requests
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether nothing is pending
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
