//! Envelope: one unit of work travelling from a sender to a recipient.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{EnvelopeId, TaskId};

/// Handler payload: the structured view of an envelope body.
pub type Payload = serde_json::Map<String, serde_json::Value>;

/// Retry bound applied when a producer does not pick one.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Dispatch priority. Lower rank is claimed first; FIFO holds inside a band.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Critical,
    High,
    #[default]
    Normal,
    Low,
}

impl Priority {
    pub fn rank(self) -> u8 {
        match self {
            Priority::Critical => 0,
            Priority::High => 1,
            Priority::Normal => 2,
            Priority::Low => 3,
        }
    }
}

/// Denormalized copy of the bucket an envelope lives in.
///
/// The bucket directory is authoritative; this field is rewritten on every
/// move so a record read in isolation still tells its story.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvelopeStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    /// Completed and confirmed by the recipient. Lives in `completed`.
    Acknowledged,
}

/// One unit of work. Persisted as pretty JSON under the store bucket it is
/// in, named after its id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: EnvelopeId,
    pub from: String,
    pub to: String,

    /// Free-form payload: a JSON document or plain text.
    #[serde(default)]
    pub body: serde_json::Value,

    /// Semantic category ("coordinate", "task", "sync", "verify", ...).
    pub tag: String,

    /// Explicit command name; routing falls back to `tag` when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,

    /// Task this envelope advances, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,

    #[serde(default)]
    pub priority: Priority,

    pub status: EnvelopeStatus,

    #[serde(default)]
    pub retries: u32,

    pub max_retries: u32,

    pub created_at: DateTime<Utc>,

    #[serde(default)]
    pub processed_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub error: Option<String>,
}

impl Envelope {
    /// A fresh pending envelope with `normal` priority and the default retry
    /// bound.
    pub fn new(
        id: EnvelopeId,
        from: impl Into<String>,
        to: impl Into<String>,
        tag: impl Into<String>,
        body: serde_json::Value,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            from: from.into(),
            to: to.into(),
            body,
            tag: tag.into(),
            command: None,
            task_id: None,
            priority: Priority::Normal,
            status: EnvelopeStatus::Pending,
            retries: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            created_at,
            processed_at: None,
            completed_at: None,
            error: None,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = Some(command.into());
        self
    }

    pub fn with_task(mut self, task_id: TaskId) -> Self {
        self.task_id = Some(task_id);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Name the router resolves: `command` if set, else `tag`.
    pub fn command_name(&self) -> &str {
        self.command.as_deref().unwrap_or(&self.tag)
    }

    /// Structured view of the body handed to handlers.
    ///
    /// Objects pass through; text becomes `{"text": ..}`; null becomes `{}`;
    /// any other value becomes `{"value": ..}`.
    pub fn payload(&self) -> Payload {
        match &self.body {
            serde_json::Value::Object(map) => map.clone(),
            serde_json::Value::Null => Payload::new(),
            serde_json::Value::String(text) => {
                let mut map = Payload::new();
                map.insert("text".to_string(), serde_json::Value::String(text.clone()));
                map
            }
            other => {
                let mut map = Payload::new();
                map.insert("value".to_string(), other.clone());
                map
            }
        }
    }

    /// Claim order key: `(priority_rank, created_at, id)`.
    pub fn dispatch_key(&self) -> (u8, DateTime<Utc>, &str) {
        (self.priority.rank(), self.created_at, self.id.as_str())
    }

    /// Step-level approval override carried in the body, if any.
    pub fn approval_override(&self) -> Option<bool> {
        self.body.get("approval_required").and_then(|v| v.as_bool())
    }

    /// Status bookkeeping mirrored into the record on each bucket move.
    pub fn start_processing(&mut self, now: DateTime<Utc>) {
        self.status = EnvelopeStatus::Processing;
        self.processed_at = Some(now);
    }

    pub fn mark_completed(&mut self, now: DateTime<Utc>) {
        self.status = EnvelopeStatus::Completed;
        self.completed_at = Some(now);
    }

    pub fn mark_acknowledged(&mut self) {
        self.status = EnvelopeStatus::Acknowledged;
    }

    /// Count one failed attempt and remember why.
    pub fn record_failure(&mut self, error: impl Into<String>) {
        self.retries += 1;
        self.error = Some(error.into());
    }

    /// Back to `pending` at the tail of its band: `created_at` moves to now.
    pub fn requeue(&mut self, now: DateTime<Utc>) {
        self.status = EnvelopeStatus::Pending;
        self.created_at = now;
    }

    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.status = EnvelopeStatus::Failed;
        self.error = Some(error.into());
    }
}
