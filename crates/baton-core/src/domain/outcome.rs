//! Command outcome: what a handler reports back to the dispatcher.

use serde::{Deserialize, Serialize};

use super::envelope::Payload;
use super::events::TaskEvent;

/// Result object returned by every command handler.
///
/// `ok = false` is an explicit failure and is retried like a raised error.
/// `evidence` feeds the task's `evidence_refs`; `task_event` replaces the
/// default `step_passed` (task-control commands use it).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResult {
    pub ok: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Payload>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub evidence: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_event: Option<TaskEvent>,
}

impl CommandResult {
    pub fn ok() -> Self {
        Self {
            ok: true,
            data: None,
            error: None,
            evidence: Vec::new(),
            task_event: None,
        }
    }

    pub fn failure(reason: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(reason.into()),
            evidence: Vec::new(),
            task_event: None,
        }
    }

    pub fn with_data(mut self, data: Payload) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_evidence(mut self, evidence: impl Into<String>) -> Self {
        self.evidence.push(evidence.into());
        self
    }

    pub fn with_task_event(mut self, event: TaskEvent) -> Self {
        self.task_event = Some(event);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_wire_shape() {
        let v = serde_json::to_value(CommandResult::ok()).unwrap();
        assert_eq!(v, serde_json::json!({"ok": true}));

        let v = serde_json::to_value(CommandResult::failure("busy")).unwrap();
        assert_eq!(v, serde_json::json!({"ok": false, "error": "busy"}));
    }
}
