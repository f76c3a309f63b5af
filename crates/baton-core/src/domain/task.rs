//! Task: the logical unit of work the FSM tracks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::TaskId;

/// Task lifecycle state.
///
/// Serialized as SCREAMING_SNAKE_CASE (`AWAITING_APPROVAL`, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Idle,
    Ready,
    Executing,
    AwaitingApproval,
    Blocked,
    Error,
    Complete,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Complete)
    }

    /// States whose entry is announced to the observer recipient.
    pub fn notifies_observer(self) -> bool {
        matches!(
            self,
            TaskState::AwaitingApproval | TaskState::Complete | TaskState::Error
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Idle => "IDLE",
            TaskState::Ready => "READY",
            TaskState::Executing => "EXECUTING",
            TaskState::AwaitingApproval => "AWAITING_APPROVAL",
            TaskState::Blocked => "BLOCKED",
            TaskState::Error => "ERROR",
            TaskState::Complete => "COMPLETE",
        }
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the task is supposed to achieve. Carried in `body.task` of the first
/// envelope that mentions the task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub title: String,

    #[serde(default)]
    pub acceptance_criteria: Vec<String>,

    /// Policy flag: steps need a human approval before COMPLETE.
    #[serde(default)]
    pub approval_required: bool,
}

impl TaskSpec {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            acceptance_criteria: Vec::new(),
            approval_required: false,
        }
    }

    pub fn with_criterion(mut self, criterion: impl Into<String>) -> Self {
        self.acceptance_criteria.push(criterion.into());
        self
    }

    pub fn requiring_approval(mut self) -> Self {
        self.approval_required = true;
        self
    }
}

/// One applied transition, kept for "why is this task here" questions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub from: TaskState,
    pub to: TaskState,
    pub event: String,
    pub at: DateTime<Utc>,
}

/// FSM subject, persisted through [`TaskStore`](crate::ports::TaskStore).
/// Mutated only by [`TaskEngine`](crate::fsm::TaskEngine).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub task_id: TaskId,
    pub state: TaskState,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec: Option<TaskSpec>,

    pub retries_remaining: u32,

    /// Value `retries_remaining` is restored to on reset.
    pub retry_budget: u32,

    /// Pointers to artifacts proving a step completed.
    #[serde(default)]
    pub evidence_refs: Vec<String>,

    /// Unmet prerequisites while BLOCKED.
    #[serde(default)]
    pub blockers: Vec<String>,

    #[serde(default)]
    pub history: Vec<TransitionRecord>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(
        task_id: TaskId,
        spec: Option<TaskSpec>,
        retry_budget: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            task_id,
            state: TaskState::Idle,
            spec,
            retries_remaining: retry_budget,
            retry_budget,
            evidence_refs: Vec::new(),
            blockers: Vec::new(),
            history: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Record evidence refs, skipping ones already present.
    pub fn attach_evidence<I, S>(&mut self, refs: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for r in refs {
            let r = r.into();
            if !self.evidence_refs.contains(&r) {
                self.evidence_refs.push(r);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_names_match_wire_format() {
        for state in [
            TaskState::Idle,
            TaskState::AwaitingApproval,
            TaskState::Complete,
        ] {
            let wire = serde_json::to_string(&state).unwrap();
            assert_eq!(wire, format!("\"{}\"", state.as_str()));
        }
    }

    #[test]
    fn evidence_is_deduplicated() {
        let mut task = Task::new(TaskId::parse("t").unwrap(), None, 3, Utc::now());
        task.attach_evidence(["shot-1", "shot-2"]);
        task.attach_evidence(["shot-1"]);
        assert_eq!(task.evidence_refs, vec!["shot-1", "shot-2"]);
    }
}
