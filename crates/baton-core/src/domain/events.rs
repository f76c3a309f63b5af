//! Events that drive the task FSM.

use serde::{Deserialize, Serialize};

/// An input to the task state machine.
///
/// Serialized internally tagged: `{"event": "step_passed", "evidence": [..]}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TaskEvent {
    ValidatePassed,
    TaskReceived,
    StepPassed {
        #[serde(default)]
        evidence: Vec<String>,
        /// Per-step override of the spec's approval policy.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        approval_required: Option<bool>,
    },
    StepFailed {
        reason: String,
    },
    Timeout,
    RateLimited {
        reason: String,
    },
    ApprovalGranted,
    ApprovalDenied {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    DependencyReady,
    StepRetry,
    ResetRequested,
}

impl TaskEvent {
    pub fn step_passed(evidence: Vec<String>) -> Self {
        TaskEvent::StepPassed {
            evidence,
            approval_required: None,
        }
    }

    pub fn step_failed(reason: impl Into<String>) -> Self {
        TaskEvent::StepFailed {
            reason: reason.into(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            TaskEvent::ValidatePassed => "validate_passed",
            TaskEvent::TaskReceived => "task_received",
            TaskEvent::StepPassed { .. } => "step_passed",
            TaskEvent::StepFailed { .. } => "step_failed",
            TaskEvent::Timeout => "timeout",
            TaskEvent::RateLimited { .. } => "rate_limited",
            TaskEvent::ApprovalGranted => "approval_granted",
            TaskEvent::ApprovalDenied { .. } => "approval_denied",
            TaskEvent::DependencyReady => "dependency_ready",
            TaskEvent::StepRetry => "step_retry",
            TaskEvent::ResetRequested => "reset_requested",
        }
    }
}

impl std::fmt::Display for TaskEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
