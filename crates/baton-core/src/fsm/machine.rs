//! Transition table.
//!
//! `next` decides where an event leads without touching the task; `commit`
//! applies the decision. Keeping the two apart lets the engine log a vetoed
//! event without having mutated anything.

use std::fmt;

use chrono::{DateTime, Utc};

use super::guards::{self, Guard};
use crate::domain::{Task, TaskEvent, TaskState, TransitionRecord};

/// Work a transition asks the caller to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    /// Entering EXECUTING: run the step's handler.
    InvokeHandler,
    /// Entering COMPLETE or AWAITING_APPROVAL: keep the evidence refs.
    PersistEvidence,
    /// Entering AWAITING_APPROVAL, COMPLETE or ERROR: tell the observer.
    NotifyObserver,
}

/// Why an event did not move the task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    Guard(Guard),
    /// No row for (state, event).
    Undefined,
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::Guard(guard) => write!(f, "guard {guard} failed"),
            Rejection::Undefined => f.write_str("no transition defined"),
        }
    }
}

/// Target state for `event`, or why the event does nothing. Pure.
pub fn next(task: &Task, event: &TaskEvent) -> Result<TaskState, Rejection> {
    use TaskState::*;

    let check = |ok: bool, guard: Guard| if ok { Ok(()) } else { Err(Rejection::Guard(guard)) };

    match (task.state, event) {
        (_, TaskEvent::ResetRequested) => Ok(Ready),
        (Idle, TaskEvent::ValidatePassed) => Ok(Ready),
        (Ready, TaskEvent::TaskReceived) => {
            check(guards::has_valid_task(task), Guard::HasValidTask)?;
            Ok(Executing)
        }
        (
            Executing,
            TaskEvent::StepPassed {
                evidence,
                approval_required,
            },
        ) => {
            check(
                guards::evidence_attached(task, evidence),
                Guard::EvidenceAttached,
            )?;
            if guards::approval_required(task, *approval_required) {
                Ok(AwaitingApproval)
            } else {
                Ok(Complete)
            }
        }
        (Executing, TaskEvent::StepFailed { .. }) => {
            check(guards::retries_remaining(task), Guard::RetriesRemaining)?;
            Ok(Error)
        }
        (Executing, TaskEvent::Timeout | TaskEvent::RateLimited { .. }) => Ok(Blocked),
        (AwaitingApproval, TaskEvent::ApprovalGranted) => {
            check(guards::evidence_attached(task, &[]), Guard::EvidenceAttached)?;
            Ok(Complete)
        }
        (AwaitingApproval, TaskEvent::ApprovalDenied { .. }) => Ok(Executing),
        (Blocked, TaskEvent::DependencyReady) => Ok(Executing),
        (Error, TaskEvent::StepRetry) => {
            check(guards::retries_remaining(task), Guard::RetriesRemaining)?;
            Ok(Executing)
        }
        _ => Err(Rejection::Undefined),
    }
}

/// Apply a transition `next` accepted and return its effects.
pub fn commit(task: &mut Task, event: &TaskEvent, to: TaskState, now: DateTime<Utc>) -> Vec<Effect> {
    let from = task.state;
    match event {
        TaskEvent::StepPassed { evidence, .. } => {
            task.attach_evidence(evidence.iter().filter(|r| !r.trim().is_empty()).cloned());
        }
        TaskEvent::StepFailed { .. } => {
            task.retries_remaining = task.retries_remaining.saturating_sub(1);
        }
        TaskEvent::Timeout => task.blockers.push("timeout".to_string()),
        TaskEvent::RateLimited { reason } => task.blockers.push(format!("rate_limited: {reason}")),
        TaskEvent::DependencyReady => task.blockers.clear(),
        TaskEvent::ResetRequested => {
            task.retries_remaining = task.retry_budget;
            task.blockers.clear();
            task.evidence_refs.clear();
        }
        _ => {}
    }

    task.state = to;
    task.updated_at = now;
    task.history.push(TransitionRecord {
        from,
        to,
        event: event.name().to_string(),
        at: now,
    });

    effects_on_entering(to)
}

/// Side effects attached to entering `state`.
pub fn effects_on_entering(state: TaskState) -> Vec<Effect> {
    match state {
        TaskState::Executing => vec![Effect::InvokeHandler],
        TaskState::Complete | TaskState::AwaitingApproval => {
            vec![Effect::PersistEvidence, Effect::NotifyObserver]
        }
        TaskState::Error => vec![Effect::NotifyObserver],
        TaskState::Idle | TaskState::Ready | TaskState::Blocked => Vec::new(),
    }
}
