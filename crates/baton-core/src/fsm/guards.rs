//! Guard predicates. Pure functions over the task and the event payload.

use std::fmt;

use crate::domain::Task;

/// A guard that can veto a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Guard {
    HasValidTask,
    EvidenceAttached,
    RetriesRemaining,
}

impl fmt::Display for Guard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Guard::HasValidTask => "has_valid_task",
            Guard::EvidenceAttached => "evidence_attached",
            Guard::RetriesRemaining => "retries_remaining",
        })
    }
}

/// Spec present, titled, with at least one acceptance criterion.
pub fn has_valid_task(task: &Task) -> bool {
    task.spec
        .as_ref()
        .is_some_and(|spec| !spec.title.trim().is_empty() && !spec.acceptance_criteria.is_empty())
}

/// The step override wins over the spec flag.
pub fn approval_required(task: &Task, step_override: Option<bool>) -> bool {
    step_override.unwrap_or_else(|| task.spec.as_ref().is_some_and(|s| s.approval_required))
}

pub fn retries_remaining(task: &Task) -> bool {
    task.retries_remaining > 0
}

/// At least one evidence ref once `incoming` is merged in.
pub fn evidence_attached(task: &Task, incoming: &[String]) -> bool {
    !task.evidence_refs.is_empty() || incoming.iter().any(|r| !r.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{TaskId, TaskSpec};
    use chrono::Utc;
    use rstest::rstest;

    fn task(spec: Option<TaskSpec>) -> Task {
        Task::new(TaskId::parse("t").unwrap(), spec, 3, Utc::now())
    }

    #[rstest]
    #[case::missing(None, false)]
    #[case::no_criteria(Some(TaskSpec::new("Build")), false)]
    #[case::blank_title(Some(TaskSpec::new("  ").with_criterion("green")), false)]
    #[case::valid(Some(TaskSpec::new("Build").with_criterion("green")), true)]
    fn valid_task(#[case] spec: Option<TaskSpec>, #[case] expected: bool) {
        assert_eq!(has_valid_task(&task(spec)), expected);
    }

    #[rstest]
    #[case(false, None, false)]
    #[case(true, None, true)]
    #[case(true, Some(false), false)]
    #[case(false, Some(true), true)]
    fn approval_override_wins(
        #[case] policy: bool,
        #[case] step: Option<bool>,
        #[case] expected: bool,
    ) {
        let mut spec = TaskSpec::new("Build").with_criterion("green");
        spec.approval_required = policy;
        assert_eq!(approval_required(&task(Some(spec)), step), expected);
    }

    #[test]
    fn evidence_counts_incoming_refs() {
        let mut t = task(None);
        assert!(!evidence_attached(&t, &[]));
        assert!(!evidence_attached(&t, &["".to_string()]));
        assert!(evidence_attached(&t, &["shot-1".to_string()]));
        t.attach_evidence(["shot-1"]);
        assert!(evidence_attached(&t, &[]));
    }

    #[test]
    fn retries_run_out() {
        let mut t = task(None);
        assert!(retries_remaining(&t));
        t.retries_remaining = 0;
        assert!(!retries_remaining(&t));
    }
}
