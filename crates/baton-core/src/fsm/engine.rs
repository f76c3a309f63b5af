//! TaskEngine: loads a task, runs the transition table, persists the result.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info, warn};

use super::machine::{self, Effect, Rejection};
use crate::domain::{Task, TaskEvent, TaskId, TaskSpec, TaskState};
use crate::error::FsmError;
use crate::ports::{Clock, TaskStore};

/// Result of [`TaskEngine::apply`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionOutcome {
    Applied {
        from: TaskState,
        to: TaskState,
        effects: Vec<Effect>,
    },
    /// The event was vetoed or undefined; the task is unchanged.
    Ignored { state: TaskState, reason: Rejection },
}

impl TransitionOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, TransitionOutcome::Applied { .. })
    }

    /// State the task is in afterwards.
    pub fn state(&self) -> TaskState {
        match self {
            TransitionOutcome::Applied { to, .. } => *to,
            TransitionOutcome::Ignored { state, .. } => *state,
        }
    }
}

/// Receives tasks that entered a state with [`Effect::NotifyObserver`].
pub trait TransitionObserver: Send + Sync {
    fn on_transition(&self, task: &Task, from: TaskState);
}

/// Runs the transition table against persisted tasks and notifies the
/// observer on notable transitions.
pub struct TaskEngine {
    store: Arc<dyn TaskStore>,
    observer: Option<Arc<dyn TransitionObserver>>,
    clock: Arc<dyn Clock>,
    retry_budget: u32,
}

impl TaskEngine {
    /// `retry_budget` applies to tasks created without an explicit budget.
    pub fn new(store: Arc<dyn TaskStore>, clock: Arc<dyn Clock>, retry_budget: u32) -> Self {
        Self {
            store,
            observer: None,
            clock,
            retry_budget,
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn TransitionObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn get(&self, task_id: &TaskId) -> Result<Option<Task>, FsmError> {
        Ok(self.store.load(task_id)?)
    }

    pub fn list(&self) -> Result<Vec<Task>, FsmError> {
        Ok(self.store.list()?)
    }

    /// Register a task. A new task starts in IDLE and is validated straight
    /// into READY when a spec is supplied. An existing task is returned as
    /// is, except that a missing spec is filled in.
    pub fn receive(
        &self,
        task_id: &TaskId,
        spec: Option<TaskSpec>,
        retry_budget: Option<u32>,
    ) -> Result<Task, FsmError> {
        let task = match self.store.load(task_id)? {
            Some(mut existing) => {
                if existing.spec.is_none() && spec.is_some() {
                    existing.spec = spec;
                    existing.updated_at = self.clock.now();
                    self.store.save(&existing)?;
                }
                existing
            }
            None => {
                let budget = retry_budget.unwrap_or(self.retry_budget);
                let task = Task::new(task_id.clone(), spec, budget, self.clock.now());
                self.store.save(&task)?;
                info!(task_id = %task_id, retry_budget = budget, "task created");
                task
            }
        };

        if task.state == TaskState::Idle && task.spec.is_some() {
            self.apply(task_id, &TaskEvent::ValidatePassed)?;
            return self.get(task_id)?.ok_or_else(|| FsmError::UnknownTask(task_id.clone()));
        }
        Ok(task)
    }

    /// Feed one event. Vetoed and undefined events are logged no-ops.
    pub fn apply(&self, task_id: &TaskId, event: &TaskEvent) -> Result<TransitionOutcome, FsmError> {
        let mut task = self
            .store
            .load(task_id)?
            .ok_or_else(|| FsmError::UnknownTask(task_id.clone()))?;
        let from = task.state;

        let to = match machine::next(&task, event) {
            Ok(to) => to,
            Err(reason) => {
                match reason {
                    Rejection::Guard(_) => {
                        warn!(task_id = %task_id, state = %from, event = %event, %reason, "transition vetoed")
                    }
                    Rejection::Undefined => {
                        info!(task_id = %task_id, state = %from, event = %event, %reason, "event ignored")
                    }
                }
                return Ok(TransitionOutcome::Ignored {
                    state: from,
                    reason,
                });
            }
        };

        let effects = machine::commit(&mut task, event, to, self.clock.now());
        self.store.save(&task)?;
        info!(task_id = %task_id, from = %from, to = %to, event = %event, "task transition");

        if effects.contains(&Effect::NotifyObserver)
            && let Some(observer) = &self.observer
        {
            observer.on_transition(&task, from);
        }
        Ok(TransitionOutcome::Applied { from, to, effects })
    }

    /// Bring a task into EXECUTING ahead of a step.
    ///
    /// Unknown tasks are created from `task_doc` (the envelope's `body.task`).
    /// READY starts the task, ERROR retries it, BLOCKED resumes it. Returns
    /// whether the task is EXECUTING afterwards.
    pub fn begin_step(
        &self,
        task_id: &TaskId,
        task_doc: Option<&Value>,
        retry_budget: Option<u32>,
    ) -> Result<bool, FsmError> {
        let spec = task_doc.and_then(|doc| match serde_json::from_value::<TaskSpec>(doc.clone()) {
            Ok(spec) => Some(spec),
            Err(e) => {
                warn!(task_id = %task_id, error = %e, "ignoring malformed task document");
                None
            }
        });
        let task = self.receive(task_id, spec, retry_budget)?;

        let event = match task.state {
            TaskState::Executing => return Ok(true),
            TaskState::Ready => TaskEvent::TaskReceived,
            TaskState::Error => TaskEvent::StepRetry,
            TaskState::Blocked => TaskEvent::DependencyReady,
            state => {
                debug!(task_id = %task_id, state = %state, "task cannot take a step");
                return Ok(false);
            }
        };
        Ok(self.apply(task_id, &event)?.state() == TaskState::Executing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::impls::InMemoryTaskStore;
    use crate::ports::SystemClock;
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Seen(Mutex<Vec<(TaskState, TaskState)>>);

    impl TransitionObserver for Seen {
        fn on_transition(&self, task: &Task, from: TaskState) {
            self.0.lock().unwrap().push((from, task.state));
        }
    }

    fn engine() -> (TaskEngine, Arc<Seen>) {
        let seen = Arc::new(Seen::default());
        let engine = TaskEngine::new(Arc::new(InMemoryTaskStore::new()), Arc::new(SystemClock), 3)
            .with_observer(seen.clone());
        (engine, seen)
    }

    fn id(s: &str) -> TaskId {
        TaskId::parse(s).unwrap()
    }

    fn doc() -> Value {
        json!({"title": "Open settings", "acceptance_criteria": ["panel visible"]})
    }

    #[test]
    fn receive_with_spec_lands_in_ready() {
        let (engine, _) = engine();
        let task = engine
            .receive(&id("t"), Some(TaskSpec::new("x").with_criterion("y")), None)
            .unwrap();
        assert_eq!(task.state, TaskState::Ready);
        assert_eq!(task.retry_budget, 3);

        let bare = engine.receive(&id("u"), None, Some(5)).unwrap();
        assert_eq!(bare.state, TaskState::Idle);
        assert_eq!(bare.retries_remaining, 5);
    }

    #[test]
    fn apply_to_unknown_task_errors() {
        let (engine, _) = engine();
        assert!(matches!(
            engine.apply(&id("ghost"), &TaskEvent::Timeout),
            Err(FsmError::UnknownTask(_))
        ));
    }

    #[test]
    fn vetoed_event_leaves_task_untouched() {
        let (engine, seen) = engine();
        assert!(engine.begin_step(&id("t"), Some(&doc()), None).unwrap());

        let outcome = engine.apply(&id("t"), &TaskEvent::step_passed(vec![])).unwrap();
        assert_eq!(outcome.state(), TaskState::Executing);
        assert!(!outcome.is_applied());
        assert_eq!(engine.get(&id("t")).unwrap().unwrap().history.len(), 2);
        assert!(seen.0.lock().unwrap().is_empty());
    }

    #[test]
    fn observer_hears_completion() {
        let (engine, seen) = engine();
        engine.begin_step(&id("t"), Some(&doc()), None).unwrap();
        engine
            .apply(&id("t"), &TaskEvent::step_passed(vec!["shot".into()]))
            .unwrap();
        assert_eq!(
            *seen.0.lock().unwrap(),
            vec![(TaskState::Executing, TaskState::Complete)]
        );
    }

    #[test]
    fn begin_step_retries_from_error_and_resumes_from_blocked() {
        let (engine, _) = engine();
        let t = id("t");
        assert!(engine.begin_step(&t, Some(&doc()), None).unwrap());
        engine.apply(&t, &TaskEvent::step_failed("boom")).unwrap();
        assert!(engine.begin_step(&t, None, None).unwrap());
        engine.apply(&t, &TaskEvent::Timeout).unwrap();
        assert!(engine.begin_step(&t, None, None).unwrap());
        let task = engine.get(&t).unwrap().unwrap();
        assert_eq!(task.retries_remaining, 2);
        assert!(task.blockers.is_empty());
    }

    #[test]
    fn begin_step_refuses_without_a_valid_spec() {
        let (engine, _) = engine();
        assert!(!engine.begin_step(&id("bare"), None, None).unwrap());
        let junk = json!({"title": 7});
        assert!(!engine.begin_step(&id("junk"), Some(&junk), None).unwrap());
        let thin = json!({"title": "no criteria"});
        assert!(!engine.begin_step(&id("thin"), Some(&thin), None).unwrap());
        assert_eq!(engine.get(&id("thin")).unwrap().unwrap().state, TaskState::Ready);
    }

    #[test]
    fn complete_task_takes_no_more_steps() {
        let (engine, _) = engine();
        let t = id("t");
        engine.begin_step(&t, Some(&doc()), None).unwrap();
        engine
            .apply(&t, &TaskEvent::step_passed(vec!["shot".into()]))
            .unwrap();
        assert!(!engine.begin_step(&t, None, None).unwrap());
    }
}
