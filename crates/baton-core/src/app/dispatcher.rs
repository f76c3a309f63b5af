//! Queue Dispatcher: lock, claim, route, record. One envelope per tick.
//!
//! The handler runs on its own tokio task so a timeout can abort it and a
//! panic surfaces as a `JoinError` instead of taking the loop down. The Lock
//! Token is held for the whole tick and released when the guard drops.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::DispatcherConfig;
use crate::domain::{CommandResult, Envelope, EnvelopeId, HolderId, TaskEvent, TaskId};
use crate::error::{DispatchError, ErrorKind, HandlerError, StoreError};
use crate::fsm::TaskEngine;
use crate::ports::Actuator;
use crate::queue::{Acquire, DurableStore, FailOutcome, LockGuard, Reclaim};
use crate::router::{CommandContext, CommandRouter};

/// What one tick did.
#[derive(Debug, Clone, PartialEq)]
pub enum Tick {
    /// The Lock Token is held by someone else.
    Busy,
    /// Nothing pending.
    Idle,
    Dispatched(DispatchReport),
}

/// Where a dispatched envelope ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Completed,
    Requeued,
    Failed,
    Rejected,
}

/// Summary of one dispatched envelope, returned by [`Dispatcher::run_once`].
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchReport {
    pub id: EnvelopeId,
    pub command: String,
    pub disposition: Disposition,
    pub error: Option<String>,
    pub elapsed: Duration,
}

/// How a handler invocation ended.
enum Attempt {
    Finished(CommandResult),
    Errored(HandlerError),
    Panicked(String),
    TimedOut,
}

/// The single consumer side of the store. Several dispatchers may share a
/// store; the Lock Token lets only one of them work at a time.
pub struct Dispatcher {
    store: Arc<DurableStore>,
    router: Arc<CommandRouter>,
    engine: Arc<TaskEngine>,
    actuator: Arc<dyn Actuator>,
    holder: HolderId,
    config: DispatcherConfig,
}

impl Dispatcher {
    pub fn new(
        store: Arc<DurableStore>,
        router: Arc<CommandRouter>,
        engine: Arc<TaskEngine>,
        actuator: Arc<dyn Actuator>,
        holder: HolderId,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            store,
            router,
            engine,
            actuator,
            holder,
            config,
        }
    }

    pub fn holder(&self) -> &HolderId {
        &self.holder
    }

    /// One tick under the Lock Token.
    ///
    /// If the tick fails after a claim, whatever sits in `processing` is put
    /// back through `fail` before the token is released. When even that
    /// fails the token is abandoned, so stale-lock reclamation recovers the
    /// envelope later.
    pub async fn run_once(&self) -> Result<Tick, DispatchError> {
        let Some(guard) = self.acquire()? else {
            return Ok(Tick::Busy);
        };
        let result = self.tick(&guard).await;
        if let Err(e) = &result {
            let reason = format!("dispatch failed: {e}");
            if let Err(recover) = self.requeue_orphans(&reason) {
                error!(holder = %self.holder, error = %recover, "cannot re-queue after a failed tick");
                guard.abandon();
                return result;
            }
        }
        if let Err(e) = guard.release() {
            warn!(holder = %self.holder, error = %e, "lock release failed");
        }
        result
    }

    async fn tick(&self, guard: &LockGuard) -> Result<Tick, DispatchError> {
        // Nobody else can be dispatching: anything in `processing` is orphaned.
        self.requeue_orphans("left in processing by a previous holder")?;
        let Some(envelope) = self.store.claim_next(guard)? else {
            debug!(holder = %self.holder, "nothing pending");
            return Ok(Tick::Idle);
        };
        Ok(Tick::Dispatched(self.dispatch(guard, envelope).await?))
    }

    /// Loop until `shutdown` flips to true or its sender goes away.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), DispatchError> {
        info!(holder = %self.holder, "dispatcher started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            let pause = match self.run_once().await {
                Ok(Tick::Dispatched(_)) => continue,
                Ok(Tick::Idle) => self.config.idle_poll(),
                Ok(Tick::Busy) => self.config.busy_poll(),
                Err(e) if e.is_fatal() => {
                    error!(holder = %self.holder, error = %e, "dispatcher stopping");
                    return Err(e);
                }
                Err(e) => {
                    error!(holder = %self.holder, error = %e, kind = ?e.kind(), "tick failed");
                    self.config.idle_poll()
                }
            };
            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!(holder = %self.holder, "dispatcher stopped");
        Ok(())
    }

    /// Take the Lock Token, reclaiming it first if its holder went stale.
    fn acquire(&self) -> Result<Option<LockGuard>, DispatchError> {
        let lock = self.store.lock();
        let now = self.store.now();
        let token = match lock.try_acquire(&self.holder, now).map_err(DispatchError::Lock)? {
            Acquire::Acquired(guard) => return Ok(Some(guard)),
            Acquire::Held(token) if !lock.is_stale(&token, now) => return Ok(None),
            Acquire::Held(token) => token,
        };

        warn!(
            stale_holder = %token.holder,
            pid = token.pid,
            acquired_at = %token.acquired_at,
            "reclaiming stale lock"
        );
        let reason = format!("lock holder {} went stale", token.holder);
        let recovered = match lock
            .reclaim(&token, now, || self.store.recover_orphans(&reason))
            .map_err(DispatchError::Reclaim)?
        {
            Reclaim::Reclaimed(outcomes) => outcomes,
            Reclaim::Contended | Reclaim::Fresh => return Ok(None),
        };
        self.note_recovered(&recovered, &reason);

        match lock
            .try_acquire(&self.holder, self.store.now())
            .map_err(DispatchError::Lock)?
        {
            Acquire::Acquired(guard) => Ok(Some(guard)),
            Acquire::Held(_) => Ok(None),
        }
    }

    async fn dispatch(
        &self,
        guard: &LockGuard,
        envelope: Envelope,
    ) -> Result<DispatchReport, DispatchError> {
        let started = Instant::now();
        let command = envelope.command_name().to_string();
        let report = |disposition, error| DispatchReport {
            id: envelope.id.clone(),
            command: command.clone(),
            disposition,
            error,
            elapsed: started.elapsed(),
        };

        let Some(handler) = self.router.resolve(&command) else {
            let error = format!("unknown command: {command}");
            self.store.reject(&envelope.id, &error)?;
            return Ok(report(Disposition::Rejected, Some(error)));
        };

        let step_task = envelope.task_id.clone().filter(|_| handler.drives_step());
        if let Some(task_id) = &step_task {
            let doc = envelope.body.get("task");
            match self.engine.begin_step(task_id, doc, Some(envelope.max_retries)) {
                Ok(true) => {}
                Ok(false) => {
                    let error = format!("task {task_id} cannot enter EXECUTING");
                    self.store.reject(&envelope.id, &error)?;
                    return Ok(report(Disposition::Rejected, Some(error)));
                }
                Err(e) => {
                    let error = format!("task {task_id}: {e}");
                    let outcome = self.store.fail(&envelope.id, &error)?;
                    return Ok(report(disposition_of(&outcome), Some(error)));
                }
            }
        }

        let ctx = CommandContext::for_envelope(&envelope, self.actuator.clone());
        let payload = envelope.payload();
        debug!(id = %envelope.id, command = %command, holder = %guard.holder(), "invoking handler");
        let handle = tokio::spawn(async move { handler.handle(&ctx, payload).await });
        let abort = handle.abort_handle();
        let attempt = match tokio::time::timeout(self.config.handler_timeout(), handle).await {
            Ok(Ok(Ok(result))) => Attempt::Finished(result),
            Ok(Ok(Err(e))) => Attempt::Errored(e),
            Ok(Err(join)) => Attempt::Panicked(join.to_string()),
            Err(_) => {
                abort.abort();
                Attempt::TimedOut
            }
        };

        match attempt {
            Attempt::Finished(result) if result.ok => {
                self.store.complete(&envelope.id)?;
                let event = result.task_event.clone().or_else(|| {
                    step_task.as_ref().map(|_| TaskEvent::StepPassed {
                        evidence: result.evidence.clone(),
                        approval_required: envelope.approval_override(),
                    })
                });
                if let (Some(task_id), Some(event)) = (&envelope.task_id, event) {
                    self.advance(task_id, &event);
                }
                Ok(report(Disposition::Completed, None))
            }
            Attempt::Finished(result) => {
                let error = result
                    .error
                    .unwrap_or_else(|| "handler reported failure".to_string());
                self.record_failure(&envelope, step_task.as_ref(), &error, None)
                    .map(|d| report(d, Some(error)))
            }
            Attempt::Errored(e) if e.kind() == ErrorKind::Validation => {
                let error = e.to_string();
                self.store.reject(&envelope.id, &error)?;
                if let Some(task_id) = &step_task {
                    self.advance(task_id, &TaskEvent::step_failed(error.clone()));
                }
                Ok(report(Disposition::Rejected, Some(error)))
            }
            Attempt::Errored(HandlerError::RateLimited(reason)) => {
                let error = format!("rate limited: {reason}");
                let event = TaskEvent::RateLimited { reason };
                self.record_failure(&envelope, step_task.as_ref(), &error, Some(event))
                    .map(|d| report(d, Some(error)))
            }
            Attempt::Errored(e) => {
                let error = e.to_string();
                self.record_failure(&envelope, step_task.as_ref(), &error, None)
                    .map(|d| report(d, Some(error)))
            }
            Attempt::Panicked(detail) => {
                let error = format!("handler panicked: {detail}");
                self.record_failure(&envelope, step_task.as_ref(), &error, None)
                    .map(|d| report(d, Some(error)))
            }
            Attempt::TimedOut => {
                let error = format!(
                    "handler timed out after {}s",
                    self.config.handler_timeout().as_secs()
                );
                self.record_failure(&envelope, step_task.as_ref(), &error, Some(TaskEvent::Timeout))
                    .map(|d| report(d, Some(error)))
            }
        }
    }

    /// `fail` the envelope and feed the task `event` (default `step_failed`).
    ///
    /// Once the envelope is parked in `failed` nothing will resume the task,
    /// so a final failure always drives `step_failed` into ERROR.
    fn record_failure(
        &self,
        envelope: &Envelope,
        step_task: Option<&TaskId>,
        error: &str,
        event: Option<TaskEvent>,
    ) -> Result<Disposition, DispatchError> {
        let outcome = self.store.fail(&envelope.id, error)?;
        if let Some(task_id) = step_task {
            let event = match event {
                Some(event) if !outcome.is_final() => event,
                _ => TaskEvent::step_failed(error),
            };
            self.advance(task_id, &event);
        }
        Ok(disposition_of(&outcome))
    }

    fn requeue_orphans(&self, reason: &str) -> Result<(), StoreError> {
        let recovered = self.store.recover_orphans(reason)?;
        self.note_recovered(&recovered, reason);
        Ok(())
    }

    fn note_recovered(&self, outcomes: &[FailOutcome], reason: &str) {
        for outcome in outcomes {
            let env = outcome.envelope();
            info!(id = %env.id, requeued = !outcome.is_final(), "recovered orphaned envelope");
            if let Some(task_id) = &env.task_id {
                self.advance(task_id, &TaskEvent::step_failed(reason));
            }
        }
    }

    /// FSM trouble never fails a tick: the envelope outcome is already on disk.
    fn advance(&self, task_id: &TaskId, event: &TaskEvent) {
        if let Err(e) = self.engine.apply(task_id, event) {
            error!(task_id = %task_id, event = %event, error = %e, "task update failed");
        }
    }
}

fn disposition_of(outcome: &FailOutcome) -> Disposition {
    match outcome {
        FailOutcome::Requeued(_) => Disposition::Requeued,
        FailOutcome::Failed(_) => Disposition::Failed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{EnvelopeStatus, Payload, TaskState};
    use crate::impls::{InMemoryTaskStore, RecordingActuator};
    use crate::ports::SystemClock;
    use crate::queue::Bucket;
    use crate::router::CommandHandler;
    use async_trait::async_trait;
    use chrono::Utc;
    use serde_json::json;
    use tempfile::TempDir;

    struct Slow;

    #[async_trait]
    impl CommandHandler for Slow {
        async fn handle(
            &self,
            _ctx: &CommandContext,
            _payload: Payload,
        ) -> Result<CommandResult, HandlerError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(CommandResult::ok())
        }
    }

    struct Boom;

    #[async_trait]
    impl CommandHandler for Boom {
        async fn handle(
            &self,
            _ctx: &CommandContext,
            _payload: Payload,
        ) -> Result<CommandResult, HandlerError> {
            panic!("handler bug");
        }
    }

    struct Throttled;

    #[async_trait]
    impl CommandHandler for Throttled {
        async fn handle(
            &self,
            _ctx: &CommandContext,
            _payload: Payload,
        ) -> Result<CommandResult, HandlerError> {
            Err(HandlerError::RateLimited("429".into()))
        }
    }

    struct Harness {
        _dir: TempDir,
        store: Arc<DurableStore>,
        engine: Arc<TaskEngine>,
        dispatcher: Dispatcher,
    }

    fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(DurableStore::open(dir.path(), Arc::new(SystemClock)).unwrap());
        let engine = Arc::new(TaskEngine::new(
            Arc::new(InMemoryTaskStore::new()),
            Arc::new(SystemClock),
            3,
        ));
        let mut router = CommandRouter::with_builtins();
        router.register("slow", Slow).unwrap();
        router.register("boom", Boom).unwrap();
        router.register("throttled", Throttled).unwrap();

        let mut config = DispatcherConfig::default();
        config.handler_timeout_secs = 1;
        let dispatcher = Dispatcher::new(
            store.clone(),
            Arc::new(router),
            engine.clone(),
            Arc::new(RecordingActuator::new()),
            HolderId::parse("holder-test").unwrap(),
            config,
        );
        Harness {
            _dir: dir,
            store,
            engine,
            dispatcher,
        }
    }

    fn envelope(id: &str, command: &str) -> Envelope {
        Envelope::new(
            EnvelopeId::parse(id).unwrap(),
            "agent-1",
            "agent-2",
            command,
            json!({}),
            Utc::now(),
        )
    }

    fn task_envelope(id: &str, command: &str, task: &str) -> Envelope {
        let mut env = envelope(id, command).with_task(TaskId::parse(task).unwrap());
        env.body = json!({
            "action": "click",
            "task": {"title": "Open settings", "acceptance_criteria": ["panel visible"]}
        });
        env
    }

    async fn tick(h: &Harness) -> DispatchReport {
        match h.dispatcher.run_once().await.unwrap() {
            Tick::Dispatched(report) => report,
            other => panic!("expected a dispatch, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn idle_when_nothing_pending_and_lock_released() {
        let h = harness();
        assert_eq!(h.dispatcher.run_once().await.unwrap(), Tick::Idle);
        assert!(h.store.lock().current().unwrap().is_none());
    }

    #[tokio::test]
    async fn busy_while_someone_else_holds_the_lock() {
        let h = harness();
        h.store.enqueue(envelope("t1", "ping")).unwrap();
        let other = HolderId::parse("holder-other").unwrap();
        let _held = h.store.lock().try_acquire(&other, Utc::now()).unwrap();
        assert_eq!(h.dispatcher.run_once().await.unwrap(), Tick::Busy);
        assert_eq!(h.store.counts().unwrap().pending, 1);
    }

    #[tokio::test]
    async fn unknown_command_is_rejected_without_retry() {
        let h = harness();
        h.store.enqueue(envelope("t1", "nope")).unwrap();
        let report = tick(&h).await;
        assert_eq!(report.disposition, Disposition::Rejected);
        let (bucket, env) = h.store.get(&report.id).unwrap().unwrap();
        assert_eq!(bucket, Bucket::Failed);
        assert_eq!(env.retries, 0);
    }

    #[tokio::test]
    async fn panicking_handler_counts_as_failure() {
        let h = harness();
        h.store.enqueue(envelope("t1", "boom")).unwrap();
        let report = tick(&h).await;
        assert_eq!(report.disposition, Disposition::Requeued);
        assert!(report.error.unwrap().contains("panicked"));
        assert!(h.store.lock().current().unwrap().is_none());
    }

    #[tokio::test]
    async fn timeout_blocks_the_task() {
        let h = harness();
        h.store.enqueue(task_envelope("t1", "slow", "settings")).unwrap();
        let report = tick(&h).await;
        assert_eq!(report.disposition, Disposition::Requeued);
        assert!(report.error.unwrap().contains("timed out"));

        let task = h.engine.get(&TaskId::parse("settings").unwrap()).unwrap().unwrap();
        assert_eq!(task.state, TaskState::Blocked);
        assert_eq!(task.blockers, vec!["timeout"]);
    }

    #[tokio::test]
    async fn rate_limit_blocks_the_task() {
        let h = harness();
        h.store.enqueue(task_envelope("t1", "throttled", "settings")).unwrap();
        tick(&h).await;
        let task = h.engine.get(&TaskId::parse("settings").unwrap()).unwrap().unwrap();
        assert_eq!(task.state, TaskState::Blocked);
        assert_eq!(task.blockers, vec!["rate_limited: 429"]);
    }

    #[tokio::test]
    async fn actuate_completes_the_task_with_evidence() {
        let h = harness();
        h.store.enqueue(task_envelope("t1", "actuate", "settings")).unwrap();
        let report = tick(&h).await;
        assert_eq!(report.disposition, Disposition::Completed);

        let task = h.engine.get(&TaskId::parse("settings").unwrap()).unwrap().unwrap();
        assert_eq!(task.state, TaskState::Complete);
        assert_eq!(task.evidence_refs, vec!["actuator:agent-2:click:t1"]);
        let (_, env) = h.store.get(&report.id).unwrap().unwrap();
        assert_eq!(env.status, EnvelopeStatus::Completed);
    }

    #[tokio::test]
    async fn step_for_invalid_task_is_rejected() {
        let h = harness();
        let env = envelope("t1", "actuate").with_task(TaskId::parse("bare").unwrap());
        h.store.enqueue(env).unwrap();
        let report = tick(&h).await;
        assert_eq!(report.disposition, Disposition::Rejected);
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let h = harness();
        let (tx, rx) = watch::channel(false);
        let dispatcher = Arc::new(h.dispatcher);
        let runner = {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move { dispatcher.run(rx).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), runner)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
