//! Observer notifications: notable task transitions become `verify`
//! envelopes addressed to the configured observer.

use std::sync::Arc;

use serde_json::json;
use tracing::{debug, error};

use crate::domain::{Envelope, Task, TaskState};
use crate::fsm::TransitionObserver;
use crate::ports::IdGenerator;
use crate::queue::DurableStore;

/// Tag of observer notification envelopes.
pub const NOTIFY_TAG: &str = "verify";
pub const NOTIFY_COMMAND: &str = "notify";

/// [`TransitionObserver`] that enqueues a notification envelope for the
/// configured observer recipient.
pub struct EnvelopeNotifier {
    store: Arc<DurableStore>,
    ids: Arc<dyn IdGenerator>,
    sender: String,
    observer: String,
}

impl EnvelopeNotifier {
    pub fn new(
        store: Arc<DurableStore>,
        ids: Arc<dyn IdGenerator>,
        sender: impl Into<String>,
        observer: impl Into<String>,
    ) -> Self {
        Self {
            store,
            ids,
            sender: sender.into(),
            observer: observer.into(),
        }
    }

    /// The notification for `task` in its current state.
    pub fn envelope_for(&self, task: &Task) -> Envelope {
        let body = json!({
            "task_id": task.task_id,
            "state": task.state,
            "evidence_refs": task.evidence_refs,
        });
        Envelope::new(
            self.ids.envelope_id(),
            self.sender.clone(),
            self.observer.clone(),
            NOTIFY_TAG,
            body,
            self.store.now(),
        )
        .with_command(NOTIFY_COMMAND)
        .with_max_retries(self.store.retry_policy().default_max_retries)
    }
}

impl TransitionObserver for EnvelopeNotifier {
    /// Enqueue failures are logged; the transition itself already happened.
    fn on_transition(&self, task: &Task, from: TaskState) {
        let envelope = self.envelope_for(task);
        match self.store.enqueue(envelope) {
            Ok(id) => debug!(
                id = %id,
                task_id = %task.task_id,
                from = %from,
                to = %task.state,
                observer = %self.observer,
                "observer notified"
            ),
            Err(e) => error!(
                task_id = %task.task_id,
                state = %task.state,
                error = %e,
                "failed to enqueue observer notification"
            ),
        }
    }
}
