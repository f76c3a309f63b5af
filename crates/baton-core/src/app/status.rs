//! Status snapshot: what is queued where, and who holds the actuator.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::Serialize;

use crate::error::{FsmError, LockError, StoreError};
use crate::fsm::TaskEngine;
use crate::queue::{DurableStore, LockToken, StoreCounts};

/// Point-in-time view of a store, serialized by `baton status`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusReport {
    pub root: PathBuf,
    pub counts: StoreCounts,
    pub lock: Option<LockToken>,
    pub lock_stale: bool,
    /// Number of tasks per state name.
    pub tasks: BTreeMap<String, usize>,
}

#[derive(Debug, thiserror::Error)]
pub enum StatusError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error(transparent)]
    Fsm(#[from] FsmError),
}

impl StatusReport {
    /// Read counts, the lock token and every task record.
    pub fn collect(store: &DurableStore, engine: &TaskEngine) -> Result<Self, StatusError> {
        let lock = store.lock().current()?;
        let lock_stale = lock
            .as_ref()
            .is_some_and(|token| store.lock().is_stale(token, store.now()));
        let mut tasks = BTreeMap::new();
        for task in engine.list()? {
            *tasks.entry(task.state.to_string()).or_insert(0) += 1;
        }
        Ok(Self {
            root: store.root().to_path_buf(),
            counts: store.counts()?,
            lock,
            lock_stale,
            tasks,
        })
    }
}
