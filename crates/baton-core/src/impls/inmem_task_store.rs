//! InMemoryTaskStore - HashMap backed task records.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use crate::domain::{Task, TaskId};
use crate::error::StoreError;
use crate::ports::TaskStore;

/// Process-local task records. Lost on exit.
#[derive(Debug, Default)]
pub struct InMemoryTaskStore {
    tasks: Mutex<HashMap<TaskId, Task>>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TaskStore for InMemoryTaskStore {
    fn load(&self, task_id: &TaskId) -> Result<Option<Task>, StoreError> {
        let tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(tasks.get(task_id).cloned())
    }

    fn save(&self, task: &Task) -> Result<(), StoreError> {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        tasks.insert(task.task_id.clone(), task.clone());
        Ok(())
    }

    fn list(&self) -> Result<Vec<Task>, StoreError> {
        let tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        let mut all: Vec<_> = tasks.values().cloned().collect();
        all.sort_by(|a, b| a.task_id.cmp(&b.task_id));
        Ok(all)
    }
}
