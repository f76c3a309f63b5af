//! TaskStore port - persistence of FSM subjects.

use crate::domain::{Task, TaskId};
use crate::error::StoreError;

/// Source of truth for task records.
///
/// Implementations: `FileTaskStore` (one JSON file per task next to the
/// envelope buckets) and `InMemoryTaskStore` (tests, embedding).
pub trait TaskStore: Send + Sync {
    fn load(&self, task_id: &TaskId) -> Result<Option<Task>, StoreError>;

    /// Insert or overwrite.
    fn save(&self, task: &Task) -> Result<(), StoreError>;

    fn list(&self) -> Result<Vec<Task>, StoreError>;
}
