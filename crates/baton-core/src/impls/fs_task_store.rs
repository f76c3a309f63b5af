//! FileTaskStore - one pretty JSON file per task under `store/tasks/`.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::domain::{Task, TaskId};
use crate::error::StoreError;
use crate::ports::TaskStore;
use crate::queue::fsio;

/// One pretty JSON file per task under `dir`, written atomically.
#[derive(Debug, Clone)]
pub struct FileTaskStore {
    dir: PathBuf,
}

impl FileTaskStore {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| StoreError::io(&dir, e))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_of(&self, task_id: &TaskId) -> PathBuf {
        self.dir.join(task_id.as_str())
    }
}

fn read_task(path: &Path) -> Result<Option<Task>, StoreError> {
    let raw = match fs::read(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(StoreError::io(path, e)),
    };
    serde_json::from_slice(&raw)
        .map(Some)
        .map_err(|source| StoreError::Codec {
            path: path.to_path_buf(),
            source,
        })
}

impl TaskStore for FileTaskStore {
    fn load(&self, task_id: &TaskId) -> Result<Option<Task>, StoreError> {
        read_task(&self.path_of(task_id))
    }

    fn save(&self, task: &Task) -> Result<(), StoreError> {
        let path = self.path_of(&task.task_id);
        let bytes = serde_json::to_vec_pretty(task).map_err(|source| StoreError::Codec {
            path: path.clone(),
            source,
        })?;
        fsio::write_atomic(&path, &bytes).map_err(|e| StoreError::io(&path, e))
    }

    fn list(&self) -> Result<Vec<Task>, StoreError> {
        let files = fsio::visible_files(&self.dir).map_err(|e| StoreError::io(&self.dir, e))?;
        let mut tasks = Vec::with_capacity(files.len());
        for path in files {
            match read_task(&path) {
                Ok(Some(task)) => tasks.push(task),
                Ok(None) => {}
                Err(e @ StoreError::Codec { .. }) => {
                    warn!(error = %e, "skipping unreadable task record");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(tasks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{TaskSpec, TaskState};
    use chrono::Utc;

    #[test]
    fn save_then_load_and_list() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileTaskStore::open(dir.path().join("tasks")).unwrap();
        let id = TaskId::parse("build").unwrap();
        assert!(store.load(&id).unwrap().is_none());

        let mut task = Task::new(id.clone(), Some(TaskSpec::new("Build")), 3, Utc::now());
        store.save(&task).unwrap();
        task.state = TaskState::Ready;
        store.save(&task).unwrap();

        assert_eq!(store.load(&id).unwrap().unwrap().state, TaskState::Ready);
        fs::write(store.dir().join("junk"), b"[").unwrap();
        assert_eq!(store.list().unwrap().len(), 1);
    }
}
