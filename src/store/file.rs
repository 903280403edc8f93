// src/store/file.rs

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use crate::errors::{EngineError, Result};
use crate::store::{SubtaskRecord, SubtaskResult, TaskStore};
use crate::task::instance::{StageMark, TaskInstance};
use crate::types::{BoxFuture, TaskId};

const TASKS_DIR: &str = "tasks";
const SUBTASKS_DIR: &str = "subtasks";

/// Stores tasks as JSON documents on disk:
///
/// - `<root>/tasks/<task id>.json`
/// - `<root>/subtasks/<parent id>.json` (ledger of that parent's children)
///
/// Writes go through a temp file and a rename so a crash never leaves a
/// truncated document behind.
pub struct FileTaskStore {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl FileTaskStore {
    pub fn open(root: &Path) -> Result<Self> {
        fs::create_dir_all(root.join(TASKS_DIR))?;
        fs::create_dir_all(root.join(SUBTASKS_DIR))?;
        info!(root = %root.display(), "opened file task store");
        Ok(Self {
            root: root.to_path_buf(),
            write_lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn task_path(&self, id: TaskId) -> PathBuf {
        self.root.join(TASKS_DIR).join(format!("{id}.json"))
    }

    fn ledger_path(&self, parent_id: TaskId) -> PathBuf {
        self.root.join(SUBTASKS_DIR).join(format!("{parent_id}.json"))
    }

    fn locked<R>(&self, f: impl FnOnce() -> Result<R>) -> Result<R> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| EngineError::Other(anyhow::anyhow!("task store lock poisoned")))?;
        f()
    }

    fn load_ledger(&self, parent_id: TaskId) -> Result<Vec<SubtaskRecord>> {
        Ok(read_json(&self.ledger_path(parent_id))?.unwrap_or_default())
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, serde_json::to_vec_pretty(value)?)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

impl TaskStore for FileTaskStore {
    fn insert<'a>(&'a self, task: &'a TaskInstance) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.locked(|| write_json(&self.task_path(task.id), task))?;
            debug!(task_id = %task.id, "stored task (file)");
            Ok(())
        })
    }

    fn save<'a>(&'a self, task: &'a TaskInstance) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let path = self.task_path(task.id);
            self.locked(|| {
                if !path.exists() {
                    return Err(EngineError::TaskNotFound(task.id));
                }
                write_json(&path, task)
            })
        })
    }

    fn load(&self, id: TaskId) -> BoxFuture<'_, Result<Option<TaskInstance>>> {
        Box::pin(async move { read_json(&self.task_path(id)) })
    }

    fn list_running(&self) -> BoxFuture<'_, Result<Vec<TaskInstance>>> {
        Box::pin(async move {
            let mut running = Vec::new();
            for entry in fs::read_dir(self.root.join(TASKS_DIR))? {
                let path = entry?.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                match read_json::<TaskInstance>(&path) {
                    Ok(Some(task)) if !task.is_terminal() => running.push(task),
                    Ok(_) => {}
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "skipping unreadable task document");
                    }
                }
            }
            running.sort_by_key(|t| t.created_at);
            Ok(running)
        })
    }

    fn insert_subtask<'a>(&'a self, record: &'a SubtaskRecord) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.locked(|| {
                let mut ledger = self.load_ledger(record.parent_id)?;
                ledger.push(record.clone());
                write_json(&self.ledger_path(record.parent_id), &ledger)
            })
        })
    }

    fn save_subtask_result(
        &self,
        parent_id: TaskId,
        child_id: TaskId,
        result: SubtaskResult,
    ) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.locked(|| {
                let mut ledger = self.load_ledger(parent_id)?;
                let record = ledger
                    .iter_mut()
                    .find(|r| r.child_id == child_id)
                    .ok_or(EngineError::TaskNotFound(child_id))?;
                record.result = Some(result);
                write_json(&self.ledger_path(parent_id), &ledger)
            })
        })
    }

    fn subtasks_of<'a>(
        &'a self,
        parent_id: TaskId,
        stage: &'a StageMark,
    ) -> BoxFuture<'a, Result<Vec<SubtaskRecord>>> {
        Box::pin(async move {
            Ok(self
                .load_ledger(parent_id)?
                .into_iter()
                .filter(|r| &r.stage == stage)
                .collect())
        })
    }
}
