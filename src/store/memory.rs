// src/store/memory.rs

use std::collections::HashMap;
use std::sync::Mutex;

use tracing::debug;

use crate::errors::{EngineError, Result};
use crate::store::{SubtaskRecord, SubtaskResult, TaskStore};
use crate::task::instance::{StageMark, TaskInstance};
use crate::types::{BoxFuture, TaskId};

#[derive(Default)]
struct Inner {
    tasks: HashMap<TaskId, TaskInstance>,
    subtasks: HashMap<TaskId, Vec<SubtaskRecord>>,
}

/// Stores tasks in memory only.
#[derive(Default)]
pub struct MemoryTaskStore {
    inner: Mutex<Inner>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<R>(&self, f: impl FnOnce(&mut Inner) -> Result<R>) -> Result<R> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| EngineError::Other(anyhow::anyhow!("task store lock poisoned")))?;
        f(&mut inner)
    }

    pub fn len(&self) -> usize {
        self.with(|inner| Ok(inner.tasks.len())).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl TaskStore for MemoryTaskStore {
    fn insert<'a>(&'a self, task: &'a TaskInstance) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.with(|inner| {
                inner.tasks.insert(task.id, task.clone());
                Ok(())
            })?;
            debug!(task_id = %task.id, "stored task (memory)");
            Ok(())
        })
    }

    fn save<'a>(&'a self, task: &'a TaskInstance) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.with(|inner| match inner.tasks.get_mut(&task.id) {
                Some(slot) => {
                    *slot = task.clone();
                    Ok(())
                }
                None => Err(EngineError::TaskNotFound(task.id)),
            })
        })
    }

    fn load(&self, id: TaskId) -> BoxFuture<'_, Result<Option<TaskInstance>>> {
        Box::pin(async move { self.with(|inner| Ok(inner.tasks.get(&id).cloned())) })
    }

    fn list_running(&self) -> BoxFuture<'_, Result<Vec<TaskInstance>>> {
        Box::pin(async move {
            self.with(|inner| {
                let mut running: Vec<TaskInstance> = inner
                    .tasks
                    .values()
                    .filter(|t| !t.is_terminal())
                    .cloned()
                    .collect();
                running.sort_by_key(|t| t.created_at);
                Ok(running)
            })
        })
    }

    fn insert_subtask<'a>(&'a self, record: &'a SubtaskRecord) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.with(|inner| {
                inner
                    .subtasks
                    .entry(record.parent_id)
                    .or_default()
                    .push(record.clone());
                Ok(())
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
            self.with(|inner| {
                let record = inner
                    .subtasks
                    .get_mut(&parent_id)
                    .and_then(|ledger| ledger.iter_mut().find(|r| r.child_id == child_id))
                    .ok_or(EngineError::TaskNotFound(child_id))?;
                record.result = Some(result);
                Ok(())
            })
        })
    }

    fn subtasks_of<'a>(
        &'a self,
        parent_id: TaskId,
        stage: &'a StageMark,
    ) -> BoxFuture<'a, Result<Vec<SubtaskRecord>>> {
        Box::pin(async move {
            self.with(|inner| {
                Ok(inner
                    .subtasks
                    .get(&parent_id)
                    .map(|ledger| {
                        ledger
                            .iter()
                            .filter(|r| &r.stage == stage)
                            .cloned()
                            .collect()
                    })
                    .unwrap_or_default())
            })
        })
    }
}
