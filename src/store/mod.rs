// src/store/mod.rs

//! Durable task state.
//!
//! A [`TaskStore`] keeps task instances plus the subtask ledger that links
//! children to the parent stage they report to. Two implementations exist,
//! selected by `[engine] storage`:
//!
//! - [`MemoryTaskStore`]: process-local, lost on restart.
//! - [`FileTaskStore`]: one JSON document per task under `<state_dir>/tasks`
//!   and one ledger per parent under `<state_dir>/subtasks`.

pub mod file;
pub mod memory;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::model::EngineConfig;
use crate::errors::Result;
use crate::task::instance::{ParentLink, StageMark, TaskInstance};
use crate::types::{BoxFuture, Outcome, StorageMode, TaskId};

pub use file::FileTaskStore;
pub use memory::MemoryTaskStore;

/// Terminal outcome of a child, as reported to its parent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubtaskResult {
    pub outcome: Outcome,
    pub data: Value,
}

/// One child spawned while its parent awaited `stage`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubtaskRecord {
    pub parent_id: TaskId,
    pub stage: StageMark,
    pub child_id: TaskId,
    /// `None` while the child is still running.
    #[serde(default)]
    pub result: Option<SubtaskResult>,
}

impl SubtaskRecord {
    pub fn new(link: &ParentLink, child_id: TaskId) -> Self {
        Self {
            parent_id: link.task_id,
            stage: link.stage.clone(),
            child_id,
            result: None,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.result.is_some()
    }
}

pub trait TaskStore: Send + Sync {
    fn insert<'a>(&'a self, task: &'a TaskInstance) -> BoxFuture<'a, Result<()>>;

    fn save<'a>(&'a self, task: &'a TaskInstance) -> BoxFuture<'a, Result<()>>;

    fn load(&self, id: TaskId) -> BoxFuture<'_, Result<Option<TaskInstance>>>;

    /// Every task whose status is not terminal.
    fn list_running(&self) -> BoxFuture<'_, Result<Vec<TaskInstance>>>;

    fn insert_subtask<'a>(&'a self, record: &'a SubtaskRecord) -> BoxFuture<'a, Result<()>>;

    /// Record a child's terminal outcome in its parent's ledger.
    fn save_subtask_result(
        &self,
        parent_id: TaskId,
        child_id: TaskId,
        result: SubtaskResult,
    ) -> BoxFuture<'_, Result<()>>;

    /// Children spawned while `parent_id` was in stage occupancy `stage`.
    fn subtasks_of<'a>(
        &'a self,
        parent_id: TaskId,
        stage: &'a StageMark,
    ) -> BoxFuture<'a, Result<Vec<SubtaskRecord>>>;
}

/// Build the store selected by the engine config.
pub fn build_store(engine: &EngineConfig) -> Result<Arc<dyn TaskStore>> {
    match engine.storage {
        StorageMode::Memory => Ok(Arc::new(MemoryTaskStore::new())),
        StorageMode::File => Ok(Arc::new(FileTaskStore::open(&engine.state_dir)?)),
    }
}
