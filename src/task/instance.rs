// src/task/instance.rs

//! The persisted task record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::task::params::Params;
use crate::types::{Credential, TargetRef, TaskId, TaskStatus};

/// Stage every new task starts in; its handler is the task type's `on_init`.
pub const INIT_STAGE: &str = "init";

/// One entry of a task's stage history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    /// Stage that was left.
    pub name: String,
    pub complete_at: DateTime<Utc>,
}

/// Reason recorded by `set_stage_failed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub stage: String,
    pub reason: Value,
}

/// A stage occupancy: the stage name plus how many transitions preceded it.
///
/// Re-entering the same stage name yields a new `seq`, so signals addressed
/// to an earlier occupancy can be told apart and dropped.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StageMark {
    pub name: String,
    pub seq: usize,
}

/// Completion target of a child task: the parent and the stage occupancy the
/// parent was in when the child was spawned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentLink {
    pub task_id: TaskId,
    pub stage: StageMark,
}

/// Durable state of one task. Everything needed to resume a task after a
/// restart is in here; the target entity is referenced, never embedded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskInstance {
    pub id: TaskId,
    pub task_type: String,
    /// Primary target; the first of `targets` for multi-object tasks.
    pub target: TargetRef,
    /// Every target of a multi-object task, sorted; empty otherwise.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub targets: Vec<TargetRef>,
    /// Stage currently awaited; `None` once terminal.
    pub stage: Option<String>,
    pub params: Params,
    pub owner: Credential,
    #[serde(default)]
    pub parent: Option<ParentLink>,
    pub status: TaskStatus,
    /// Percent done, 0 to 100.
    #[serde(default)]
    pub progress: f32,
    #[serde(default)]
    pub stages: Vec<StageRecord>,
    #[serde(default)]
    pub failures: Vec<FailureRecord>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskInstance {
    pub fn new(
        task_type: impl Into<String>,
        target: TargetRef,
        owner: Credential,
        params: Params,
        parent: Option<ParentLink>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: TaskId::new(),
            task_type: task_type.into(),
            target,
            targets: Vec::new(),
            stage: Some(INIT_STAGE.to_string()),
            params,
            owner,
            parent,
            status: TaskStatus::Running,
            progress: 0.0,
            stages: Vec::new(),
            failures: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Task over several targets, re-fetched in sorted order at every stage.
    /// The primary `target` becomes the first of them.
    pub fn with_targets(mut self, mut targets: Vec<TargetRef>) -> Self {
        targets.sort();
        targets.dedup();
        if let Some(first) = targets.first() {
            self.target = first.clone();
        }
        self.targets = targets;
        self
    }

    pub fn is_multi(&self) -> bool {
        !self.targets.is_empty()
    }

    /// Targets to fetch before each handler: all of them for a multi-object
    /// task, otherwise just the primary one.
    pub fn all_targets(&self) -> Vec<TargetRef> {
        if self.is_multi() {
            self.targets.clone()
        } else {
            vec![self.target.clone()]
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Current stage occupancy, if a stage is awaited.
    pub fn current_mark(&self) -> Option<StageMark> {
        self.stage.as_ref().map(|name| StageMark {
            name: name.clone(),
            seq: self.stages.len(),
        })
    }

    pub fn parent_id(&self) -> Option<TaskId> {
        self.parent.as_ref().map(|p| p.task_id)
    }

    /// Leave the current stage, recording it in the history.
    pub(crate) fn leave_stage(&mut self, next: Option<String>) {
        let now = Utc::now();
        if let Some(prev) = self.stage.take() {
            self.stages.push(StageRecord {
                name: prev,
                complete_at: now,
            });
        }
        self.stage = next;
        self.updated_at = now;
    }

    pub(crate) fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

impl std::fmt::Display for TaskInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}({},{})",
            self.id,
            self.task_type,
            self.stage.as_deref().unwrap_or("-")
        )
    }
}
