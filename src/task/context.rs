// src/task/context.rs

//! Handle given to every stage handler.
//!
//! It owns the freshly loaded [`TaskInstance`] for the duration of one handler
//! invocation and exposes the only legal ways to move the task forward:
//! [`TaskContext::set_stage`], [`TaskContext::set_stage_complete`] and
//! [`TaskContext::set_stage_failed`]. It also bridges external operations and
//! local blocking work back into stage signals.

use std::future::Future;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::audit::AuditEvent;
use crate::engine::TaskManager;
use crate::entity::EntityHandle;
use crate::errors::{EngineError, Result};
use crate::task::instance::{FailureRecord, ParentLink, TaskInstance};
use crate::task::params::Params;
use crate::types::{Credential, Outcome, TargetRef, TaskId, TaskStatus};

pub struct TaskContext {
    manager: TaskManager,
    task: TaskInstance,
    targets: Vec<EntityHandle>,
    transitioned: bool,
}

impl TaskContext {
    pub(crate) fn new(manager: TaskManager, task: TaskInstance) -> Self {
        Self {
            manager,
            task,
            targets: Vec::new(),
            transitioned: false,
        }
    }

    pub(crate) fn with_targets(mut self, targets: Vec<EntityHandle>) -> Self {
        self.targets = targets;
        self
    }

    pub fn id(&self) -> TaskId {
        self.task.id
    }

    pub fn task_type(&self) -> &str {
        &self.task.task_type
    }

    pub fn stage(&self) -> Option<&str> {
        self.task.stage.as_deref()
    }

    pub fn target(&self) -> &TargetRef {
        &self.task.target
    }

    pub fn owner(&self) -> &Credential {
        &self.task.owner
    }

    /// Entities fetched for this invocation, in target order. A multi-object
    /// task sees all of them; otherwise this is just the primary target.
    pub fn targets(&self) -> &[EntityHandle] {
        &self.targets
    }

    pub fn params(&self) -> &Params {
        &self.task.params
    }

    /// Typed view of the params document.
    pub fn params_as<V: DeserializeOwned>(&self) -> Result<V> {
        self.task.params.view()
    }

    pub fn parent_id(&self) -> Option<TaskId> {
        self.task.parent_id()
    }

    pub fn instance(&self) -> &TaskInstance {
        &self.task
    }

    pub fn manager(&self) -> &TaskManager {
        &self.manager
    }

    /// Whether this handler invocation moved the task (stage change or
    /// terminal transition).
    pub(crate) fn transitioned(&self) -> bool {
        self.transitioned
    }

    /// Merge `params`, move to stage `name` and persist.
    ///
    /// Does not start anything: the caller kicks off the work whose outcome
    /// will be signalled back, typically with [`TaskContext::run_operation`]
    /// or [`TaskContext::local_task_run`].
    pub async fn set_stage(&mut self, name: &str, params: Params) -> Result<()> {
        if self.task.is_terminal() {
            return Err(EngineError::NoAwaitedStage(self.task.id));
        }
        if !self
            .manager
            .registry()
            .has_stage(&self.task.task_type, name)
        {
            return Err(EngineError::UnknownStage {
                task_type: self.task.task_type.clone(),
                stage: name.to_string(),
            });
        }

        let prev = self.task.stage.clone();
        self.task.params.merge(params);
        self.task.leave_stage(Some(name.to_string()));
        self.manager.store().save(&self.task).await?;
        self.transitioned = true;

        debug!(
            task_id = %self.task.id,
            task_type = %self.task.task_type,
            from = prev.as_deref().unwrap_or("-"),
            stage = %name,
            "stage set"
        );
        Ok(())
    }

    /// Merge and persist params without changing stage.
    pub async fn save_params(&mut self, params: Params) -> Result<()> {
        self.task.params.merge(params);
        self.task.touch();
        self.manager.store().save(&self.task).await
    }

    /// Record how far the task got, clamped to 0..=100.
    pub async fn set_progress(&mut self, percent: f32) -> Result<()> {
        self.task.progress = percent.clamp(0.0, 100.0);
        self.task.touch();
        self.manager.store().save(&self.task).await
    }

    /// `{id, type, name}` of each fetched target; the name falls back to the
    /// id when the target was not fetched.
    fn default_completion_data(&self) -> Params {
        let describe = |target: &TargetRef| {
            let name = self
                .targets
                .iter()
                .find(|e| e.kind() == target.kind && e.id() == target.id)
                .map_or(target.id.as_str(), |e| e.name());
            Params::new()
                .with("id", target.id.clone())
                .with("type", target.kind.clone())
                .with("name", name)
        };

        if self.task.is_multi() {
            let all: Vec<Value> = self
                .task
                .targets
                .iter()
                .map(|t| describe(t).into_value())
                .collect();
            Params::new().with("targets", all)
        } else {
            describe(&self.task.target)
        }
    }

    /// Finish the task successfully and notify the parent, if any.
    ///
    /// Empty `data` is replaced by `{id, type, name}` of the target, or a
    /// `targets` list of those for a multi-object task.
    pub async fn set_stage_complete(&mut self, data: Params) -> Result<()> {
        if self.task.is_terminal() {
            warn!(
                task_id = %self.task.id,
                status = ?self.task.status,
                "set_stage_complete on a finished task ignored"
            );
            return Ok(());
        }

        let data = if data.is_empty() {
            self.default_completion_data()
        } else {
            data
        };

        self.task.status = TaskStatus::Complete;
        self.task.progress = 100.0;
        self.task.leave_stage(None);
        self.manager.store().save(&self.task).await?;
        self.transitioned = true;

        info!(
            task_id = %self.task.id,
            task_type = %self.task.task_type,
            target = %self.task.target,
            "task complete"
        );

        self.notify_parent(Outcome::Success, data.into_value()).await;
        Ok(())
    }

    /// Fail the task, accumulating `reason` with earlier ones, and notify the
    /// parent, if any. Failing an already failed task is a no-op.
    pub async fn set_stage_failed(&mut self, reason: impl Into<Value>) -> Result<()> {
        let reason = reason.into();
        if self.task.is_terminal() {
            warn!(
                task_id = %self.task.id,
                status = ?self.task.status,
                %reason,
                "set_stage_failed on a finished task ignored"
            );
            return Ok(());
        }

        let stage = self.task.stage.clone().unwrap_or_default();
        self.task.failures.push(FailureRecord {
            stage: stage.clone(),
            reason: reason.clone(),
        });
        self.task.status = TaskStatus::Failed;
        self.task.progress = 100.0;
        self.task.leave_stage(None);
        self.manager.store().save(&self.task).await?;
        self.transitioned = true;

        warn!(
            task_id = %self.task.id,
            task_type = %self.task.task_type,
            target = %self.task.target,
            stage = %stage,
            %reason,
            "task failed"
        );

        self.notify_parent(Outcome::Failure, reason).await;
        Ok(())
    }

    async fn notify_parent(&self, outcome: Outcome, data: Value) {
        if self.task.parent.is_none() {
            return;
        }
        if let Err(e) = self.manager.child_finished(&self.task, outcome, data).await {
            error!(
                task_id = %self.task.id,
                parent_id = ?self.task.parent_id(),
                error = %e,
                "failed to notify parent task"
            );
        }
    }

    /// Spawn an external operation and signal its outcome back to the stage
    /// currently awaited. Errors are wrapped with `op`.
    pub fn run_operation<F>(&self, op: &str, operation: F) -> Result<()>
    where
        F: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        let mark = self
            .task
            .current_mark()
            .ok_or(EngineError::NoAwaitedStage(self.task.id))?;
        let manager = self.manager.clone();
        let task_id = self.task.id;
        let task_type = self.task.task_type.clone();
        let op = op.to_string();

        debug!(%task_id, stage = %mark.name, %op, "operation started");
        tokio::spawn(async move {
            let (outcome, data) = match operation.await {
                Ok(value) => (Outcome::Success, value),
                Err(e) => {
                    let err = EngineError::operation(&op, format!("{e:#}"));
                    warn!(%task_id, %op, error = %err, "operation failed");
                    (Outcome::Failure, Value::String(err.to_string()))
                }
            };
            manager.deliver(&task_type, task_id, Some(mark), outcome, data);
        });
        Ok(())
    }

    /// Run synchronous, possibly slow work on this task's worker pool and
    /// signal its result back to the stage currently awaited.
    ///
    /// Fails with [`EngineError::PoolOverloaded`] when the pool backlog is full.
    pub fn local_task_run<F>(&self, op: &str, work: F) -> Result<()>
    where
        F: FnOnce() -> anyhow::Result<Value> + Send + 'static,
    {
        let mark = self
            .task
            .current_mark()
            .ok_or(EngineError::NoAwaitedStage(self.task.id))?;
        let manager = self.manager.clone();
        let task_id = self.task.id;
        let task_type = self.task.task_type.clone();
        let op = op.to_string();

        let job = Box::pin(async move {
            let (outcome, data) = match tokio::task::spawn_blocking(work).await {
                Ok(Ok(value)) => (Outcome::Success, value),
                Ok(Err(e)) => {
                    let err = EngineError::operation(&op, format!("{e:#}"));
                    (Outcome::Failure, Value::String(err.to_string()))
                }
                Err(join) => {
                    let err = EngineError::operation(&op, join);
                    (Outcome::Failure, Value::String(err.to_string()))
                }
            };
            debug!(%task_id, %op, ?outcome, "local run finished");
            manager.deliver(&task_type, task_id, Some(mark), outcome, data);
        });

        self.manager
            .pool_for_type(&self.task.task_type)?
            .try_submit(job)
    }

    /// Create a child task whose terminal outcome is delivered to the stage
    /// this task currently awaits.
    pub async fn new_subtask(
        &self,
        task_type: &str,
        target: TargetRef,
        params: Params,
    ) -> Result<TaskId> {
        let mark = self
            .task
            .current_mark()
            .ok_or(EngineError::NoAwaitedStage(self.task.id))?;
        let link = ParentLink {
            task_id: self.task.id,
            stage: mark,
        };
        self.manager
            .spawn_task(task_type, target, self.task.owner.clone(), params, Some(link))
            .await
    }

    /// Fetch any entity fresh from the entity store.
    pub async fn fetch_entity(&self, target: &TargetRef) -> Result<EntityHandle> {
        self.manager.entities().fetch(target).await
    }

    pub fn audit(&self, action: &str, success: bool, note: impl Into<String>) {
        self.manager.auditor().record(AuditEvent {
            task_id: self.task.id,
            task_type: self.task.task_type.clone(),
            target: self.task.target.clone(),
            owner: self.task.owner.clone(),
            action: action.to_string(),
            success,
            note: note.into(),
        });
    }
}
