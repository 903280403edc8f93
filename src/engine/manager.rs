// src/engine/manager.rs

//! Task creation and stage dispatch.
//!
//! Every signal becomes a dispatch job on the task type's worker pool. A job
//! takes the per-task lock, reloads the instance, drops the signal if the task
//! is terminal or has moved past the stage the signal was meant for, then
//! re-fetches the target entities and runs the resolved handler.
//!
//! Handlers run inside their own Tokio task so a panic is contained: the task
//! is failed and its target is marked `unknown`, like a handler error.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, error, info, warn};

use crate::audit::{Auditor, TracingAuditor};
use crate::config::model::EngineConfig;
use crate::engine::poll::poll_until;
use crate::engine::pool::{Job, WorkerPool};
use crate::engine::registry::TaskRegistry;
use crate::entity::{EntityHandle, EntityStore, STATUS_UNKNOWN, target_of};
use crate::errors::{EngineError, Result};
use crate::store::{SubtaskRecord, SubtaskResult, TaskStore};
use crate::task::context::TaskContext;
use crate::task::instance::{ParentLink, StageMark, TaskInstance};
use crate::task::params::Params;
use crate::task::stage::handler_name;
use crate::types::{Credential, Outcome, RestartPolicy, TargetRef, TaskId};

/// Reason delivered to tasks found running at startup.
pub const RESTART_REASON: &str = "service restart";

/// What happened to an external signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalDisposition {
    /// Queued for dispatch.
    Queued,
    /// The task is already terminal; nothing was queued.
    Ignored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineOptions {
    pub restart_policy: RestartPolicy,
    pub stall_timeout: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            restart_policy: RestartPolicy::Fail,
            stall_timeout: Duration::from_secs(600),
        }
    }
}

impl From<&EngineConfig> for EngineOptions {
    fn from(cfg: &EngineConfig) -> Self {
        Self {
            restart_policy: cfg.on_restart,
            stall_timeout: cfg.stall_timeout,
        }
    }
}

struct Shared {
    registry: TaskRegistry,
    pools: HashMap<String, WorkerPool>,
    store: Arc<dyn TaskStore>,
    entities: Arc<dyn EntityStore>,
    auditor: Arc<dyn Auditor>,
    options: EngineOptions,
    locks: Mutex<HashMap<TaskId, Arc<AsyncMutex<()>>>>,
}

/// Entry point for creating and driving tasks. Cheap to clone.
#[derive(Clone)]
pub struct TaskManager {
    shared: Arc<Shared>,
}

pub struct TaskManagerBuilder {
    registry: TaskRegistry,
    store: Arc<dyn TaskStore>,
    entities: Arc<dyn EntityStore>,
    auditor: Arc<dyn Auditor>,
    options: EngineOptions,
}

impl TaskManagerBuilder {
    pub fn auditor(mut self, auditor: Arc<dyn Auditor>) -> Self {
        self.auditor = auditor;
        self
    }

    pub fn options(mut self, options: EngineOptions) -> Self {
        self.options = options;
        self
    }

    /// Spawn one worker pool per pool definition of the registry.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn build(self) -> TaskManager {
        let pools = self
            .registry
            .pools()
            .map(|(name, cfg)| (name.to_string(), WorkerPool::spawn(name, cfg)))
            .collect();

        TaskManager {
            shared: Arc::new(Shared {
                registry: self.registry,
                pools,
                store: self.store,
                entities: self.entities,
                auditor: self.auditor,
                options: self.options,
                locks: Mutex::new(HashMap::new()),
            }),
        }
    }
}

impl TaskManager {
    pub fn builder(
        registry: TaskRegistry,
        store: Arc<dyn TaskStore>,
        entities: Arc<dyn EntityStore>,
    ) -> TaskManagerBuilder {
        TaskManagerBuilder {
            registry,
            store,
            entities,
            auditor: Arc::new(TracingAuditor),
            options: EngineOptions::default(),
        }
    }

    /// Manager with default options and the tracing auditor.
    pub fn new(
        registry: TaskRegistry,
        store: Arc<dyn TaskStore>,
        entities: Arc<dyn EntityStore>,
    ) -> Self {
        Self::builder(registry, store, entities).build()
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.shared.registry
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.shared.store
    }

    pub fn entities(&self) -> &Arc<dyn EntityStore> {
        &self.shared.entities
    }

    pub fn auditor(&self) -> &Arc<dyn Auditor> {
        &self.shared.auditor
    }

    pub fn options(&self) -> EngineOptions {
        self.shared.options
    }

    pub fn pool(&self, name: &str) -> Result<&WorkerPool> {
        self.shared
            .pools
            .get(name)
            .ok_or_else(|| EngineError::Config(format!("unknown worker pool '{name}'")))
    }

    pub(crate) fn pool_for_type(&self, task_type: &str) -> Result<&WorkerPool> {
        let registered = self.shared.registry.get(task_type)?;
        self.pool(&registered.pool)
    }

    /// Current persisted state of a task.
    pub async fn get(&self, id: TaskId) -> Result<TaskInstance> {
        self.shared
            .store
            .load(id)
            .await?
            .ok_or(EngineError::TaskNotFound(id))
    }

    /// Create a task in stage `init` and queue its `on_init` handler.
    ///
    /// With `parent`, the new task reports its terminal outcome to the stage
    /// that parent currently awaits. Unknown types, a parent awaiting nothing
    /// or a full pool fail here, before anything is persisted.
    pub async fn create(
        &self,
        task_type: &str,
        target: TargetRef,
        owner: Credential,
        params: Params,
        parent: Option<TaskId>,
    ) -> Result<TaskId> {
        let link = match parent {
            Some(parent_id) => Some(self.link_to(parent_id).await?),
            None => None,
        };
        self.spawn_task(task_type, target, owner, params, link).await
    }

    /// Create a multi-object task over `targets`.
    ///
    /// Targets are sorted and deduplicated; the first becomes the primary
    /// target handed to every handler, and all of them are re-fetched in that
    /// order before each stage and exposed through [`TaskContext::targets`].
    pub async fn create_parallel(
        &self,
        task_type: &str,
        targets: Vec<TargetRef>,
        owner: Credential,
        params: Params,
        parent: Option<TaskId>,
    ) -> Result<TaskId> {
        let Some(first) = targets.first().cloned() else {
            return Err(EngineError::Config(format!(
                "{task_type}: a parallel task needs at least one target"
            )));
        };
        let link = match parent {
            Some(parent_id) => Some(self.link_to(parent_id).await?),
            None => None,
        };
        let task = TaskInstance::new(task_type, first, owner, params, link).with_targets(targets);
        self.launch(task).await
    }

    async fn link_to(&self, parent_id: TaskId) -> Result<ParentLink> {
        let parent = self.get(parent_id).await?;
        let stage = parent
            .current_mark()
            .ok_or(EngineError::NoAwaitedStage(parent_id))?;
        Ok(ParentLink {
            task_id: parent_id,
            stage,
        })
    }

    pub(crate) async fn spawn_task(
        &self,
        task_type: &str,
        target: TargetRef,
        owner: Credential,
        params: Params,
        parent: Option<ParentLink>,
    ) -> Result<TaskId> {
        self.launch(TaskInstance::new(task_type, target, owner, params, parent))
            .await
    }

    /// Persist a fresh task (and its subtask record) and queue `on_init`.
    async fn launch(&self, task: TaskInstance) -> Result<TaskId> {
        let pool = self.pool_for_type(&task.task_type)?;
        let permit = pool.try_reserve()?;

        let body = task.params.clone().into_value();
        self.shared.store.insert(&task).await?;
        if let Some(link) = &task.parent {
            self.shared
                .store
                .insert_subtask(&SubtaskRecord::new(link, task.id))
                .await?;
        }

        info!(
            task_id = %task.id,
            task_type = %task.task_type,
            target = %task.target,
            targets = task.targets.len(),
            owner = %task.owner,
            parent_id = ?task.parent_id(),
            pool = %pool.name(),
            "task created"
        );

        permit.send(self.dispatch_job(task.id, task.current_mark(), Outcome::Success, body));
        Ok(task.id)
    }

    /// Deliver an outcome for the stage the task currently awaits.
    ///
    /// Terminal tasks ignore signals. A task awaiting nothing is a protocol
    /// error. A stage without a handler is reported here and the queued
    /// dispatch fails the task.
    pub async fn signal(&self, id: TaskId, outcome: Outcome, data: Value) -> Result<SignalDisposition> {
        let task = self.get(id).await?;
        if task.is_terminal() {
            debug!(task_id = %id, status = ?task.status, ?outcome, "signal for finished task ignored");
            return Ok(SignalDisposition::Ignored);
        }
        let mark = task.current_mark().ok_or(EngineError::NoAwaitedStage(id))?;

        let registered = self.shared.registry.get(&task.task_type)?;
        let resolved = registered.prototype.resolve(&mark.name, outcome);
        let pool = self.pool(&registered.pool)?;

        debug!(
            task_id = %id,
            stage = %mark.name,
            ?outcome,
            "signal received"
        );
        pool.try_submit(self.dispatch_job(id, Some(mark), outcome, data))?;
        resolved?;
        Ok(SignalDisposition::Queued)
    }

    /// Queue an engine-internal signal. Waits for backlog space in a detached
    /// task so the caller never blocks on its own pool.
    pub(crate) fn deliver(
        &self,
        task_type: &str,
        id: TaskId,
        expected: Option<StageMark>,
        outcome: Outcome,
        data: Value,
    ) {
        let pool = match self.pool_for_type(task_type) {
            Ok(pool) => pool.clone(),
            Err(e) => {
                error!(task_id = %id, %task_type, error = %e, "cannot deliver signal");
                return;
            }
        };
        let job = self.dispatch_job(id, expected, outcome, data);
        tokio::spawn(async move {
            if let Err(e) = pool.submit(job).await {
                error!(task_id = %id, error = %e, "signal delivery failed");
            }
        });
    }

    fn dispatch_job(
        &self,
        id: TaskId,
        expected: Option<StageMark>,
        outcome: Outcome,
        data: Value,
    ) -> Job {
        let manager = self.clone();
        Box::pin(async move { manager.dispatch(id, expected, outcome, data).await })
    }

    fn task_lock(&self, id: TaskId) -> Arc<AsyncMutex<()>> {
        match self.shared.locks.lock() {
            Ok(mut locks) => locks.entry(id).or_default().clone(),
            // Poisoned map: fall back to an unshared lock.
            Err(_) => Arc::new(AsyncMutex::new(())),
        }
    }

    fn release_lock(&self, id: TaskId) {
        if let Ok(mut locks) = self.shared.locks.lock() {
            locks.remove(&id);
        }
    }

    async fn dispatch(&self, id: TaskId, expected: Option<StageMark>, outcome: Outcome, data: Value) {
        let lock = self.task_lock(id);
        let _guard = lock.lock().await;

        let task = match self.shared.store.load(id).await {
            Ok(Some(task)) => task,
            Ok(None) => {
                error!(task_id = %id, "signal for unknown task dropped");
                self.release_lock(id);
                return;
            }
            Err(e) => {
                error!(task_id = %id, error = %e, "failed to load task for dispatch");
                return;
            }
        };

        if task.is_terminal() {
            debug!(task_id = %id, status = ?task.status, "task already finished; signal dropped");
            self.release_lock(id);
            return;
        }
        let Some(mark) = task.current_mark() else {
            error!(task_id = %id, "{}", EngineError::NoAwaitedStage(id));
            return;
        };
        if let Some(expected) = &expected {
            if *expected != mark {
                debug!(
                    task_id = %id,
                    expected = %expected.name,
                    expected_seq = expected.seq,
                    stage = %mark.name,
                    seq = mark.seq,
                    "stale signal dropped"
                );
                return;
            }
        }

        let handler = handler_name(&mark.name, outcome);
        let prototype = match self.shared.registry.get(&task.task_type) {
            Ok(registered) => registered.prototype.clone(),
            Err(e) => {
                error!(task_id = %id, error = %e, "no prototype for task");
                self.fail_task(task, e.to_string()).await;
                return;
            }
        };
        if let Err(e) = prototype.resolve(&mark.name, outcome) {
            error!(task_id = %id, task_type = %task.task_type, %handler, error = %e, "stage handler missing");
            self.fail_task(task, e.to_string()).await;
            return;
        }

        let mut targets = Vec::new();
        for target in task.all_targets() {
            match self.shared.entities.fetch(&target).await {
                Ok(entity) => targets.push(entity),
                Err(e) => {
                    warn!(task_id = %id, %target, error = %e, "target fetch failed");
                    self.fail_task(task, e.to_string()).await;
                    return;
                }
            }
        }
        let Some(entity) = targets.first().cloned() else {
            return;
        };

        debug!(
            task_id = %id,
            task_type = %task.task_type,
            stage = %mark.name,
            %handler,
            "invoking stage handler"
        );

        let ctx = TaskContext::new(self.clone(), task).with_targets(targets.clone());
        let stage = mark.name.clone();
        let run = tokio::spawn(async move {
            let mut ctx = ctx;
            let result = prototype
                .invoke(&stage, outcome, &mut ctx, entity, data)
                .await;
            (ctx, result)
        });

        let terminal = match run.await {
            Ok((ctx, Ok(()))) => {
                if !ctx.transitioned() {
                    warn!(
                        task_id = %id,
                        stage = %mark.name,
                        %handler,
                        "handler returned without a stage transition; task will stall until supervised"
                    );
                }
                ctx.instance().is_terminal()
            }
            Ok((ctx, Err(e))) => {
                error!(task_id = %id, %handler, error = %e, "stage handler failed");
                self.contain_fault(ctx, &targets, e.to_string()).await
            }
            Err(join) => {
                let message = panic_message(join);
                error!(task_id = %id, %handler, panic = %message, "stage handler panicked");
                match self.get(id).await {
                    Ok(task) => {
                        let ctx = TaskContext::new(self.clone(), task);
                        self.contain_fault(ctx, &targets, message).await
                    }
                    Err(e) => {
                        error!(task_id = %id, error = %e, "cannot reload task after panic");
                        false
                    }
                }
            }
        };

        if terminal {
            self.release_lock(id);
        }
    }

    /// Mark the targets `unknown` and fail the task. Returns whether the task
    /// ended terminal.
    async fn contain_fault(&self, mut ctx: TaskContext, targets: &[EntityHandle], message: String) -> bool {
        for entity in targets {
            if let Err(e) = entity.set_status(ctx.owner(), STATUS_UNKNOWN, &message).await {
                warn!(task_id = %ctx.id(), target = %target_of(entity), error = %e, "failed to mark target unknown");
            }
        }
        if let Err(e) = ctx.set_stage_failed(message).await {
            error!(task_id = %ctx.id(), error = %e, "failed to persist task failure");
        }
        ctx.instance().is_terminal()
    }

    async fn fail_task(&self, task: TaskInstance, message: String) {
        let id = task.id;
        let mut ctx = TaskContext::new(self.clone(), task);
        if let Err(e) = ctx.set_stage_failed(message).await {
            error!(task_id = %id, error = %e, "failed to persist task failure");
        }
        self.release_lock(id);
    }

    /// Record a child's terminal outcome and, once every sibling spawned for
    /// the same parent stage is terminal, signal the parent.
    pub(crate) async fn child_finished(
        &self,
        child: &TaskInstance,
        outcome: Outcome,
        data: Value,
    ) -> Result<()> {
        let Some(link) = child.parent.clone() else {
            return Ok(());
        };

        // Serialize with the parent's handler and with finishing siblings.
        let lock = self.task_lock(link.task_id);
        let _guard = lock.lock().await;

        self.shared
            .store
            .save_subtask_result(link.task_id, child.id, SubtaskResult { outcome, data })
            .await?;

        let Some(mut parent) = self.shared.store.load(link.task_id).await? else {
            warn!(parent_id = %link.task_id, child_id = %child.id, "parent task vanished");
            self.release_lock(link.task_id);
            return Ok(());
        };
        if parent.is_terminal() {
            debug!(
                parent_id = %parent.id,
                child_id = %child.id,
                "parent already finished; child outcome recorded only"
            );
            self.release_lock(link.task_id);
            return Ok(());
        }
        if parent.current_mark().as_ref() != Some(&link.stage) {
            debug!(
                parent_id = %parent.id,
                child_id = %child.id,
                awaited = %link.stage.name,
                "parent moved on; child outcome recorded only"
            );
            return Ok(());
        }

        let siblings = self
            .shared
            .store
            .subtasks_of(link.task_id, &link.stage)
            .await?;
        let pending = siblings.iter().filter(|s| !s.is_finished()).count();
        if !siblings.is_empty() {
            let done = siblings.len() - pending;
            parent.progress = (done as f32 / siblings.len() as f32) * 100.0;
            self.shared.store.save(&parent).await?;
        }
        if pending > 0 {
            debug!(parent_id = %parent.id, pending, "waiting for sibling subtasks");
            return Ok(());
        }

        let (outcome, data) = aggregate_subtasks(&siblings);
        debug!(
            parent_id = %parent.id,
            stage = %link.stage.name,
            subtasks = siblings.len(),
            ?outcome,
            "all subtasks finished; signalling parent"
        );
        self.deliver(&parent.task_type, parent.id, Some(link.stage), outcome, data);
        Ok(())
    }

    /// Handle tasks left running by a previous process, per the restart
    /// policy. Returns how many tasks were signalled.
    pub async fn recover(&self) -> Result<usize> {
        let running = self.shared.store.list_running().await?;
        if running.is_empty() {
            return Ok(0);
        }
        if self.shared.options.restart_policy == RestartPolicy::Ignore {
            info!(count = running.len(), "leaving unfinished tasks to late signals");
            return Ok(0);
        }

        let mut signalled = 0;
        for task in running {
            if !self.shared.registry.contains(&task.task_type) {
                warn!(task_id = %task.id, task_type = %task.task_type, "unknown task type after restart");
                let reason = EngineError::UnknownTaskType(task.task_type.clone()).to_string();
                self.fail_task(task, reason).await;
                continue;
            }
            let Some(mark) = task.current_mark() else {
                continue;
            };
            info!(task_id = %task.id, stage = %mark.name, "failing task interrupted by restart");
            self.deliver(
                &task.task_type,
                task.id,
                Some(mark),
                Outcome::Failure,
                Value::String(RESTART_REASON.to_string()),
            );
            signalled += 1;
        }
        Ok(signalled)
    }

    /// Wait until a task is terminal and return its final state.
    pub async fn wait_for_terminal(&self, id: TaskId, timeout: Duration) -> Result<TaskInstance> {
        poll_until(
            &format!("task {id} to finish"),
            Duration::from_millis(10),
            timeout,
            || async move {
                let task = self.get(id).await?;
                Ok(task.is_terminal().then_some(task))
            },
        )
        .await
    }
}

/// Outcome and data reported to a parent for one stage's subtasks.
///
/// Any failure fails the stage with the failed children's reasons. A single
/// child reports its own data; several report a map of child id to data.
fn aggregate_subtasks(records: &[SubtaskRecord]) -> (Outcome, Value) {
    let results: Vec<(&SubtaskRecord, &SubtaskResult)> = records
        .iter()
        .filter_map(|r| r.result.as_ref().map(|res| (r, res)))
        .collect();

    let failed: Vec<&(&SubtaskRecord, &SubtaskResult)> = results
        .iter()
        .filter(|(_, res)| res.outcome == Outcome::Failure)
        .collect();

    if results.len() == 1 {
        let (_, res) = results[0];
        return (res.outcome, res.data.clone());
    }

    if !failed.is_empty() {
        let reasons: BTreeMap<String, Value> = failed
            .iter()
            .map(|(r, res)| (r.child_id.to_string(), res.data.clone()))
            .collect();
        return (Outcome::Failure, json!(reasons));
    }

    let data: BTreeMap<String, Value> = results
        .iter()
        .map(|(r, res)| (r.child_id.to_string(), res.data.clone()))
        .collect();
    (Outcome::Success, json!(data))
}

fn panic_message(join: tokio::task::JoinError) -> String {
    if !join.is_panic() {
        return join.to_string();
    }
    let payload = join.into_panic();
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("handler panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("handler panicked: {s}")
    } else {
        "handler panicked".to_string()
    }
}
