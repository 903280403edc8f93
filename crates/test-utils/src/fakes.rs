//! Test doubles: a stub target entity, a recording auditor and small task
//! types whose handlers journal every invocation.

use std::any::Any;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::bail;
use serde_json::{Value, json};

use stagehand::audit::{AuditEvent, Auditor};
use stagehand::config::PoolConfig;
use stagehand::engine::{EngineOptions, TaskManager, TaskRegistry};
use stagehand::entity::{EntityHandle, MemoryEntityStore, TargetEntity};
use stagehand::errors::{EngineError, Result};
use stagehand::store::{MemoryTaskStore, TaskStore};
use stagehand::task::{HandlerFuture, Params, StageTable, TaskContext, TaskLogic};
use stagehand::types::{BoxFuture, Credential, TargetRef, TaskId};

pub const STUB_KIND: &str = "stub";

/// Target entity that remembers every status written to it.
pub struct StubEntity {
    id: String,
    name: Option<String>,
    history: Mutex<Vec<(String, String)>>,
}

impl StubEntity {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            name: None,
            history: Mutex::new(vec![("created".to_string(), String::new())]),
        }
    }

    pub fn named(id: &str, name: &str) -> Self {
        Self {
            name: Some(name.to_string()),
            ..Self::new(id)
        }
    }

    pub fn target(&self) -> TargetRef {
        TargetRef::new(STUB_KIND, &self.id)
    }

    /// `(status, reason)` pairs in write order.
    pub fn history(&self) -> Vec<(String, String)> {
        self.history.lock().unwrap().clone()
    }

    pub fn last_reason(&self) -> String {
        self.history().last().map(|(_, r)| r.clone()).unwrap_or_default()
    }
}

impl TargetEntity for StubEntity {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> &str {
        STUB_KIND
    }

    fn name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }

    fn status(&self) -> String {
        self.history().last().map(|(s, _)| s.clone()).unwrap_or_default()
    }

    fn set_status<'a>(
        &'a self,
        _owner: &'a Credential,
        status: &'a str,
        reason: &'a str,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.history
                .lock()
                .unwrap()
                .push((status.to_string(), reason.to_string()));
            Ok(())
        })
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Auditor that keeps every event in memory.
#[derive(Default)]
pub struct RecordingAuditor {
    events: Mutex<Vec<AuditEvent>>,
}

impl RecordingAuditor {
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn actions(&self) -> Vec<(String, bool)> {
        self.events()
            .into_iter()
            .map(|e| (e.action, e.success))
            .collect()
    }
}

impl Auditor for RecordingAuditor {
    fn record(&self, event: AuditEvent) {
        self.events.lock().unwrap().push(event);
    }
}

/// Shared log of `(handler, data)` invocations.
#[derive(Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<(String, Value)>>>);

impl Journal {
    pub fn push(&self, handler: &str, data: &Value) {
        self.0.lock().unwrap().push((handler.to_string(), data.clone()));
    }

    pub fn entries(&self) -> Vec<(String, Value)> {
        self.0.lock().unwrap().clone()
    }

    pub fn handlers(&self) -> Vec<String> {
        self.entries().into_iter().map(|(h, _)| h).collect()
    }

    pub fn count(&self, handler: &str) -> usize {
        self.entries().iter().filter(|(h, _)| h == handler).count()
    }
}

/// Multi-purpose task type. `mode` in the creation params picks what
/// `on_init` does:
///
/// - absent: move to `Foo`
/// - `"baz"`: move to `Baz` (no failure handler)
/// - `"children"`: move to `Bar` and spawn `children` [`ChildTask`]s; indices
///   listed in `failing` fail, `child_delay_ms` slows them down
/// - `"unknown_stage"`: move to a stage that was never declared
///   (`child_delays` sets a per-index delay instead)
/// - `"await_bar"`: move to `Bar` and wait for whatever reports to it
/// - `"local"`: move to `Foo` and run local work that fails when
///   `local_fail` is set
/// - `"idle"`: return without a transition
/// - `"panic"`: panic
///
/// `OnFooComplete` reacts to its data: `"panic"`, `"error"`, `"stall"`,
/// `"again"` (re-enter `Foo`), `{"progress": n}` (record progress and stay);
/// anything else completes the task with it.
pub struct ScriptedTask {
    pub journal: Journal,
}

impl ScriptedTask {
    fn on_foo_complete<'a>(
        &'a self,
        ctx: &'a mut TaskContext,
        _target: EntityHandle,
        data: Value,
    ) -> HandlerFuture<'a> {
        Box::pin(async move {
            self.journal.push("OnFooComplete", &data);
            if let Some(percent) = data.get("progress").and_then(Value::as_f64) {
                return ctx.set_progress(percent as f32).await;
            }
            match data.as_str() {
                Some("panic") => panic!("scripted handler blew up"),
                Some("error") => Err(EngineError::operation("scripted", "boom")),
                Some("stall") => Ok(()),
                Some("again") => ctx.set_stage("Foo", Params::new().with("again", true)).await,
                _ => ctx.set_stage_complete(Params::from_value(data)).await,
            }
        })
    }

    fn on_foo_failed<'a>(
        &'a self,
        ctx: &'a mut TaskContext,
        _target: EntityHandle,
        data: Value,
    ) -> HandlerFuture<'a> {
        Box::pin(async move {
            self.journal.push("OnFooCompleteFailed", &data);
            ctx.set_stage_failed(data).await
        })
    }

    fn on_bar_complete<'a>(
        &'a self,
        ctx: &'a mut TaskContext,
        _target: EntityHandle,
        data: Value,
    ) -> HandlerFuture<'a> {
        Box::pin(async move {
            self.journal.push("OnBarComplete", &data);
            ctx.set_stage_complete(Params::from_value(data)).await
        })
    }

    fn on_bar_failed<'a>(
        &'a self,
        ctx: &'a mut TaskContext,
        _target: EntityHandle,
        data: Value,
    ) -> HandlerFuture<'a> {
        Box::pin(async move {
            self.journal.push("OnBarCompleteFailed", &data);
            ctx.set_stage_failed(data).await
        })
    }

    fn on_baz_complete<'a>(
        &'a self,
        ctx: &'a mut TaskContext,
        _target: EntityHandle,
        data: Value,
    ) -> HandlerFuture<'a> {
        Box::pin(async move {
            self.journal.push("OnBazComplete", &data);
            ctx.set_stage_complete(Params::new()).await
        })
    }
}

impl TaskLogic for ScriptedTask {
    const NAME: &'static str = "ScriptedTask";

    fn on_init<'a>(
        &'a self,
        ctx: &'a mut TaskContext,
        _target: EntityHandle,
        body: Value,
    ) -> HandlerFuture<'a> {
        Box::pin(async move {
            self.journal.push("OnInitComplete", &body);
            let mode = ctx
                .params()
                .get("mode")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string();

            match mode.as_str() {
                "baz" => ctx.set_stage("Baz", Params::new()).await,
                "unknown_stage" => ctx.set_stage("Nope", Params::new()).await,
                "await_bar" => ctx.set_stage("Bar", Params::new()).await,
                "local" => {
                    let fail = ctx.params().flag("local_fail");
                    ctx.set_stage("Foo", Params::new()).await?;
                    ctx.local_task_run("local_work", move || {
                        if fail {
                            bail!("local work failed");
                        }
                        Ok(json!("local ok"))
                    })
                }
                "idle" => Ok(()),
                "panic" => panic!("scripted init blew up"),
                "children" => {
                    let count = ctx.params().get_as::<usize>("children")?.unwrap_or(2);
                    let failing: Vec<usize> = ctx.params().get_as("failing")?.unwrap_or_default();
                    let delay = ctx.params().get("child_delay_ms").cloned();
                    let delays: Vec<u64> = ctx.params().get_as("child_delays")?.unwrap_or_default();
                    ctx.set_stage("Bar", Params::new()).await?;
                    for n in 0..count {
                        let mut params = Params::new()
                            .with("n", n)
                            .with("fail", failing.contains(&n));
                        if let Some(delay) = &delay {
                            params.insert("delay_ms", delay.clone());
                        }
                        if let Some(delay) = delays.get(n) {
                            params.insert("delay_ms", *delay);
                        }
                        ctx.new_subtask(ChildTask::NAME, ctx.target().clone(), params)
                            .await?;
                    }
                    Ok(())
                }
                _ => ctx.set_stage("Foo", Params::new().with("foo", 1)).await,
            }
        })
    }

    fn stages(&self) -> StageTable<Self> {
        StageTable::new()
            .stage_with_failure("Foo", Self::on_foo_complete, Self::on_foo_failed)
            .stage_with_failure("Bar", Self::on_bar_complete, Self::on_bar_failed)
            .stage("Baz", Self::on_baz_complete)
    }
}

/// Child that runs one simulated operation in stage `Work`.
///
/// Params: `n` (echoed back), `fail` (operation fails), `delay_ms`.
pub struct ChildTask {
    pub journal: Journal,
}

impl ChildTask {
    fn on_work_complete<'a>(
        &'a self,
        ctx: &'a mut TaskContext,
        _target: EntityHandle,
        data: Value,
    ) -> HandlerFuture<'a> {
        Box::pin(async move {
            self.journal.push("Child.OnWorkComplete", &data);
            ctx.set_stage_complete(Params::from_value(data)).await
        })
    }
}

impl TaskLogic for ChildTask {
    const NAME: &'static str = "ChildTask";

    fn on_init<'a>(
        &'a self,
        ctx: &'a mut TaskContext,
        _target: EntityHandle,
        body: Value,
    ) -> HandlerFuture<'a> {
        Box::pin(async move {
            self.journal.push("Child.OnInitComplete", &body);
            let n = ctx.params().get_as::<u64>("n")?.unwrap_or(0);
            let fail = ctx.params().flag("fail");
            let delay = ctx.params().get_as::<u64>("delay_ms")?.unwrap_or(5);

            ctx.set_stage("Work", Params::new()).await?;
            ctx.run_operation("child_work", async move {
                tokio::time::sleep(Duration::from_millis(delay)).await;
                if fail {
                    bail!("child {n} failed");
                }
                Ok(json!({ "child": n }))
            })
        })
    }

    fn stages(&self) -> StageTable<Self> {
        StageTable::new().stage("Work", Self::on_work_complete)
    }
}

/// Multi-object task: marks every target `swept` in target order and
/// completes with the default data. With `fail` set, its handler errors after
/// the sweep.
pub struct SweepTask {
    pub journal: Journal,
}

impl TaskLogic for SweepTask {
    const NAME: &'static str = "SweepTask";

    fn on_init<'a>(
        &'a self,
        ctx: &'a mut TaskContext,
        _target: EntityHandle,
        _body: Value,
    ) -> HandlerFuture<'a> {
        Box::pin(async move {
            let ids: Vec<String> = ctx.targets().iter().map(|t| t.id().to_string()).collect();
            self.journal.push("Sweep.OnInitComplete", &json!(ids));
            for entity in ctx.targets() {
                entity.set_status(ctx.owner(), "swept", "").await?;
            }
            if ctx.params().flag("fail") {
                return Err(EngineError::operation("sweep", "boom"));
            }
            ctx.set_stage_complete(Params::new()).await
        })
    }

    fn stages(&self) -> StageTable<Self> {
        StageTable::new()
    }
}

/// A manager over in-memory stores with [`ScriptedTask`], [`ChildTask`] and
/// [`SweepTask`] registered on the `default` pool.
pub struct Harness {
    pub manager: TaskManager,
    pub store: Arc<dyn TaskStore>,
    pub entities: Arc<MemoryEntityStore>,
    pub auditor: Arc<RecordingAuditor>,
    pub journal: Journal,
    pub target: Arc<StubEntity>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_pool(PoolConfig::default())
    }

    pub fn with_pool(pool: PoolConfig) -> Self {
        Self::start(
            Arc::new(MemoryTaskStore::new()),
            pool,
            EngineOptions::default(),
        )
    }

    /// Build a manager over `store`. Must run inside a Tokio runtime.
    pub fn start(store: Arc<dyn TaskStore>, pool: PoolConfig, options: EngineOptions) -> Self {
        let journal = Journal::default();
        let mut registry = TaskRegistry::new().with_pool("default", pool);
        registry
            .register(ScriptedTask {
                journal: journal.clone(),
            })
            .unwrap();
        registry
            .register(ChildTask {
                journal: journal.clone(),
            })
            .unwrap();
        registry
            .register(SweepTask {
                journal: journal.clone(),
            })
            .unwrap();

        let entities = Arc::new(MemoryEntityStore::new());
        let target = Arc::new(StubEntity::new("stub-target"));
        entities.insert(target.clone());

        let auditor = Arc::new(RecordingAuditor::default());
        let manager = TaskManager::builder(registry, store.clone(), entities.clone())
            .auditor(auditor.clone())
            .options(options)
            .build();

        Self {
            manager,
            store,
            entities,
            auditor,
            journal,
            target,
        }
    }

    /// Insert another stub target.
    pub fn add_stub(&self, stub: StubEntity) -> Arc<StubEntity> {
        let stub = Arc::new(stub);
        self.entities.insert(stub.clone());
        stub
    }

    pub fn owner() -> Credential {
        Credential::new("tester", "tests")
    }

    /// Create a [`ScriptedTask`] on the stub target.
    pub async fn create_scripted(&self, params: Params) -> Result<TaskId> {
        self.manager
            .create(
                ScriptedTask::NAME,
                self.target.target(),
                Self::owner(),
                params,
                None,
            )
            .await
    }

    /// Wait until `id` awaits `stage`.
    pub async fn wait_for_stage(&self, id: TaskId, stage: &str) -> Result<()> {
        stagehand::engine::poll_until(
            &format!("task {id} to reach {stage}"),
            Duration::from_millis(5),
            crate::WAIT,
            || async move {
                let task = self.manager.get(id).await?;
                Ok((task.stage.as_deref() == Some(stage)).then_some(()))
            },
        )
        .await
    }
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}
