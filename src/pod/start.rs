// src/pod/start.rs

//! Pod start: dependency-ordered container waves driven by child tasks.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::dag::DependencyBatchGraph;
use crate::entity::{EntityHandle, TargetEntity, downcast};
use crate::errors::{EngineError, Result};
use crate::pod::driver::ContainerDriver;
use crate::pod::{CONTAINER_KIND, Container, Pod, status};
use crate::task::{HandlerFuture, Params, StageTable, TaskContext, TaskLogic};
use crate::types::TargetRef;

pub const START_CONTAINERS: &str = "StartContainers";
pub const START_CONTAINER: &str = "StartContainer";

/// Typed view of the pod start params.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StartParams {
    /// Remaining start order; absent before the first wave.
    #[serde(default)]
    pub graph: Option<DependencyBatchGraph>,
    /// Waves dispatched so far.
    #[serde(default)]
    pub wave: u32,
}

/// Text form of a failure payload.
pub(crate) fn reason_text(data: &Value) -> String {
    match data {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

pub struct PodStartTask;

impl PodStartTask {
    /// Dispatch the next wave, or finish once the graph is exhausted.
    async fn start_next_wave(
        &self,
        ctx: &mut TaskContext,
        pod: &Pod,
        mut graph: DependencyBatchGraph,
        wave: u32,
    ) -> Result<()> {
        let Some(batch) = graph.next_batch(|id| pod.container(id).cloned())? else {
            pod.set_status(ctx.owner(), status::RUNNING, "").await?;
            ctx.audit(
                "pod.start",
                true,
                format!("{} containers in {wave} waves", pod.containers().len()),
            );
            let data = Params::new().with("pod", pod.id()).with("waves", wave);
            return ctx.set_stage_complete(data).await;
        };

        let wave = wave + 1;
        let names: Vec<&str> = batch.iter().map(|c| c.name.as_str()).collect();
        info!(pod = %pod.name(), wave, containers = ?names, "starting container wave");

        let params = Params::from_typed(&StartParams {
            graph: Some(graph),
            wave,
        })?;
        ctx.set_stage(START_CONTAINERS, params).await?;

        for spec in &batch {
            ctx.new_subtask(
                ContainerStartTask::NAME,
                TargetRef::new(CONTAINER_KIND, &spec.id),
                Params::new(),
            )
            .await?;
        }
        Ok(())
    }

    fn on_start_containers_complete<'a>(
        &'a self,
        ctx: &'a mut TaskContext,
        target: EntityHandle,
        _data: Value,
    ) -> HandlerFuture<'a> {
        Box::pin(async move {
            let pod = downcast::<Pod>(&target)?;
            let params: StartParams = ctx.params_as()?;
            let graph = params.graph.ok_or_else(|| {
                EngineError::Config("pod start params carry no dependency graph".to_string())
            })?;
            self.start_next_wave(ctx, pod, graph, params.wave).await
        })
    }

    fn on_start_containers_failed<'a>(
        &'a self,
        ctx: &'a mut TaskContext,
        target: EntityHandle,
        data: Value,
    ) -> HandlerFuture<'a> {
        Box::pin(async move {
            let pod = downcast::<Pod>(&target)?;
            let reason = reason_text(&data);
            pod.set_status(ctx.owner(), status::START_FAILED, &reason).await?;
            ctx.audit("pod.start", false, reason);
            ctx.set_stage_failed(data).await
        })
    }
}

impl TaskLogic for PodStartTask {
    const NAME: &'static str = "PodStartTask";

    fn on_init<'a>(
        &'a self,
        ctx: &'a mut TaskContext,
        target: EntityHandle,
        _body: Value,
    ) -> HandlerFuture<'a> {
        Box::pin(async move {
            let pod = downcast::<Pod>(&target)?;
            pod.set_status(ctx.owner(), status::STARTING, "").await?;

            let graph = match DependencyBatchGraph::new(
                pod.containers(),
                |c| c.id.clone(),
                |c| c.name.clone(),
                |c| c.depends_on.clone(),
            ) {
                Ok(graph) => graph,
                Err(e) => {
                    let reason = e.to_string();
                    pod.set_status(ctx.owner(), status::START_FAILED, &reason).await?;
                    ctx.audit("pod.start", false, reason.clone());
                    return ctx.set_stage_failed(reason).await;
                }
            };

            self.start_next_wave(ctx, pod, graph, 0).await
        })
    }

    fn stages(&self) -> StageTable<Self> {
        StageTable::new().stage_with_failure(
            START_CONTAINERS,
            Self::on_start_containers_complete,
            Self::on_start_containers_failed,
        )
    }
}

pub struct ContainerStartTask {
    driver: Arc<dyn ContainerDriver>,
}

impl ContainerStartTask {
    pub fn new(driver: Arc<dyn ContainerDriver>) -> Self {
        Self { driver }
    }

    fn on_start_container_complete<'a>(
        &'a self,
        ctx: &'a mut TaskContext,
        target: EntityHandle,
        data: Value,
    ) -> HandlerFuture<'a> {
        Box::pin(async move {
            let container = downcast::<Container>(&target)?;
            container.set_status(ctx.owner(), status::RUNNING, "").await?;
            ctx.audit("container.start", true, container.spec().image.clone());
            ctx.set_stage_complete(Params::from_value(data)).await
        })
    }

    fn on_start_container_failed<'a>(
        &'a self,
        ctx: &'a mut TaskContext,
        target: EntityHandle,
        data: Value,
    ) -> HandlerFuture<'a> {
        Box::pin(async move {
            let container = downcast::<Container>(&target)?;
            let reason = reason_text(&data);
            container
                .set_status(ctx.owner(), status::START_FAILED, &reason)
                .await?;
            ctx.audit("container.start", false, reason);
            ctx.set_stage_failed(data).await
        })
    }
}

impl TaskLogic for ContainerStartTask {
    const NAME: &'static str = "ContainerStartTask";

    fn on_init<'a>(
        &'a self,
        ctx: &'a mut TaskContext,
        target: EntityHandle,
        _body: Value,
    ) -> HandlerFuture<'a> {
        Box::pin(async move {
            let container = downcast::<Container>(&target)?;
            container.set_status(ctx.owner(), status::STARTING, "").await?;
            ctx.set_stage(START_CONTAINER, Params::new()).await?;

            let spec = container.spec();
            let op = self
                .driver
                .start_container(container.pod_id(), &spec.name, &spec.image);
            ctx.run_operation("start_container", op)
        })
    }

    fn stages(&self) -> StageTable<Self> {
        StageTable::new().stage_with_failure(
            START_CONTAINER,
            Self::on_start_container_complete,
            Self::on_start_container_failed,
        )
    }
}
