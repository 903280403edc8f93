// src/pod/delete.rs

//! Pod delete: stop containers locally, release the address (best-effort),
//! then wait for the release to settle unless purging.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{info, warn};

use crate::engine::poll_until;
use crate::entity::{EntityHandle, TargetEntity, downcast};
use crate::errors::{EngineError, Result};
use crate::pod::driver::ContainerDriver;
use crate::pod::start::reason_text;
use crate::pod::{CONTAINER_KIND, Pod, status};
use crate::task::{HandlerFuture, Params, StageTable, TaskContext, TaskLogic};
use crate::types::TargetRef;

pub const STOP_CONTAINERS: &str = "StopContainers";
pub const RELEASE_ADDRESS: &str = "ReleaseAddress";
pub const WAIT_RELEASED: &str = "WaitAddressReleased";

/// Typed view of the pod delete params.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteParams {
    /// Skip waiting for the address release to settle.
    #[serde(default)]
    pub purge: bool,
    #[serde(default = "default_release_timeout_ms")]
    pub release_timeout_ms: u64,
    #[serde(default = "default_release_poll_ms")]
    pub release_poll_ms: u64,
    /// Set when the best-effort release failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release_error: Option<String>,
}

fn default_release_timeout_ms() -> u64 {
    30_000
}

fn default_release_poll_ms() -> u64 {
    50
}

impl Default for DeleteParams {
    fn default() -> Self {
        Self {
            purge: false,
            release_timeout_ms: default_release_timeout_ms(),
            release_poll_ms: default_release_poll_ms(),
            release_error: None,
        }
    }
}

pub struct PodDeleteTask {
    driver: Arc<dyn ContainerDriver>,
}

impl PodDeleteTask {
    pub fn new(driver: Arc<dyn ContainerDriver>) -> Self {
        Self { driver }
    }

    async fn set_container_status(&self, ctx: &TaskContext, pod: &Pod, status: &str) -> Result<()> {
        for spec in pod.containers() {
            let container = ctx
                .fetch_entity(&TargetRef::new(CONTAINER_KIND, &spec.id))
                .await?;
            container.set_status(ctx.owner(), status, "").await?;
        }
        Ok(())
    }

    async fn finish(&self, ctx: &mut TaskContext, pod: &Pod) -> Result<()> {
        pod.set_status(ctx.owner(), status::DELETED, "").await?;
        ctx.audit("pod.delete", true, pod.name().to_string());
        ctx.set_stage_complete(Params::new()).await
    }

    async fn abort(&self, ctx: &mut TaskContext, pod: &Pod, data: Value) -> Result<()> {
        let reason = reason_text(&data);
        pod.set_status(ctx.owner(), status::DELETE_FAILED, &reason).await?;
        ctx.audit("pod.delete", false, reason);
        ctx.set_stage_failed(data).await
    }

    fn on_stop_containers_complete<'a>(
        &'a self,
        ctx: &'a mut TaskContext,
        target: EntityHandle,
        _data: Value,
    ) -> HandlerFuture<'a> {
        Box::pin(async move {
            let pod = downcast::<Pod>(&target)?;
            self.set_container_status(ctx, pod, status::EXITED).await?;

            ctx.set_stage(RELEASE_ADDRESS, Params::new()).await?;
            let op = self.driver.release_address(pod.id());
            ctx.run_operation("release_address", op)
        })
    }

    fn on_stop_containers_failed<'a>(
        &'a self,
        ctx: &'a mut TaskContext,
        target: EntityHandle,
        data: Value,
    ) -> HandlerFuture<'a> {
        Box::pin(async move {
            let pod = downcast::<Pod>(&target)?;
            self.abort(ctx, pod, data).await
        })
    }

    fn on_release_address_complete<'a>(
        &'a self,
        ctx: &'a mut TaskContext,
        target: EntityHandle,
        _data: Value,
    ) -> HandlerFuture<'a> {
        Box::pin(async move {
            let pod = downcast::<Pod>(&target)?;
            let params: DeleteParams = ctx.params_as()?;
            if params.purge {
                info!(pod = %pod.name(), "purge requested; not waiting for address release");
                return self.finish(ctx, pod).await;
            }

            ctx.set_stage(WAIT_RELEASED, Params::new()).await?;

            let driver = self.driver.clone();
            let pod_id = pod.id().to_string();
            let interval = Duration::from_millis(params.release_poll_ms);
            let timeout = Duration::from_millis(params.release_timeout_ms);
            ctx.run_operation("wait_address_released", async move {
                let what = format!("address of pod {pod_id} to be released");
                poll_until(&what, interval, timeout, || {
                    let pending = driver.address_released(&pod_id);
                    async move {
                        let released = pending.await.map_err(|e| {
                            EngineError::operation("address_released", format!("{e:#}"))
                        })?;
                        Ok(released.then_some(()))
                    }
                })
                .await?;
                Ok::<_, anyhow::Error>(json!({ "released": pod_id }))
            })
        })
    }

    /// Release is best-effort: note the error and finish anyway.
    fn on_release_address_failed<'a>(
        &'a self,
        ctx: &'a mut TaskContext,
        target: EntityHandle,
        data: Value,
    ) -> HandlerFuture<'a> {
        Box::pin(async move {
            let pod = downcast::<Pod>(&target)?;
            let reason = reason_text(&data);
            warn!(pod = %pod.name(), %reason, "address release failed; continuing");
            ctx.audit("pod.release_address", false, reason.clone());
            ctx.save_params(Params::new().with("release_error", reason))
                .await?;
            self.finish(ctx, pod).await
        })
    }

    fn on_wait_released_complete<'a>(
        &'a self,
        ctx: &'a mut TaskContext,
        target: EntityHandle,
        _data: Value,
    ) -> HandlerFuture<'a> {
        Box::pin(async move {
            let pod = downcast::<Pod>(&target)?;
            self.finish(ctx, pod).await
        })
    }

    fn on_wait_released_failed<'a>(
        &'a self,
        ctx: &'a mut TaskContext,
        target: EntityHandle,
        data: Value,
    ) -> HandlerFuture<'a> {
        Box::pin(async move {
            let pod = downcast::<Pod>(&target)?;
            self.abort(ctx, pod, data).await
        })
    }
}

impl TaskLogic for PodDeleteTask {
    const NAME: &'static str = "PodDeleteTask";

    fn on_init<'a>(
        &'a self,
        ctx: &'a mut TaskContext,
        target: EntityHandle,
        _body: Value,
    ) -> HandlerFuture<'a> {
        Box::pin(async move {
            let pod = downcast::<Pod>(&target)?;
            pod.set_status(ctx.owner(), status::DELETING, "").await?;
            self.set_container_status(ctx, pod, status::STOPPING).await?;

            ctx.set_stage(STOP_CONTAINERS, Params::new()).await?;

            let driver = self.driver.clone();
            let ids: Vec<String> = pod.containers().iter().map(|c| c.id.clone()).collect();
            ctx.local_task_run("stop_containers", move || {
                for id in &ids {
                    driver.stop_container(id)?;
                }
                Ok(json!({ "stopped": ids }))
            })
        })
    }

    fn stages(&self) -> StageTable<Self> {
        StageTable::new()
            .stage_with_failure(
                STOP_CONTAINERS,
                Self::on_stop_containers_complete,
                Self::on_stop_containers_failed,
            )
            .stage_with_failure(
                RELEASE_ADDRESS,
                Self::on_release_address_complete,
                Self::on_release_address_failed,
            )
            .stage_with_failure(
                WAIT_RELEASED,
                Self::on_wait_released_complete,
                Self::on_wait_released_failed,
            )
    }
}
