// src/pod/mod.rs

//! Pod lifecycle built on the task engine.
//!
//! A [`Pod`] owns [`Container`]s whose `depends_on` edges decide start order.
//! Three task types drive them:
//!
//! - [`PodStartTask`] starts containers wave by wave through child tasks.
//! - [`ContainerStartTask`] starts one container through the driver.
//! - [`PodDeleteTask`] stops containers, releases the pod address and waits
//!   for the release to settle.

pub mod delete;
pub mod driver;
pub mod start;

use std::any::Any;
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::config::model::ConfigFile;
use crate::engine::TaskRegistry;
use crate::entity::{MemoryEntityStore, TargetEntity};
use crate::errors::{EngineError, Result};
use crate::types::{BoxFuture, Credential, TargetRef};

pub use delete::{DeleteParams, PodDeleteTask};
pub use driver::{ContainerDriver, SimulatedDriver};
pub use start::{ContainerStartTask, PodStartTask, StartParams};

pub const POD_KIND: &str = "pod";
pub const CONTAINER_KIND: &str = "container";

pub mod status {
    pub const CREATED: &str = "created";
    pub const STARTING: &str = "starting";
    pub const RUNNING: &str = "running";
    pub const START_FAILED: &str = "start_failed";
    pub const STOPPING: &str = "stopping";
    pub const EXITED: &str = "exited";
    pub const DELETING: &str = "deleting";
    pub const DELETED: &str = "deleted";
    pub const DELETE_FAILED: &str = "delete_failed";
}

#[derive(Debug, Clone, Default)]
struct StatusCell {
    status: String,
    reason: String,
}

impl StatusCell {
    fn new(status: &str) -> Mutex<Self> {
        Mutex::new(Self {
            status: status.to_string(),
            reason: String::new(),
        })
    }
}

fn write_status(cell: &Mutex<StatusCell>, status: &str, reason: &str) -> Result<()> {
    let mut cell = cell
        .lock()
        .map_err(|_| EngineError::Other(anyhow::anyhow!("status lock poisoned")))?;
    cell.status = status.to_string();
    cell.reason = reason.to_string();
    Ok(())
}

fn read_cell(cell: &Mutex<StatusCell>) -> StatusCell {
    cell.lock().map(|c| c.clone()).unwrap_or_default()
}

/// Static description of a container inside a pod.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    pub id: String,
    pub name: String,
    pub image: String,
    pub depends_on: Vec<String>,
}

pub struct Pod {
    id: String,
    name: String,
    containers: Vec<ContainerSpec>,
    state: Mutex<StatusCell>,
}

impl Pod {
    pub fn new(id: impl Into<String>, name: impl Into<String>, containers: Vec<ContainerSpec>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            containers,
            state: StatusCell::new(status::CREATED),
        }
    }

    pub fn containers(&self) -> &[ContainerSpec] {
        &self.containers
    }

    pub fn container(&self, id: &str) -> Result<&ContainerSpec> {
        self.containers
            .iter()
            .find(|c| c.id == id)
            .ok_or_else(|| EngineError::TargetNotFound(format!("{CONTAINER_KIND}/{id}")))
    }

    pub fn reason(&self) -> String {
        read_cell(&self.state).reason
    }

    pub fn target(&self) -> TargetRef {
        TargetRef::new(POD_KIND, &self.id)
    }
}

impl TargetEntity for Pod {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> &str {
        POD_KIND
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn status(&self) -> String {
        read_cell(&self.state).status
    }

    fn set_status<'a>(
        &'a self,
        owner: &'a Credential,
        status: &'a str,
        reason: &'a str,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            write_status(&self.state, status, reason)?;
            debug!(pod = %self.name, %owner, %status, %reason, "pod status");
            Ok(())
        })
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub struct Container {
    spec: ContainerSpec,
    pod_id: String,
    state: Mutex<StatusCell>,
}

impl Container {
    pub fn new(pod_id: impl Into<String>, spec: ContainerSpec) -> Self {
        Self {
            spec,
            pod_id: pod_id.into(),
            state: StatusCell::new(status::CREATED),
        }
    }

    pub fn spec(&self) -> &ContainerSpec {
        &self.spec
    }

    pub fn pod_id(&self) -> &str {
        &self.pod_id
    }

    pub fn reason(&self) -> String {
        read_cell(&self.state).reason
    }

    pub fn target(&self) -> TargetRef {
        TargetRef::new(CONTAINER_KIND, &self.spec.id)
    }
}

impl TargetEntity for Container {
    fn id(&self) -> &str {
        &self.spec.id
    }

    fn kind(&self) -> &str {
        CONTAINER_KIND
    }

    fn name(&self) -> &str {
        &self.spec.name
    }

    fn status(&self) -> String {
        read_cell(&self.state).status
    }

    fn set_status<'a>(
        &'a self,
        owner: &'a Credential,
        status: &'a str,
        reason: &'a str,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            write_status(&self.state, status, reason)?;
            debug!(container = %self.spec.name, %owner, %status, %reason, "container status");
            Ok(())
        })
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Create a pod and its containers in `entities`.
///
/// Container ids are `<pod id>-<container name>`.
pub fn seed_pod(
    entities: &MemoryEntityStore,
    pod_id: &str,
    pod_name: &str,
    containers: impl IntoIterator<Item = (String, String, Vec<String>)>,
) -> Arc<Pod> {
    let specs: Vec<ContainerSpec> = containers
        .into_iter()
        .map(|(name, image, depends_on)| ContainerSpec {
            id: format!("{pod_id}-{name}"),
            name,
            image,
            depends_on,
        })
        .collect();

    for spec in &specs {
        entities.insert(Arc::new(Container::new(pod_id, spec.clone())));
    }
    let pod = Arc::new(Pod::new(pod_id, pod_name, specs));
    entities.insert(pod.clone());
    pod
}

/// Seed the pod described by `[pod]` and `[container.<name>]`.
pub fn seed_from_config(entities: &MemoryEntityStore, cfg: &ConfigFile) -> Arc<Pod> {
    seed_pod(
        entities,
        &cfg.pod.name,
        &cfg.pod.name,
        cfg.container
            .iter()
            .map(|(name, c)| (name.clone(), c.image.clone(), c.depends_on.clone())),
    )
}

/// Register the three pod task types on `pool`.
pub fn register_pod_tasks(
    registry: &mut TaskRegistry,
    driver: Arc<dyn ContainerDriver>,
    pool: &str,
) -> Result<()> {
    registry.register_in(PodStartTask, pool)?;
    registry.register_in(ContainerStartTask::new(driver.clone()), pool)?;
    registry.register_in(PodDeleteTask::new(driver), pool)?;
    Ok(())
}
