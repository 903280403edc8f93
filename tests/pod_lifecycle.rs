// tests/pod_lifecycle.rs

mod common;
use crate::common::fakes::RecordingAuditor;
use crate::common::{WAIT, init_tracing};

use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use stagehand::engine::{TaskManager, TaskRegistry};
use stagehand::entity::{MemoryEntityStore, TargetEntity};
use stagehand::pod::delete::{RELEASE_ADDRESS, STOP_CONTAINERS, WAIT_RELEASED};
use stagehand::pod::start::START_CONTAINERS;
use stagehand::pod::{
    CONTAINER_KIND, ContainerStartTask, Pod, PodDeleteTask, PodStartTask, SimulatedDriver,
    register_pod_tasks, seed_pod, status,
};
use stagehand::store::MemoryTaskStore;
use stagehand::task::{INIT_STAGE, Params, TaskInstance, TaskLogic};
use stagehand::types::{Credential, TargetRef, TaskStatus};

type TestResult = Result<(), Box<dyn Error>>;

struct PodRig {
    manager: TaskManager,
    entities: Arc<MemoryEntityStore>,
    pod: Arc<Pod>,
    driver: Arc<SimulatedDriver>,
    auditor: Arc<RecordingAuditor>,
}

impl PodRig {
    fn new(containers: &[(&str, &str, &[&str])], driver: SimulatedDriver) -> Self {
        let entities = Arc::new(MemoryEntityStore::new());
        let pod = seed_pod(
            &entities,
            "pod-1",
            "web",
            containers.iter().map(|(name, image, deps)| {
                (
                    name.to_string(),
                    image.to_string(),
                    deps.iter().map(|d| d.to_string()).collect(),
                )
            }),
        );

        let driver = Arc::new(driver);
        let mut registry = TaskRegistry::new();
        register_pod_tasks(&mut registry, driver.clone(), "default").unwrap();

        let auditor = Arc::new(RecordingAuditor::default());
        let manager = TaskManager::builder(registry, Arc::new(MemoryTaskStore::new()), entities.clone())
            .auditor(auditor.clone())
            .build();

        Self {
            manager,
            entities,
            pod,
            driver,
            auditor,
        }
    }

    fn owner() -> Credential {
        Credential::new("operator", "web")
    }

    async fn start(&self) -> Result<TaskInstance, Box<dyn Error>> {
        let id = self
            .manager
            .create(PodStartTask::NAME, self.pod.target(), Self::owner(), Params::new(), None)
            .await?;
        Ok(self.manager.wait_for_terminal(id, WAIT).await?)
    }

    async fn delete(&self, params: Params) -> Result<TaskInstance, Box<dyn Error>> {
        let id = self
            .manager
            .create(PodDeleteTask::NAME, self.pod.target(), Self::owner(), params, None)
            .await?;
        Ok(self.manager.wait_for_terminal(id, WAIT).await?)
    }

    fn container_status(&self, name: &str) -> String {
        let target = TargetRef::new(CONTAINER_KIND, format!("pod-1-{name}"));
        self.entities
            .get(&target)
            .map(|c| c.status())
            .unwrap_or_default()
    }
}

const WEB_STACK: &[(&str, &str, &[&str])] = &[
    ("db", "postgres:16", &[]),
    ("cache", "redis:7", &["db"]),
    ("worker", "app:worker", &["db"]),
    ("api", "app:api", &["cache", "db"]),
];

fn fast_driver() -> SimulatedDriver {
    SimulatedDriver::new(Duration::from_millis(2))
}

fn position(started: &[String], name: &str) -> usize {
    started
        .iter()
        .position(|s| s == name)
        .unwrap_or_else(|| panic!("{name} was never started: {started:?}"))
}

#[tokio::test]
async fn containers_start_in_dependency_waves() -> TestResult {
    init_tracing();
    let rig = PodRig::new(WEB_STACK, fast_driver());

    let task = rig.start().await?;
    assert_eq!(task.status, TaskStatus::Complete);
    assert_eq!(rig.pod.status(), status::RUNNING);

    let started = rig.driver.started();
    assert_eq!(started.len(), 4);
    assert_eq!(started[0], "db");
    assert!(position(&started, "cache") < position(&started, "api"));
    assert!(position(&started, "worker") > position(&started, "db"));
    assert_eq!(started[3], "api");

    for name in ["db", "cache", "worker", "api"] {
        assert_eq!(rig.container_status(name), status::RUNNING, "{name}");
    }

    let stages: Vec<&str> = task.stages.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(
        stages,
        vec![INIT_STAGE, START_CONTAINERS, START_CONTAINERS, START_CONTAINERS]
    );
    assert_eq!(task.params.get("wave"), Some(&json!(3)));

    let actions = rig.auditor.actions();
    assert!(actions.contains(&("pod.start".to_string(), true)));
    assert_eq!(
        actions.iter().filter(|(a, ok)| a == "container.start" && *ok).count(),
        4
    );
    Ok(())
}

#[tokio::test]
async fn failing_container_fails_the_pod_start() -> TestResult {
    init_tracing();
    let rig = PodRig::new(
        WEB_STACK,
        fast_driver().failing(["cache".to_string()]),
    );

    let task = rig.start().await?;
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(rig.pod.status(), status::START_FAILED);
    assert!(rig.pod.reason().contains("cache"), "reason: {}", rig.pod.reason());

    assert_eq!(rig.container_status("cache"), status::START_FAILED);
    assert_eq!(rig.container_status("db"), status::RUNNING);
    assert!(!rig.driver.started().contains(&"api".to_string()));
    assert_eq!(rig.container_status("api"), status::CREATED);
    Ok(())
}

#[tokio::test]
async fn dependency_cycle_fails_before_anything_starts() -> TestResult {
    init_tracing();
    let rig = PodRig::new(
        &[("a", "img:a", &["b"]), ("b", "img:b", &["a"])],
        fast_driver(),
    );

    let task = rig.start().await?;
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(rig.pod.status(), status::START_FAILED);
    assert!(rig.pod.reason().contains("Circular dependency"));
    assert!(rig.driver.started().is_empty());
    Ok(())
}

#[tokio::test]
async fn empty_pod_starts_immediately() -> TestResult {
    init_tracing();
    let rig = PodRig::new(&[], fast_driver());

    let task = rig.start().await?;
    assert_eq!(task.status, TaskStatus::Complete);
    assert_eq!(rig.pod.status(), status::RUNNING);
    Ok(())
}

#[tokio::test]
async fn purge_delete_skips_waiting_for_the_address() -> TestResult {
    init_tracing();
    let rig = PodRig::new(WEB_STACK, fast_driver().release_lag(usize::MAX));
    rig.start().await?;

    let task = rig.delete(Params::new().with("purge", true)).await?;
    assert_eq!(task.status, TaskStatus::Complete);
    assert_eq!(rig.pod.status(), status::DELETED);
    assert_eq!(rig.driver.stopped().len(), 4);
    for name in ["db", "cache", "worker", "api"] {
        assert_eq!(rig.container_status(name), status::EXITED, "{name}");
    }

    let stages: Vec<&str> = task.stages.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(stages, vec![INIT_STAGE, STOP_CONTAINERS, RELEASE_ADDRESS]);
    Ok(())
}

#[tokio::test]
async fn delete_waits_for_the_address_release() -> TestResult {
    init_tracing();
    let rig = PodRig::new(WEB_STACK, fast_driver().release_lag(3));
    rig.start().await?;

    let task = rig
        .delete(Params::new().with("release_poll_ms", 5))
        .await?;
    assert_eq!(task.status, TaskStatus::Complete);
    assert_eq!(rig.pod.status(), status::DELETED);

    let stages: Vec<&str> = task.stages.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(
        stages,
        vec![INIT_STAGE, STOP_CONTAINERS, RELEASE_ADDRESS, WAIT_RELEASED]
    );
    assert!(rig.auditor.actions().contains(&("pod.delete".to_string(), true)));
    Ok(())
}

#[tokio::test]
async fn failed_address_release_does_not_block_deletion() -> TestResult {
    init_tracing();
    let rig = PodRig::new(WEB_STACK, fast_driver().failing_release());
    rig.start().await?;

    let task = rig.delete(Params::new()).await?;
    assert_eq!(task.status, TaskStatus::Complete);
    assert_eq!(rig.pod.status(), status::DELETED);

    let release_error = task.params.get("release_error").and_then(|v| v.as_str());
    assert!(
        release_error.is_some_and(|e| e.contains("still referenced")),
        "release_error: {release_error:?}"
    );
    assert!(
        rig.auditor
            .actions()
            .contains(&("pod.release_address".to_string(), false))
    );
    Ok(())
}

#[tokio::test]
async fn address_release_timeout_fails_the_delete() -> TestResult {
    init_tracing();
    let rig = PodRig::new(WEB_STACK, fast_driver().release_lag(usize::MAX));
    rig.start().await?;

    let task = rig
        .delete(
            Params::new()
                .with("release_timeout_ms", 40)
                .with("release_poll_ms", 5),
        )
        .await?;
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(rig.pod.status(), status::DELETE_FAILED);
    assert!(rig.pod.reason().contains("Timed out"), "reason: {}", rig.pod.reason());
    assert_eq!(task.failures[0].stage, WAIT_RELEASED);
    Ok(())
}

#[tokio::test]
async fn failed_container_stop_fails_the_delete() -> TestResult {
    init_tracing();
    let rig = PodRig::new(WEB_STACK, fast_driver().failing_stop());
    rig.start().await?;

    let task = rig.delete(Params::new()).await?;
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(rig.pod.status(), status::DELETE_FAILED);
    assert!(rig.driver.stopped().is_empty());

    assert_eq!(task.failures[0].stage, STOP_CONTAINERS);
    let reason = task.failures[0].reason.as_str().unwrap_or_default();
    assert!(reason.starts_with("stop_containers: "), "reason: {reason}");
    assert!(reason.contains("did not stop"), "reason: {reason}");
    assert!(rig.pod.reason().contains("stop_containers"), "reason: {}", rig.pod.reason());

    let stages: Vec<&str> = task.stages.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(stages, vec![INIT_STAGE, STOP_CONTAINERS]);
    assert!(rig.auditor.actions().contains(&("pod.delete".to_string(), false)));
    Ok(())
}

#[tokio::test]
async fn huge_release_timeout_waits_without_a_deadline() -> TestResult {
    init_tracing();
    let rig = PodRig::new(WEB_STACK, fast_driver().release_lag(3));
    rig.start().await?;

    let task = rig
        .delete(
            Params::new()
                .with("release_timeout_ms", u64::MAX)
                .with("release_poll_ms", 5),
        )
        .await?;
    assert_eq!(task.status, TaskStatus::Complete);
    assert_eq!(rig.pod.status(), status::DELETED);
    Ok(())
}

#[tokio::test]
async fn pod_tasks_share_the_requested_pool() {
    let rig = PodRig::new(&[], fast_driver());
    let registry = rig.manager.registry();

    for name in [PodStartTask::NAME, ContainerStartTask::NAME, PodDeleteTask::NAME] {
        assert_eq!(registry.pool_of(name), Some("default"), "{name}");
    }
    assert_eq!(registry.pool_of("Nope"), None);
}
