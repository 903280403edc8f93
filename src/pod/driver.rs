// src/pod/driver.rs

//! Container driver capability and its simulated implementation.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Result, anyhow, bail};
use serde_json::{Value, json};
use tracing::debug;

use crate::config::model::DriverConfig;
use crate::types::BoxFuture;

/// Calls into the container runtime. Async calls return `'static` futures so
/// they can be handed to `TaskContext::run_operation`.
pub trait ContainerDriver: Send + Sync + 'static {
    fn start_container(&self, pod_id: &str, name: &str, image: &str) -> BoxFuture<'static, Result<Value>>;

    /// Blocking stop; run through `TaskContext::local_task_run`.
    fn stop_container(&self, container_id: &str) -> Result<()>;

    fn release_address(&self, pod_id: &str) -> BoxFuture<'static, Result<Value>>;

    /// Whether the pod address has been fully released upstream.
    fn address_released(&self, pod_id: &str) -> BoxFuture<'static, Result<bool>>;
}

#[derive(Default)]
struct DriverState {
    started: Vec<String>,
    stopped: Vec<String>,
    releases_requested: HashSet<String>,
    release_polls: usize,
}

/// In-process driver with configurable latency and failures.
#[derive(Clone)]
pub struct SimulatedDriver {
    latency: Duration,
    fail: Arc<HashSet<String>>,
    fail_release: bool,
    fail_stop: bool,
    /// Polls of `address_released` that report `false` before it flips.
    release_lag: usize,
    state: Arc<Mutex<DriverState>>,
}

impl SimulatedDriver {
    pub fn new(latency: Duration) -> Self {
        Self {
            latency,
            fail: Arc::new(HashSet::new()),
            fail_release: false,
            fail_stop: false,
            release_lag: 0,
            state: Arc::new(Mutex::new(DriverState::default())),
        }
    }

    pub fn from_config(cfg: &DriverConfig) -> Self {
        Self::new(cfg.latency).failing(cfg.fail.iter().cloned())
    }

    /// Container names whose start fails.
    pub fn failing(mut self, names: impl IntoIterator<Item = String>) -> Self {
        self.fail = Arc::new(names.into_iter().collect());
        self
    }

    pub fn failing_release(mut self) -> Self {
        self.fail_release = true;
        self
    }

    /// Every container stop fails.
    pub fn failing_stop(mut self) -> Self {
        self.fail_stop = true;
        self
    }

    pub fn release_lag(mut self, polls: usize) -> Self {
        self.release_lag = polls;
        self
    }

    /// Container names in the order their start completed.
    pub fn started(&self) -> Vec<String> {
        self.state.lock().map(|s| s.started.clone()).unwrap_or_default()
    }

    pub fn stopped(&self) -> Vec<String> {
        self.state.lock().map(|s| s.stopped.clone()).unwrap_or_default()
    }
}

impl ContainerDriver for SimulatedDriver {
    fn start_container(&self, pod_id: &str, name: &str, image: &str) -> BoxFuture<'static, Result<Value>> {
        let latency = self.latency;
        let fails = self.fail.contains(name);
        let state = self.state.clone();
        let pod_id = pod_id.to_string();
        let name = name.to_string();
        let image = image.to_string();

        Box::pin(async move {
            tokio::time::sleep(latency).await;
            if fails {
                bail!("container {name} ({image}) exited during start");
            }
            state
                .lock()
                .map_err(|_| anyhow!("driver state poisoned"))?
                .started
                .push(name.clone());
            debug!(%pod_id, container = %name, %image, "container started");
            Ok(json!({ "name": name, "image": image }))
        })
    }

    fn stop_container(&self, container_id: &str) -> Result<()> {
        std::thread::sleep(self.latency);
        if self.fail_stop {
            bail!("container {container_id} did not stop");
        }
        self.state
            .lock()
            .map_err(|_| anyhow!("driver state poisoned"))?
            .stopped
            .push(container_id.to_string());
        Ok(())
    }

    fn release_address(&self, pod_id: &str) -> BoxFuture<'static, Result<Value>> {
        let latency = self.latency;
        let fail = self.fail_release;
        let state = self.state.clone();
        let pod_id = pod_id.to_string();

        Box::pin(async move {
            tokio::time::sleep(latency).await;
            if fail {
                bail!("address of pod {pod_id} is still referenced");
            }
            state
                .lock()
                .map_err(|_| anyhow!("driver state poisoned"))?
                .releases_requested
                .insert(pod_id.clone());
            Ok(json!({ "pod": pod_id }))
        })
    }

    fn address_released(&self, pod_id: &str) -> BoxFuture<'static, Result<bool>> {
        let lag = self.release_lag;
        let state = self.state.clone();
        let pod_id = pod_id.to_string();

        Box::pin(async move {
            let mut state = state.lock().map_err(|_| anyhow!("driver state poisoned"))?;
            if !state.releases_requested.contains(&pod_id) {
                return Ok(false);
            }
            state.release_polls += 1;
            Ok(state.release_polls > lag)
        })
    }
}
