#![allow(dead_code)]

use std::path::Path;

use stagehand::config::model::{ContainerConfig, PoolConfig, RawConfigFile};
use stagehand::config::ConfigFile;
use stagehand::errors::Result;
use stagehand::types::{RestartPolicy, StorageMode};

/// Builder for `ConfigFile` to simplify test setup.
pub struct ConfigFileBuilder {
    config: RawConfigFile,
}

impl ConfigFileBuilder {
    pub fn new() -> Self {
        Self {
            config: RawConfigFile::default(),
        }
    }

    pub fn pod(mut self, name: &str) -> Self {
        self.config.pod.name = name.to_string();
        self
    }

    pub fn with_container(mut self, name: &str, image: &str, depends_on: &[&str]) -> Self {
        self.config.container.insert(
            name.to_string(),
            ContainerConfig {
                image: image.to_string(),
                depends_on: depends_on.iter().map(|d| d.to_string()).collect(),
            },
        );
        self
    }

    pub fn with_pool(mut self, name: &str, concurrency: usize, backlog: usize) -> Self {
        self.config
            .pool
            .insert(name.to_string(), PoolConfig::new(concurrency, backlog));
        self
    }

    pub fn pod_pool(mut self, name: &str) -> Self {
        self.config.engine.pod_pool = Some(name.to_string());
        self
    }

    pub fn file_storage(mut self, state_dir: &Path) -> Self {
        self.config.engine.storage = StorageMode::File;
        self.config.engine.state_dir = state_dir.display().to_string();
        self
    }

    pub fn on_restart(mut self, policy: RestartPolicy) -> Self {
        self.config.engine.on_restart = policy;
        self
    }

    pub fn stall_timeout(mut self, value: &str) -> Self {
        self.config.engine.stall_timeout = value.to_string();
        self
    }

    pub fn driver_latency(mut self, value: &str) -> Self {
        self.config.driver.latency = value.to_string();
        self
    }

    pub fn failing_container(mut self, name: &str) -> Self {
        self.config.driver.fail.push(name.to_string());
        self
    }

    pub fn raw(self) -> RawConfigFile {
        self.config
    }

    pub fn try_build(self) -> Result<ConfigFile> {
        ConfigFile::try_from(self.config)
    }

    pub fn build(self) -> ConfigFile {
        self.try_build()
            .expect("Failed to build valid config from builder")
    }
}

impl Default for ConfigFileBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Items for exercising the dependency batch scheduler directly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    pub id: String,
    pub name: String,
    pub deps: Vec<String>,
}

impl Item {
    /// Item whose id is `id-<name>`.
    pub fn new(name: &str, deps: &[&str]) -> Self {
        Self {
            id: format!("id-{name}"),
            name: name.to_string(),
            deps: deps.iter().map(|d| d.to_string()).collect(),
        }
    }
}

/// Build a batch graph over `items` keyed by their ids.
pub fn item_graph(items: &[Item]) -> Result<stagehand::dag::DependencyBatchGraph> {
    stagehand::dag::DependencyBatchGraph::new(
        items,
        |i| i.id.clone(),
        |i| i.name.clone(),
        |i| i.deps.clone(),
    )
}

/// Drain a graph, returning each wave as a sorted list of item names.
pub fn drain_names(
    graph: &mut stagehand::dag::DependencyBatchGraph,
    items: &[Item],
) -> Result<Vec<Vec<String>>> {
    let mut waves = Vec::new();
    while let Some(batch) = graph.next_batch(|id| {
        items
            .iter()
            .find(|i| i.id == id)
            .cloned()
            .ok_or_else(|| stagehand::errors::EngineError::TargetNotFound(id.to_string()))
    })? {
        let mut names: Vec<String> = batch.into_iter().map(|i| i.name).collect();
        names.sort();
        waves.push(names);
    }
    Ok(waves)
}
