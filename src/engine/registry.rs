// src/engine/registry.rs

//! Process-wide table of task types and worker pool definitions.
//!
//! Built once at startup and handed to [`crate::engine::TaskManager`], which
//! owns it from then on.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tracing::debug;

use crate::config::model::{ConfigFile, DEFAULT_POOL, PoolConfig};
use crate::errors::{EngineError, Result};
use crate::task::stage::{ErasedTask, Prototype, TaskLogic};

pub(crate) struct Registered {
    pub(crate) prototype: Arc<dyn ErasedTask>,
    pub(crate) pool: String,
}

pub struct TaskRegistry {
    tasks: HashMap<String, Registered>,
    pools: BTreeMap<String, PoolConfig>,
    default_pool: String,
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskRegistry {
    /// Registry with only the `default` pool.
    pub fn new() -> Self {
        let mut pools = BTreeMap::new();
        pools.insert(DEFAULT_POOL.to_string(), PoolConfig::default());
        Self {
            tasks: HashMap::new(),
            pools,
            default_pool: DEFAULT_POOL.to_string(),
        }
    }

    /// Registry with the pools declared in `[pool.<name>]`.
    pub fn from_config(cfg: &ConfigFile) -> Self {
        let mut registry = Self::new();
        for (name, pool) in &cfg.pool {
            registry.add_pool(name, *pool);
        }
        registry.default_pool = cfg.engine.default_pool.clone();
        registry
    }

    pub fn with_pool(mut self, name: &str, config: PoolConfig) -> Self {
        self.add_pool(name, config);
        self
    }

    pub fn add_pool(&mut self, name: &str, config: PoolConfig) {
        self.pools.insert(name.to_string(), config);
    }

    /// Register a task type on the default pool.
    pub fn register<T: TaskLogic>(&mut self, logic: T) -> Result<()> {
        let pool = self.default_pool.clone();
        self.register_in(logic, &pool)
    }

    /// Register a task type on a named pool.
    pub fn register_in<T: TaskLogic>(&mut self, logic: T, pool: &str) -> Result<()> {
        if !self.pools.contains_key(pool) {
            return Err(EngineError::Config(format!(
                "task type '{}' registered on unknown pool '{pool}'",
                T::NAME
            )));
        }
        if self.tasks.contains_key(T::NAME) {
            return Err(EngineError::Config(format!(
                "task type '{}' registered twice",
                T::NAME
            )));
        }

        let prototype = Prototype::new(logic)?;
        debug!(task_type = T::NAME, pool = %pool, "registered task type");
        self.tasks.insert(
            T::NAME.to_string(),
            Registered {
                prototype: Arc::new(prototype),
                pool: pool.to_string(),
            },
        );
        Ok(())
    }

    pub fn contains(&self, task_type: &str) -> bool {
        self.tasks.contains_key(task_type)
    }

    pub fn pool_of(&self, task_type: &str) -> Option<&str> {
        self.tasks.get(task_type).map(|r| r.pool.as_str())
    }

    /// Whether `task_type` declares a handler for `stage`.
    pub fn has_stage(&self, task_type: &str, stage: &str) -> bool {
        self.tasks
            .get(task_type)
            .is_some_and(|r| r.prototype.has_stage(stage))
    }

    /// Registered type names, sorted.
    pub fn task_types(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tasks.values().map(|r| r.prototype.name()).collect();
        names.sort_unstable();
        names
    }

    pub fn pools(&self) -> impl Iterator<Item = (&str, PoolConfig)> {
        self.pools.iter().map(|(name, cfg)| (name.as_str(), *cfg))
    }

    pub(crate) fn get(&self, task_type: &str) -> Result<&Registered> {
        self.tasks
            .get(task_type)
            .ok_or_else(|| EngineError::UnknownTaskType(task_type.to_string()))
    }
}
