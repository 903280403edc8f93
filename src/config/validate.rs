// src/config/validate.rs

use std::collections::BTreeMap;
use std::time::Duration;

use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;
use tracing::warn;

use crate::config::duration::parse_duration;
use crate::config::model::{
    ConfigFile, DEFAULT_POOL, DriverConfig, EngineConfig, PoolConfig, RawConfigFile,
};
use crate::errors::{EngineError, Result};

impl TryFrom<RawConfigFile> for ConfigFile {
    type Error = EngineError;

    fn try_from(raw: RawConfigFile) -> std::result::Result<Self, Self::Error> {
        validate_config(&raw)?;

        let mut pool = raw.pool;
        pool.entry(DEFAULT_POOL.to_string()).or_default();

        let engine = EngineConfig {
            storage: raw.engine.storage,
            state_dir: raw.engine.state_dir.into(),
            on_restart: raw.engine.on_restart,
            stall_timeout: duration_field("engine.stall_timeout", &raw.engine.stall_timeout)?,
            supervise_interval: duration_field(
                "engine.supervise_interval",
                &raw.engine.supervise_interval,
            )?,
            pod_pool: raw
                .engine
                .pod_pool
                .unwrap_or_else(|| raw.engine.default_pool.clone()),
            default_pool: raw.engine.default_pool,
        };

        let driver = DriverConfig {
            latency: duration_field("driver.latency", &raw.driver.latency)?,
            fail: raw.driver.fail,
        };

        Ok(ConfigFile {
            engine,
            pool,
            driver,
            pod: raw.pod,
            container: raw.container,
        })
    }
}

/// Check every invariant of a raw config without converting it.
pub fn validate_config(cfg: &RawConfigFile) -> Result<()> {
    validate_engine(cfg)?;
    validate_pools(&cfg.pool)?;
    validate_pool_references(cfg)?;
    validate_containers(cfg)?;
    validate_container_graph(cfg)?;
    warn_unknown_failures(cfg);
    Ok(())
}

fn duration_field(field: &str, value: &str) -> Result<Duration> {
    parse_duration(value).map_err(|e| EngineError::Config(format!("[{field}] {e}")))
}

fn validate_engine(cfg: &RawConfigFile) -> Result<()> {
    for (field, value) in [
        ("engine.stall_timeout", &cfg.engine.stall_timeout),
        ("engine.supervise_interval", &cfg.engine.supervise_interval),
    ] {
        if duration_field(field, value)?.is_zero() {
            return Err(EngineError::Config(format!("[{field}] must be > 0")));
        }
    }
    duration_field("driver.latency", &cfg.driver.latency)?;

    if cfg.engine.state_dir.trim().is_empty() {
        return Err(EngineError::Config(
            "[engine].state_dir must not be empty".to_string(),
        ));
    }
    Ok(())
}

fn validate_pools(pools: &BTreeMap<String, PoolConfig>) -> Result<()> {
    for (name, pool) in pools {
        if pool.concurrency == 0 {
            return Err(EngineError::Config(format!(
                "[pool.{name}].concurrency must be >= 1 (got 0)"
            )));
        }
        if pool.backlog == 0 {
            return Err(EngineError::Config(format!(
                "[pool.{name}].backlog must be >= 1 (got 0)"
            )));
        }
    }
    Ok(())
}

fn validate_pool_references(cfg: &RawConfigFile) -> Result<()> {
    let known = |name: &str| name == DEFAULT_POOL || cfg.pool.contains_key(name);

    if !known(&cfg.engine.default_pool) {
        return Err(EngineError::Config(format!(
            "[engine].default_pool refers to unknown pool '{}'",
            cfg.engine.default_pool
        )));
    }
    if let Some(pod_pool) = &cfg.engine.pod_pool {
        if !known(pod_pool) {
            return Err(EngineError::Config(format!(
                "[engine].pod_pool refers to unknown pool '{pod_pool}'"
            )));
        }
    }
    Ok(())
}

fn validate_containers(cfg: &RawConfigFile) -> Result<()> {
    for (name, container) in &cfg.container {
        if container.image.trim().is_empty() {
            return Err(EngineError::Config(format!(
                "container '{name}' must have a non-empty image"
            )));
        }
        for dep in &container.depends_on {
            if dep == name {
                return Err(EngineError::Config(format!(
                    "container '{name}' cannot depend on itself in `depends_on`"
                )));
            }
            if !cfg.container.contains_key(dep) {
                return Err(EngineError::UnresolvedDependency {
                    item: name.clone(),
                    dependency: dep.clone(),
                });
            }
        }
    }
    Ok(())
}

fn validate_container_graph(cfg: &RawConfigFile) -> Result<()> {
    // Edge direction: dependency -> dependent.
    let mut graph: DiGraphMap<&str, ()> = DiGraphMap::new();

    for name in cfg.container.keys() {
        graph.add_node(name.as_str());
    }

    for (name, container) in &cfg.container {
        for dep in &container.depends_on {
            graph.add_edge(dep.as_str(), name.as_str(), ());
        }
    }

    match toposort(&graph, None) {
        Ok(_order) => Ok(()),
        Err(cycle) => Err(EngineError::CircularDependency(format!(
            "cycle detected in container graph involving '{}'",
            cycle.node_id()
        ))),
    }
}

fn warn_unknown_failures(cfg: &RawConfigFile) {
    for name in &cfg.driver.fail {
        if !cfg.container.contains_key(name) {
            warn!(container = %name, "[driver].fail names an unknown container");
        }
    }
}
