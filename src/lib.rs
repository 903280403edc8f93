// src/lib.rs

pub mod audit;
pub mod cli;
pub mod config;
pub mod dag;
pub mod engine;
pub mod entity;
pub mod errors;
pub mod logging;
pub mod pod;
pub mod store;
pub mod task;
pub mod types;

use std::sync::Arc;

use anyhow::{Context, Result, bail};
use tracing::{debug, info};

use crate::cli::CliArgs;
use crate::config::loader::load_and_validate;
use crate::config::model::ConfigFile;
use crate::config::parse_duration;
use crate::dag::DependencyBatchGraph;
use crate::engine::{EngineOptions, TaskManager, TaskRegistry, spawn_supervisor};
use crate::entity::{MemoryEntityStore, TargetEntity};
use crate::pod::{PodDeleteTask, PodStartTask, SimulatedDriver, register_pod_tasks, seed_from_config};
use crate::store::build_store;
use crate::task::{Params, TaskLogic};
use crate::types::{Credential, TaskStatus};

/// High-level entry point used by `main.rs`.
///
/// This wires together:
/// - config loading
/// - task store, entity store and simulated driver
/// - registry, worker pools and task manager
/// - restart recovery and the stall supervisor
/// - the pod start (and optionally delete) workflow
pub async fn run(args: CliArgs) -> Result<()> {
    let cfg = load_and_validate(&args.config)
        .with_context(|| format!("loading config {}", args.config))?;

    if args.dry_run {
        print_dry_run(&cfg)?;
        return Ok(());
    }

    let wait = parse_duration(&args.wait).map_err(anyhow::Error::msg)?;

    let store = build_store(&cfg.engine)?;
    let entities = Arc::new(MemoryEntityStore::new());
    let pod = seed_from_config(&entities, &cfg);
    let driver = Arc::new(SimulatedDriver::from_config(&cfg.driver));

    let mut registry = TaskRegistry::from_config(&cfg);
    register_pod_tasks(&mut registry, driver, &cfg.engine.pod_pool)?;

    let manager = TaskManager::builder(registry, store, entities)
        .options(EngineOptions::from(&cfg.engine))
        .build();

    let recovered = manager.recover().await?;
    if recovered > 0 {
        info!(recovered, "signalled tasks left over from a previous run");
    }
    let supervisor = spawn_supervisor(manager.clone(), cfg.engine.supervise_interval);

    let owner = Credential::new("operator", &cfg.pod.name);
    let start = manager
        .create(PodStartTask::NAME, pod.target(), owner.clone(), Params::new(), None)
        .await?;
    let started = manager.wait_for_terminal(start, wait).await?;
    println!("{}: {} ({})", PodStartTask::NAME, pod.status(), started.id);
    for spec in pod.containers() {
        println!("  - {}: {}", spec.name, spec.image);
    }

    if started.status != TaskStatus::Complete {
        supervisor.abort();
        bail!("pod {} failed to start: {}", cfg.pod.name, pod.reason());
    }

    if args.delete {
        let params = Params::new().with("purge", args.purge);
        let delete = manager
            .create(PodDeleteTask::NAME, pod.target(), owner, params, None)
            .await?;
        let deleted = manager.wait_for_terminal(delete, wait).await?;
        println!("{}: {} ({})", PodDeleteTask::NAME, pod.status(), deleted.id);
        if deleted.status != TaskStatus::Complete {
            supervisor.abort();
            bail!("pod {} failed to delete: {}", cfg.pod.name, pod.reason());
        }
    }

    supervisor.abort();
    Ok(())
}

/// Print the container start waves without starting anything.
fn print_dry_run(cfg: &ConfigFile) -> Result<()> {
    println!("stagehand dry-run");
    println!("  engine.storage = {:?}", cfg.engine.storage);
    println!("  engine.on_restart = {:?}", cfg.engine.on_restart);
    println!("  engine.stall_timeout = {:?}", cfg.engine.stall_timeout);
    for (name, pool) in &cfg.pool {
        println!(
            "  pool.{name}: concurrency = {}, backlog = {}",
            pool.concurrency, pool.backlog
        );
    }
    println!();

    let containers: Vec<(&String, &config::ContainerConfig)> = cfg.container.iter().collect();
    let mut graph = DependencyBatchGraph::new(
        &containers,
        |(name, _)| name.to_string(),
        |(name, _)| name.to_string(),
        |(_, c)| c.depends_on.clone(),
    )?;

    println!("pod {} ({} containers):", cfg.pod.name, containers.len());
    let mut wave = 0;
    while let Some(batch) = graph.next_batch(|id| {
        cfg.container
            .get_key_value(id)
            .ok_or_else(|| errors::EngineError::TargetNotFound(id.to_string()))
    })? {
        wave += 1;
        println!("  wave {wave}:");
        for (name, c) in batch {
            println!("    - {name} ({})", c.image);
            if !c.depends_on.is_empty() {
                println!("        depends_on: {:?}", c.depends_on);
            }
        }
    }

    debug!("dry-run complete (no execution)");
    Ok(())
}
