// src/engine/supervisor.rs

//! Liveness check for tasks whose handler forgot to move them on, or whose
//! awaited operation never reported back.

use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::engine::manager::TaskManager;
use crate::errors::Result;
use crate::types::Outcome;

/// Deliver a failure to every running task not updated for `stall_timeout`.
///
/// A task waiting on subtasks that are still running is skipped; those
/// children are supervised themselves. Returns how many tasks were failed.
pub async fn sweep_stalled(manager: &TaskManager, stall_timeout: Duration) -> Result<usize> {
    let limit = chrono::Duration::from_std(stall_timeout).unwrap_or(chrono::Duration::MAX);
    let now = Utc::now();
    let mut failed = 0;

    for task in manager.store().list_running().await? {
        let Some(mark) = task.current_mark() else {
            continue;
        };
        if now.signed_duration_since(task.updated_at) < limit {
            continue;
        }

        let children = manager.store().subtasks_of(task.id, &mark).await?;
        if children.iter().any(|c| !c.is_finished()) {
            debug!(task_id = %task.id, stage = %mark.name, "stalled parent still has running subtasks");
            continue;
        }

        warn!(
            task_id = %task.id,
            task_type = %task.task_type,
            stage = %mark.name,
            idle_secs = now.signed_duration_since(task.updated_at).num_seconds(),
            "task stalled; delivering failure"
        );
        let reason = format!("stalled in stage {}", mark.name);
        manager.deliver(
            &task.task_type,
            task.id,
            Some(mark),
            Outcome::Failure,
            Value::String(reason),
        );
        failed += 1;
    }

    Ok(failed)
}

/// Run [`sweep_stalled`] every `interval` until the returned handle is aborted.
pub fn spawn_supervisor(manager: TaskManager, interval: Duration) -> JoinHandle<()> {
    let stall_timeout = manager.options().stall_timeout;
    tokio::spawn(async move {
        info!(?interval, ?stall_timeout, "task supervisor started");
        let mut ticker = tokio::time::interval(interval);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            match sweep_stalled(&manager, stall_timeout).await {
                Ok(0) => {}
                Ok(n) => info!(failed = n, "supervisor failed stalled tasks"),
                Err(e) => error!(error = %e, "supervisor sweep failed"),
            }
        }
    })
}
