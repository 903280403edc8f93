// tests/worker_pool.rs

mod common;
use crate::common::fakes::Harness;
use crate::common::{WAIT, init_tracing, with_timeout};

use std::error::Error;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde_json::json;
use tokio::sync::Semaphore;

use stagehand::config::PoolConfig;
use stagehand::engine::{SignalDisposition, WorkerPool, poll_until};
use stagehand::errors::EngineError;
use stagehand::store::TaskStore;
use stagehand::task::Params;
use stagehand::types::{Outcome, TaskStatus};

type TestResult = Result<(), Box<dyn Error>>;

/// Submit jobs parked on `gate` until the pool rejects one. Returns how many
/// were accepted.
fn fill(pool: &WorkerPool, gate: &Arc<Semaphore>) -> Result<usize, EngineError> {
    for accepted in 0..64 {
        let gate = gate.clone();
        let job = Box::pin(async move {
            let _ = gate.acquire().await;
        });
        match pool.try_submit(job) {
            Ok(()) => {}
            Err(EngineError::PoolOverloaded(_)) => return Ok(accepted),
            Err(e) => return Err(e),
        }
    }
    Err(EngineError::Config("pool never filled up".to_string()))
}

#[tokio::test]
async fn full_backlog_rejects_submissions() -> TestResult {
    init_tracing();
    let pool = WorkerPool::spawn("tiny", PoolConfig::new(1, 1));
    let gate = Arc::new(Semaphore::new(0));

    let accepted = fill(&pool, &gate)?;
    assert!(accepted >= 1, "accepted {accepted}");

    let rejected = pool.try_submit(Box::pin(async {}));
    assert!(matches!(rejected, Err(EngineError::PoolOverloaded(name)) if name == "tiny"));
    assert!(matches!(pool.try_reserve(), Err(EngineError::PoolOverloaded(_))));

    gate.add_permits(64);
    with_timeout(async {
        while pool.available() < 1 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    pool.try_submit(Box::pin(async {}))?;
    Ok(())
}

#[tokio::test]
async fn concurrency_is_capped() -> TestResult {
    init_tracing();
    let pool = WorkerPool::spawn("capped", PoolConfig::new(2, 16));
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let done = Arc::new(AtomicUsize::new(0));

    for _ in 0..6 {
        let running = running.clone();
        let peak = peak.clone();
        let done = done.clone();
        pool.try_submit(Box::pin(async move {
            let now = running.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            running.fetch_sub(1, Ordering::SeqCst);
            done.fetch_add(1, Ordering::SeqCst);
        }))?;
    }

    with_timeout(async {
        while done.load(Ordering::SeqCst) < 6 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    let peak = peak.load(Ordering::SeqCst);
    assert!(peak >= 1 && peak <= 2, "peak concurrency {peak}");
    Ok(())
}

#[tokio::test]
async fn create_fails_fast_when_the_pool_is_full() -> TestResult {
    init_tracing();
    let h = Harness::with_pool(PoolConfig::new(1, 1));
    let gate = Arc::new(Semaphore::new(0));

    fill(h.manager.pool("default")?, &gate)?;

    let result = h.create_scripted(Params::new()).await;
    assert!(matches!(result, Err(EngineError::PoolOverloaded(name)) if name == "default"));
    assert!(h.store.list_running().await?.is_empty());

    gate.add_permits(64);
    let manager = &h.manager;
    poll_until("backlog to drain", Duration::from_millis(5), WAIT, || async move {
        Ok((manager.pool("default")?.available() >= 1).then_some(()))
    })
    .await?;

    let id = h.create_scripted(Params::new()).await?;
    h.wait_for_stage(id, "Foo").await?;
    Ok(())
}

#[tokio::test]
async fn signal_fails_fast_when_the_pool_is_full() -> TestResult {
    init_tracing();
    let h = Harness::with_pool(PoolConfig::new(1, 1));

    let id = h.create_scripted(Params::new()).await?;
    h.wait_for_stage(id, "Foo").await?;

    let gate = Arc::new(Semaphore::new(0));
    fill(h.manager.pool("default")?, &gate)?;

    let result = h.manager.signal(id, Outcome::Success, json!("done")).await;
    assert!(matches!(result, Err(EngineError::PoolOverloaded(_))));

    gate.add_permits(64);
    let task = h.manager.get(id).await?;
    assert_eq!(task.stage.as_deref(), Some("Foo"));
    Ok(())
}

#[tokio::test]
async fn concurrent_signals_for_one_task_run_one_at_a_time() -> TestResult {
    init_tracing();
    let h = Harness::with_pool(PoolConfig::new(8, 64));

    let id = h.create_scripted(Params::new()).await?;
    h.wait_for_stage(id, "Foo").await?;

    // Both are accepted: the task still awaits Foo when each arrives.
    let first = h.manager.signal(id, Outcome::Success, json!("done")).await?;
    let second = h.manager.signal(id, Outcome::Failure, json!("late")).await?;
    assert_eq!(first, SignalDisposition::Queued);
    assert_eq!(second, SignalDisposition::Queued);

    let task = h.manager.wait_for_terminal(id, WAIT).await?;
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Whichever ran first finished the task; the other found it terminal.
    let handled = h.journal.count("OnFooComplete") + h.journal.count("OnFooCompleteFailed");
    assert_eq!(handled, 1);
    let after = h.manager.get(id).await?;
    assert_eq!(after.status, task.status);
    assert!(matches!(after.status, TaskStatus::Complete | TaskStatus::Failed));
    assert!(after.failures.len() <= 1);
    Ok(())
}
