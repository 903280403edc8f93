// src/engine/pool.rs

//! Named worker pools.
//!
//! A pool is a bounded mpsc backlog drained by a background loop that runs
//! each job in its own Tokio task, with a semaphore capping how many run at
//! once. Jobs are handler invocations, `on_init` runs and local work.

use std::sync::Arc;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Semaphore, mpsc};
use tracing::{debug, info};

use crate::config::model::PoolConfig;
use crate::errors::{EngineError, Result};
use crate::types::BoxFuture;

/// Unit of work run by a pool.
pub type Job = BoxFuture<'static, ()>;

/// Submission handle of a running pool. Cheap to clone.
#[derive(Clone)]
pub struct WorkerPool {
    name: Arc<str>,
    config: PoolConfig,
    tx: mpsc::Sender<Job>,
}

impl WorkerPool {
    /// Spawn the pool loop. Must be called from within a Tokio runtime.
    ///
    /// The loop stops once every handle has been dropped and the backlog is
    /// drained.
    pub fn spawn(name: &str, config: PoolConfig) -> Self {
        let concurrency = config.concurrency.max(1);
        let backlog = config.backlog.max(1);
        let (tx, mut rx) = mpsc::channel::<Job>(backlog);
        let slots = Arc::new(Semaphore::new(concurrency));
        let pool_name: Arc<str> = Arc::from(name);

        let loop_name = pool_name.clone();
        tokio::spawn(async move {
            info!(pool = %loop_name, concurrency, backlog, "worker pool started");

            while let Some(job) = rx.recv().await {
                let Ok(slot) = slots.clone().acquire_owned().await else {
                    break;
                };
                tokio::spawn(async move {
                    job.await;
                    drop(slot);
                });
            }

            debug!(pool = %loop_name, "worker pool finished (channel closed)");
        });

        Self {
            name: pool_name,
            config,
            tx,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> PoolConfig {
        self.config
    }

    /// Free backlog slots right now.
    pub fn available(&self) -> usize {
        self.tx.capacity()
    }

    /// Queue a job, failing with [`EngineError::PoolOverloaded`] when the
    /// backlog is full.
    pub fn try_submit(&self, job: Job) -> Result<()> {
        match self.tx.try_send(job) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(EngineError::PoolOverloaded(self.name.to_string())),
            Err(TrySendError::Closed(_)) => Err(EngineError::PoolClosed(self.name.to_string())),
        }
    }

    /// Reserve a backlog slot ahead of time, so that a caller can fail before
    /// performing any side effect.
    pub fn try_reserve(&self) -> Result<mpsc::Permit<'_, Job>> {
        match self.tx.try_reserve() {
            Ok(permit) => Ok(permit),
            Err(TrySendError::Full(())) => {
                Err(EngineError::PoolOverloaded(self.name.to_string()))
            }
            Err(TrySendError::Closed(())) => Err(EngineError::PoolClosed(self.name.to_string())),
        }
    }

    /// Queue a job, waiting for backlog space.
    pub async fn submit(&self, job: Job) -> Result<()> {
        self.tx
            .send(job)
            .await
            .map_err(|_| EngineError::PoolClosed(self.name.to_string()))
    }
}
