// src/errors.rs

//! Crate-wide error type and result alias.

use std::time::Duration;

use thiserror::Error;

use crate::types::TaskId;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unknown task type: {0}")]
    UnknownTaskType(String),

    #[error("Task type '{task_type}' has no handler for stage '{stage}'")]
    UnknownStage { task_type: String, stage: String },

    #[error("Item '{item}' depends on unknown item '{dependency}'")]
    UnresolvedDependency { item: String, dependency: String },

    #[error("Circular dependency detected: {0}")]
    CircularDependency(String),

    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("Task {0} is not awaiting any stage")]
    NoAwaitedStage(TaskId),

    #[error("Task type '{task_type}' cannot resolve handler {handler}")]
    HandlerNotFound { task_type: String, handler: String },

    #[error("Target {0} not found")]
    TargetNotFound(String),

    #[error("Worker pool '{0}' backlog is full")]
    PoolOverloaded(String),

    #[error("Worker pool '{0}' is closed")]
    PoolClosed(String),

    #[error("Timed out after {timeout:?} waiting for {what}")]
    PollTimeout { what: String, timeout: Duration },

    #[error("{op}: {message}")]
    Operation { op: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl EngineError {
    /// Wrap an external failure with the name of the operation that produced it.
    pub fn operation(op: impl Into<String>, err: impl std::fmt::Display) -> Self {
        EngineError::Operation {
            op: op.into(),
            message: err.to_string(),
        }
    }
}

pub use anyhow::Error;
pub type Result<T> = std::result::Result<T, EngineError>;
