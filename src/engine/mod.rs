// src/engine/mod.rs

//! Orchestration engine.
//!
//! - [`registry`]: task types and pool definitions, built once at startup.
//! - [`pool`]: bounded worker pools running dispatch jobs and local work.
//! - [`manager`]: task creation, signal dispatch, parent notification and
//!   restart recovery.
//! - [`supervisor`]: stall detection.
//! - [`poll`]: bounded polling helper.

pub mod manager;
pub mod poll;
pub mod pool;
pub mod registry;
pub mod supervisor;

pub use manager::{EngineOptions, RESTART_REASON, SignalDisposition, TaskManager, TaskManagerBuilder};
pub use poll::poll_until;
pub use pool::{Job, WorkerPool};
pub use registry::TaskRegistry;
pub use supervisor::{spawn_supervisor, sweep_stalled};
