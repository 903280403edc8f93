// src/task/mod.rs

//! Task instances and the logic attached to task types.
//!
//! - [`instance`] is the durable record.
//! - [`params`] is the mergeable params document.
//! - [`stage`] declares task logic: `on_init` plus a stage handler table.
//! - [`context`] is what handlers use to move a task forward.

pub mod context;
pub mod instance;
pub mod params;
pub mod stage;

pub use context::TaskContext;
pub use instance::{FailureRecord, INIT_STAGE, ParentLink, StageMark, StageRecord, TaskInstance};
pub use params::Params;
pub use stage::{HandlerFuture, StageHandler, StageTable, TaskLogic, handler_name};
