// src/task/stage.rs

//! Task logic declaration: the `on_init` entry point plus a table mapping each
//! stage name to its success handler and optional failure handler.
//!
//! Handlers are plain function pointers registered when the task type is
//! defined, so a stage without a success handler cannot be declared at all.
//! A missing failure handler falls back to failing the task with the
//! delivered reason.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::entity::EntityHandle;
use crate::errors::{EngineError, Result};
use crate::task::context::TaskContext;
use crate::task::instance::INIT_STAGE;
use crate::types::{BoxFuture, Outcome};

pub type HandlerFuture<'a> = BoxFuture<'a, Result<()>>;

/// Stage continuation: `(logic, ctx, fresh target entity, outcome data)`.
pub type StageHandler<T> =
    for<'a> fn(&'a T, &'a mut TaskContext, EntityHandle, Value) -> HandlerFuture<'a>;

/// Behaviour of one task type.
///
/// A handler must end by calling one of `set_stage` (after kicking off the
/// work whose outcome is awaited), `set_stage_complete` or `set_stage_failed`
/// on its [`TaskContext`].
pub trait TaskLogic: Send + Sync + Sized + 'static {
    /// Registered type name.
    const NAME: &'static str;

    /// First handler of a new task; `body` is the creation params document.
    fn on_init<'a>(
        &'a self,
        ctx: &'a mut TaskContext,
        target: EntityHandle,
        body: Value,
    ) -> HandlerFuture<'a>;

    fn stages(&self) -> StageTable<Self>;
}

struct StageHandlers<T> {
    on_complete: StageHandler<T>,
    on_failed: Option<StageHandler<T>>,
}

/// Stage name -> handlers, built with [`StageTable::stage`] and
/// [`StageTable::stage_with_failure`].
pub struct StageTable<T> {
    entries: BTreeMap<String, StageHandlers<T>>,
    duplicates: Vec<String>,
}

impl<T> Default for StageTable<T> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
            duplicates: Vec::new(),
        }
    }
}

impl<T> StageTable<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a stage whose failure simply fails the task.
    pub fn stage(self, name: &str, on_complete: StageHandler<T>) -> Self {
        self.insert(name, on_complete, None)
    }

    pub fn stage_with_failure(
        self,
        name: &str,
        on_complete: StageHandler<T>,
        on_failed: StageHandler<T>,
    ) -> Self {
        self.insert(name, on_complete, Some(on_failed))
    }

    fn insert(
        mut self,
        name: &str,
        on_complete: StageHandler<T>,
        on_failed: Option<StageHandler<T>>,
    ) -> Self {
        let handlers = StageHandlers {
            on_complete,
            on_failed,
        };
        if self.entries.insert(name.to_string(), handlers).is_some() {
            self.duplicates.push(name.to_string());
        }
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn validate(&self, task_type: &str) -> Result<()> {
        if let Some(dup) = self.duplicates.first() {
            return Err(EngineError::Config(format!(
                "task type '{task_type}' declares stage '{dup}' more than once"
            )));
        }
        for name in self.entries.keys() {
            if name.trim().is_empty() || name == INIT_STAGE {
                return Err(EngineError::Config(format!(
                    "task type '{task_type}' declares invalid stage name '{name}'"
                )));
            }
        }
        Ok(())
    }
}

/// Log-friendly handler name: `On<Stage>Complete` / `On<Stage>CompleteFailed`.
pub fn handler_name(stage: &str, outcome: Outcome) -> String {
    let stage = if stage == INIT_STAGE { "Init" } else { stage };
    match outcome {
        Outcome::Success => format!("On{stage}Complete"),
        Outcome::Failure => format!("On{stage}CompleteFailed"),
    }
}

/// Type-erased task prototype stored in the registry.
pub(crate) trait ErasedTask: Send + Sync {
    fn name(&self) -> &'static str;

    fn has_stage(&self, stage: &str) -> bool;

    /// Check that a handler exists for `(stage, outcome)`.
    fn resolve(&self, stage: &str, outcome: Outcome) -> Result<()>;

    fn invoke<'a>(
        &'a self,
        stage: &'a str,
        outcome: Outcome,
        ctx: &'a mut TaskContext,
        target: EntityHandle,
        data: Value,
    ) -> HandlerFuture<'a>;
}

pub(crate) struct Prototype<T> {
    logic: T,
    table: StageTable<T>,
}

impl<T: TaskLogic> Prototype<T> {
    pub(crate) fn new(logic: T) -> Result<Self> {
        let table = logic.stages();
        table.validate(T::NAME)?;
        Ok(Self { logic, table })
    }
}

impl<T: TaskLogic> ErasedTask for Prototype<T> {
    fn name(&self) -> &'static str {
        T::NAME
    }

    fn has_stage(&self, stage: &str) -> bool {
        self.table.contains(stage)
    }

    fn resolve(&self, stage: &str, outcome: Outcome) -> Result<()> {
        if stage == INIT_STAGE || self.table.contains(stage) {
            Ok(())
        } else {
            Err(EngineError::HandlerNotFound {
                task_type: T::NAME.to_string(),
                handler: handler_name(stage, outcome),
            })
        }
    }

    fn invoke<'a>(
        &'a self,
        stage: &'a str,
        outcome: Outcome,
        ctx: &'a mut TaskContext,
        target: EntityHandle,
        data: Value,
    ) -> HandlerFuture<'a> {
        if stage == INIT_STAGE {
            return match outcome {
                Outcome::Success => self.logic.on_init(ctx, target, data),
                Outcome::Failure => fail_with(ctx, data),
            };
        }

        let Some(handlers) = self.table.entries.get(stage) else {
            let err = EngineError::HandlerNotFound {
                task_type: T::NAME.to_string(),
                handler: handler_name(stage, outcome),
            };
            return Box::pin(async move { Err(err) });
        };

        match (outcome, handlers.on_failed) {
            (Outcome::Success, _) => (handlers.on_complete)(&self.logic, ctx, target, data),
            (Outcome::Failure, Some(on_failed)) => on_failed(&self.logic, ctx, target, data),
            (Outcome::Failure, None) => fail_with(ctx, data),
        }
    }
}

fn fail_with<'a>(ctx: &'a mut TaskContext, reason: Value) -> HandlerFuture<'a> {
    Box::pin(async move { ctx.set_stage_failed(reason).await })
}
