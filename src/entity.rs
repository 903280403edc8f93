// src/entity.rs

//! Target entity capability.
//!
//! Tasks never hold on to their target between stages. The dispatcher
//! re-fetches it from an [`EntityStore`] by [`TargetRef`] before every handler
//! invocation and hands it over as an [`EntityHandle`].

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::errors::{EngineError, Result};
use crate::types::{BoxFuture, Credential, TargetRef};

/// Status written by the engine when a handler crashes.
pub const STATUS_UNKNOWN: &str = "unknown";

/// A domain object a task operates on.
pub trait TargetEntity: Send + Sync + 'static {
    fn id(&self) -> &str;

    fn kind(&self) -> &str;

    /// Display name; defaults to the id.
    fn name(&self) -> &str {
        self.id()
    }

    fn status(&self) -> String;

    /// Record a user-visible status and reason on behalf of `owner`.
    fn set_status<'a>(
        &'a self,
        owner: &'a Credential,
        status: &'a str,
        reason: &'a str,
    ) -> BoxFuture<'a, Result<()>>;

    fn as_any(&self) -> &dyn Any;
}

pub type EntityHandle = Arc<dyn TargetEntity>;

pub fn target_of(entity: &EntityHandle) -> TargetRef {
    TargetRef::new(entity.kind(), entity.id())
}

/// Borrow the concrete entity type behind a handle.
pub fn downcast<T: TargetEntity>(entity: &EntityHandle) -> Result<&T> {
    entity.as_any().downcast_ref::<T>().ok_or_else(|| {
        EngineError::TargetNotFound(format!(
            "{}/{} (not a {})",
            entity.kind(),
            entity.id(),
            std::any::type_name::<T>()
        ))
    })
}

/// Owning store of target entities.
pub trait EntityStore: Send + Sync {
    fn fetch<'a>(&'a self, target: &'a TargetRef) -> BoxFuture<'a, Result<EntityHandle>>;
}

/// In-process entity store keyed by [`TargetRef`].
#[derive(Default)]
pub struct MemoryEntityStore {
    entities: RwLock<HashMap<TargetRef, EntityHandle>>,
}

impl MemoryEntityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, entity: EntityHandle) {
        let key = target_of(&entity);
        if let Ok(mut map) = self.entities.write() {
            map.insert(key, entity);
        }
    }

    pub fn remove(&self, target: &TargetRef) -> Option<EntityHandle> {
        self.entities.write().ok()?.remove(target)
    }

    pub fn get(&self, target: &TargetRef) -> Option<EntityHandle> {
        self.entities.read().ok()?.get(target).cloned()
    }
}

impl EntityStore for MemoryEntityStore {
    fn fetch<'a>(&'a self, target: &'a TargetRef) -> BoxFuture<'a, Result<EntityHandle>> {
        Box::pin(async move {
            self.get(target)
                .ok_or_else(|| EngineError::TargetNotFound(target.to_string()))
        })
    }
}
