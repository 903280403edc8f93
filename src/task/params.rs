// src/task/params.rs

//! Open-ended, mergeable key/value document carried by every task.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::{EngineError, Result};

/// Key under which non-object values are stored by [`Params::from_value`].
pub const RESULT_KEY: &str = "result";

/// Task parameters.
///
/// Kept as a JSON object so that documents written by older task versions
/// still load. Handlers read them through a typed view with [`Params::view`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Params(Map<String, Value>);

impl Params {
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Serialize a typed value object into params. It must serialize to a
    /// JSON object.
    pub fn from_typed<V: Serialize>(value: &V) -> Result<Self> {
        match serde_json::to_value(value)? {
            Value::Object(map) => Ok(Self(map)),
            other => Err(EngineError::Config(format!(
                "params must serialize to an object, got {other}"
            ))),
        }
    }

    /// Wrap an arbitrary outcome payload. Objects are taken as-is, `null`
    /// becomes empty params, anything else is stored under [`RESULT_KEY`].
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Object(map) => Self(map),
            Value::Null => Self::new(),
            other => Self::new().with(RESULT_KEY, other),
        }
    }

    /// Deserialize the whole document into a typed view.
    pub fn view<V: DeserializeOwned>(&self) -> Result<V> {
        Ok(serde_json::from_value(Value::Object(self.0.clone()))?)
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn get_as<V: DeserializeOwned>(&self, key: &str) -> Result<Option<V>> {
        self.0
            .get(key)
            .map(|v| serde_json::from_value(v.clone()))
            .transpose()
            .map_err(EngineError::from)
    }

    /// Boolean flag, `false` when absent or not a bool.
    pub fn flag(&self, key: &str) -> bool {
        self.0.get(key).and_then(Value::as_bool).unwrap_or(false)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Merge `other` into `self`. Existing keys not present in `other` are
    /// kept; keys present in both take the value from `other`.
    pub fn merge(&mut self, other: Params) {
        for (key, value) in other.0 {
            self.0.insert(key, value);
        }
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }
}

impl From<Map<String, Value>> for Params {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}
