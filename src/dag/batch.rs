// src/dag/batch.rs

//! Wave-by-wave dependency scheduler whose whole state is serializable.
//!
//! The graph is built once from a set of items carrying `depends_on` names and
//! then consumed with [`DependencyBatchGraph::next_batch`]. Each call returns a
//! wave of mutually independent items. Because the state is plain data it can
//! be stored inside a task's params between stages and resumed after a
//! process restart.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::errors::{EngineError, Result};

/// Adjacency / indegree / frontier state of a batch computation.
///
/// Wire format: `{graph: {id: [dependent ids]}, indegree: {id: n},
/// frontier: [ids], finished: bool}` (`finished` omitted while false).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyBatchGraph {
    /// Item id -> ids of the items that depend on it.
    graph: BTreeMap<String, Vec<String>>,
    /// Item id -> number of unresolved dependencies.
    indegree: BTreeMap<String, usize>,
    /// Ids with no unresolved dependencies, not yet returned in a batch.
    frontier: Vec<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    finished: bool,
}

impl DependencyBatchGraph {
    /// Build the graph, failing fast on unresolved dependency names or cycles.
    ///
    /// - `id_of` gives the stable id used in the graph state.
    /// - `name_of` gives the display name that `deps_of` entries refer to.
    /// - `deps_of` lists the names an item depends on.
    pub fn new<T, I, N, D>(items: &[T], id_of: I, name_of: N, deps_of: D) -> Result<Self>
    where
        I: Fn(&T) -> String,
        N: Fn(&T) -> String,
        D: Fn(&T) -> Vec<String>,
    {
        let graph = Self::construct(items, id_of, name_of, deps_of)?;
        let ordered = graph.clone().drain_order();
        if ordered.len() < graph.indegree.len() {
            return Err(EngineError::CircularDependency(graph.cycle_members(&ordered)));
        }
        debug!(
            items = graph.indegree.len(),
            roots = graph.frontier.len(),
            "built dependency batch graph"
        );
        Ok(graph)
    }

    /// Rebuild from the JSON form stored in task params.
    pub fn from_value(value: &Value) -> Result<Self> {
        Ok(serde_json::from_value(value.clone())?)
    }

    /// JSON form suitable for storing in task params.
    pub fn to_value(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn frontier(&self) -> &[String] {
        &self.frontier
    }

    pub fn indegree(&self) -> &BTreeMap<String, usize> {
        &self.indegree
    }

    /// Ids that depend directly on `id`.
    pub fn dependents_of(&self, id: &str) -> &[String] {
        self.graph.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.indegree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indegree.is_empty()
    }

    /// Return the next wave of items, or `None` once everything was returned.
    ///
    /// `fetch` turns an id back into the full item. All fetches happen before
    /// any state is mutated, so a failed fetch leaves the graph untouched.
    pub fn next_batch<T, F>(&mut self, mut fetch: F) -> Result<Option<Vec<T>>>
    where
        F: FnMut(&str) -> Result<T>,
    {
        if self.frontier.is_empty() {
            self.finished = true;
            return Ok(None);
        }

        let batch = self
            .frontier
            .iter()
            .map(|id| fetch(id))
            .collect::<Result<Vec<T>>>()?;

        let next = self.advance();
        debug!(
            batch = batch.len(),
            next_frontier = next.len(),
            "computed dependency wave"
        );
        self.frontier = next;
        Ok(Some(batch))
    }

    fn construct<T, I, N, D>(items: &[T], id_of: I, name_of: N, deps_of: D) -> Result<Self>
    where
        I: Fn(&T) -> String,
        N: Fn(&T) -> String,
        D: Fn(&T) -> Vec<String>,
    {
        let mut id_by_name: HashMap<String, String> = HashMap::new();
        let mut graph: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let mut indegree: BTreeMap<String, usize> = BTreeMap::new();

        for item in items {
            let id = id_of(item);
            let name = name_of(item);
            if id_by_name.insert(name.clone(), id.clone()).is_some() {
                return Err(EngineError::Config(format!("duplicate item name '{name}'")));
            }
            if indegree.insert(id.clone(), 0).is_some() {
                return Err(EngineError::Config(format!("duplicate item id '{id}'")));
            }
            graph.insert(id, Vec::new());
        }

        for item in items {
            let id = id_of(item);
            let deps: BTreeSet<String> = deps_of(item).into_iter().collect();
            for dep in deps {
                let dep_id = id_by_name.get(&dep).ok_or_else(|| {
                    EngineError::UnresolvedDependency {
                        item: name_of(item),
                        dependency: dep.clone(),
                    }
                })?;
                if let Some(count) = indegree.get_mut(&id) {
                    *count += 1;
                }
                if let Some(dependents) = graph.get_mut(dep_id) {
                    dependents.push(id.clone());
                }
            }
        }

        let frontier = indegree
            .iter()
            .filter(|(_, n)| **n == 0)
            .map(|(id, _)| id.clone())
            .collect();

        Ok(Self {
            graph,
            indegree,
            frontier,
            finished: false,
        })
    }

    /// Decrement the neighbours of the current frontier and return the ids
    /// whose indegree reached zero.
    fn advance(&mut self) -> Vec<String> {
        let mut next = Vec::new();
        for id in &self.frontier {
            let Some(dependents) = self.graph.get(id) else {
                continue;
            };
            for dependent in dependents {
                if let Some(count) = self.indegree.get_mut(dependent) {
                    *count = count.saturating_sub(1);
                    if *count == 0 {
                        next.push(dependent.clone());
                    }
                }
            }
        }
        next.sort();
        next
    }

    /// Consume every wave and return the ids in dequeue order.
    fn drain_order(mut self) -> Vec<String> {
        let mut order = Vec::new();
        while !self.frontier.is_empty() {
            order.extend(self.frontier.iter().cloned());
            self.frontier = self.advance();
        }
        order
    }

    fn cycle_members(&self, ordered: &[String]) -> String {
        let done: BTreeSet<&String> = ordered.iter().collect();
        self.indegree
            .keys()
            .filter(|id| !done.contains(id))
            .cloned()
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Pure acyclic check: the dependency-respecting order of item ids.
///
/// Performs the same construction as [`DependencyBatchGraph::new`] and fails
/// with [`EngineError::CircularDependency`] when fewer items are dequeued than
/// exist, without returning a partial order.
pub fn topological_sort<T, I, N, D>(items: &[T], id_of: I, name_of: N, deps_of: D) -> Result<Vec<String>>
where
    I: Fn(&T) -> String,
    N: Fn(&T) -> String,
    D: Fn(&T) -> Vec<String>,
{
    let graph = DependencyBatchGraph::construct(items, id_of, name_of, deps_of)?;
    let total = graph.len();
    let ordered = graph.clone().drain_order();
    if ordered.len() < total {
        return Err(EngineError::CircularDependency(graph.cycle_members(&ordered)));
    }
    Ok(ordered)
}
