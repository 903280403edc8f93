// src/dag/mod.rs

//! Dependency ordering.
//!
//! - [`batch`] holds the serializable wave scheduler used by orchestrating
//!   tasks, plus the pure [`topological_sort`] acyclic check.

pub mod batch;

pub use batch::{DependencyBatchGraph, topological_sort};
