// tests/batch_scheduler.rs

mod common;
use crate::common::builders::{Item, drain_names, item_graph};
use crate::common::init_tracing;

use std::error::Error;

use stagehand::dag::{DependencyBatchGraph, topological_sort};
use stagehand::errors::EngineError;

type TestResult = Result<(), Box<dyn Error>>;

fn fetch<'a>(items: &'a [Item]) -> impl FnMut(&str) -> stagehand::errors::Result<Item> + 'a {
    move |id: &str| {
        items
            .iter()
            .find(|i| i.id == id)
            .cloned()
            .ok_or_else(|| EngineError::TargetNotFound(id.to_string()))
    }
}

#[test]
fn chain_yields_one_item_per_wave_then_finishes() -> TestResult {
    init_tracing();

    let items = vec![
        Item::new("c1", &[]),
        Item::new("c2", &["c1"]),
        Item::new("c3", &["c2"]),
    ];
    let mut graph = item_graph(&items)?;

    let first = graph.next_batch(fetch(&items))?.expect("first wave");
    assert_eq!(first, vec![items[0].clone()]);
    let second = graph.next_batch(fetch(&items))?.expect("second wave");
    assert_eq!(second, vec![items[1].clone()]);
    let third = graph.next_batch(fetch(&items))?.expect("third wave");
    assert_eq!(third, vec![items[2].clone()]);

    assert!(!graph.is_finished());
    assert!(graph.next_batch(fetch(&items))?.is_none());
    assert!(graph.is_finished());

    // Exhausted graphs keep answering None.
    assert!(graph.next_batch(fetch(&items))?.is_none());
    Ok(())
}

#[test]
fn two_item_cycle_fails_construction_and_sort() {
    init_tracing();

    let items = vec![Item::new("c1", &["c2"]), Item::new("c2", &["c1"])];

    match item_graph(&items) {
        Err(EngineError::CircularDependency(members)) => {
            assert!(members.contains("id-c1"));
            assert!(members.contains("id-c2"));
        }
        Err(e) => panic!("Expected CircularDependency, got: {:?}", e),
        Ok(_) => panic!("Expected error, got a graph"),
    }

    let sorted = topological_sort(
        &items,
        |i| i.id.clone(),
        |i| i.name.clone(),
        |i| i.deps.clone(),
    );
    assert!(matches!(sorted, Err(EngineError::CircularDependency(_))));
}

#[test]
fn diamond_runs_independent_items_in_the_same_wave() -> TestResult {
    let items = vec![
        Item::new("db", &[]),
        Item::new("cache", &["db"]),
        Item::new("queue", &["db"]),
        Item::new("api", &["cache", "queue"]),
    ];
    let mut graph = item_graph(&items)?;

    let mut fan_out = graph.dependents_of("id-db").to_vec();
    fan_out.sort();
    assert_eq!(fan_out, vec!["id-cache".to_string(), "id-queue".to_string()]);
    assert_eq!(graph.dependents_of("id-cache"), ["id-api".to_string()]);
    assert!(graph.dependents_of("id-api").is_empty());
    assert!(graph.dependents_of("id-nope").is_empty());

    let waves = drain_names(&mut graph, &items)?;
    assert_eq!(
        waves,
        vec![
            vec!["db".to_string()],
            vec!["cache".to_string(), "queue".to_string()],
            vec!["api".to_string()],
        ]
    );
    assert!(graph.is_finished());
    Ok(())
}

#[test]
fn unknown_dependency_name_is_reported() {
    let items = vec![Item::new("web", &["ghost"])];

    match item_graph(&items) {
        Err(EngineError::UnresolvedDependency { item, dependency }) => {
            assert_eq!(item, "web");
            assert_eq!(dependency, "ghost");
        }
        Err(e) => panic!("Expected UnresolvedDependency, got: {:?}", e),
        Ok(_) => panic!("Expected error, got a graph"),
    }
}

#[test]
fn duplicate_dependency_entries_count_once() -> TestResult {
    let items = vec![Item::new("a", &[]), Item::new("b", &["a", "a"])];
    let mut graph = item_graph(&items)?;

    assert_eq!(graph.indegree().get("id-b"), Some(&1));
    let waves = drain_names(&mut graph, &items)?;
    assert_eq!(waves.len(), 2);
    Ok(())
}

#[test]
fn empty_item_set_finishes_immediately() -> TestResult {
    let items: Vec<Item> = Vec::new();
    let mut graph = item_graph(&items)?;

    assert!(graph.is_empty());
    assert!(graph.next_batch(fetch(&items))?.is_none());
    assert!(graph.is_finished());
    Ok(())
}

#[test]
fn failed_fetch_leaves_the_graph_untouched() -> TestResult {
    let items = vec![Item::new("a", &[]), Item::new("b", &["a"])];
    let mut graph = item_graph(&items)?;
    let before = graph.clone();

    let result = graph.next_batch(|id: &str| -> stagehand::errors::Result<Item> {
        Err(EngineError::TargetNotFound(id.to_string()))
    });
    assert!(matches!(result, Err(EngineError::TargetNotFound(_))));
    assert_eq!(graph, before);

    // The wave is still available afterwards.
    let wave = graph.next_batch(fetch(&items))?.expect("wave after retry");
    assert_eq!(wave[0].name, "a");
    Ok(())
}

#[test]
fn graph_resumes_from_its_serialized_form() -> TestResult {
    init_tracing();

    let items = vec![
        Item::new("a", &[]),
        Item::new("b", &["a"]),
        Item::new("c", &["a"]),
        Item::new("d", &["b"]),
    ];
    let mut original = item_graph(&items)?;
    original.next_batch(fetch(&items))?;

    let encoded = original.to_value()?;
    assert!(encoded.get("finished").is_none());
    let mut decoded = DependencyBatchGraph::from_value(&encoded)?;

    assert_eq!(decoded.frontier(), original.frontier());
    assert_eq!(decoded.indegree(), original.indegree());
    assert_eq!(decoded, original);

    let from_original = original.next_batch(fetch(&items))?;
    let from_decoded = decoded.next_batch(fetch(&items))?;
    assert_eq!(from_original, from_decoded);
    assert_eq!(decoded, original);

    // Params store the graph as JSON text inside the task document.
    let text = serde_json::to_string(&decoded)?;
    let reparsed: DependencyBatchGraph = serde_json::from_str(&text)?;
    assert_eq!(reparsed, decoded);
    Ok(())
}

#[test]
fn topological_sort_orders_dependencies_first() -> TestResult {
    let items = vec![
        Item::new("c3", &["c2"]),
        Item::new("c2", &["c1"]),
        Item::new("c1", &[]),
    ];
    let order = topological_sort(
        &items,
        |i| i.id.clone(),
        |i| i.name.clone(),
        |i| i.deps.clone(),
    )?;
    assert_eq!(order, vec!["id-c1", "id-c2", "id-c3"]);
    Ok(())
}
