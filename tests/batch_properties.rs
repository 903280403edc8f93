// tests/batch_properties.rs

mod common;
use crate::common::builders::{Item, drain_names, item_graph};

use std::collections::{BTreeSet, HashMap};

use proptest::prelude::*;
use stagehand::dag::topological_sort;
use stagehand::errors::EngineError;

// Acyclic item sets: item N may only depend on items 0..N-1.
fn acyclic_items_strategy(max_items: usize) -> impl Strategy<Value = Vec<Item>> {
    (1..=max_items).prop_flat_map(|count| {
        proptest::collection::vec(proptest::collection::vec(any::<usize>(), 0..count), count)
            .prop_map(move |raw_deps| {
                raw_deps
                    .into_iter()
                    .enumerate()
                    .map(|(i, potential)| {
                        let deps: BTreeSet<String> = potential
                            .into_iter()
                            .filter(|_| i > 0)
                            .map(|d| format!("c{}", d % i))
                            .collect();
                        let deps: Vec<&str> = deps.iter().map(String::as_str).collect();
                        Item::new(&format!("c{i}"), &deps)
                    })
                    .collect()
            })
    })
}

// Acyclic set plus one back edge from an early item onto a later one that
// (transitively) depends on it.
fn cyclic_items_strategy(max_items: usize) -> impl Strategy<Value = Vec<Item>> {
    (2..=max_items).prop_map(|count| {
        let mut items: Vec<Item> = (0..count)
            .map(|i| {
                let deps: Vec<String> = if i == 0 {
                    Vec::new()
                } else {
                    vec![format!("c{}", i - 1)]
                };
                let deps: Vec<&str> = deps.iter().map(String::as_str).collect();
                Item::new(&format!("c{i}"), &deps)
            })
            .collect();
        items[0].deps.push(format!("c{}", count - 1));
        items
    })
}

proptest! {
    #[test]
    fn every_item_is_returned_once_after_its_dependencies(items in acyclic_items_strategy(12)) {
        let mut graph = item_graph(&items).unwrap();
        let waves = drain_names(&mut graph, &items).unwrap();

        let mut wave_of: HashMap<String, usize> = HashMap::new();
        for (n, wave) in waves.iter().enumerate() {
            for name in wave {
                prop_assert!(wave_of.insert(name.clone(), n).is_none(), "{} returned twice", name);
            }
        }
        prop_assert_eq!(wave_of.len(), items.len());

        for item in &items {
            let own = wave_of[&item.name];
            for dep in &item.deps {
                prop_assert!(wave_of[dep] < own, "{} ran before its dependency {}", item.name, dep);
            }
        }
        prop_assert!(graph.is_finished());
    }

    #[test]
    fn cycles_are_rejected_before_any_batch(items in cyclic_items_strategy(8)) {
        let built = item_graph(&items);
        prop_assert!(matches!(built, Err(EngineError::CircularDependency(_))));

        let sorted = topological_sort(&items, |i| i.id.clone(), |i| i.name.clone(), |i| i.deps.clone());
        prop_assert!(matches!(sorted, Err(EngineError::CircularDependency(_))));
    }

    #[test]
    fn decoded_graph_yields_the_same_waves(items in acyclic_items_strategy(10), skip in 0usize..4) {
        let mut original = item_graph(&items).unwrap();
        for _ in 0..skip {
            let _ = drain_one(&mut original, &items);
        }

        let mut decoded = stagehand::dag::DependencyBatchGraph::from_value(&original.to_value().unwrap()).unwrap();
        prop_assert_eq!(&decoded, &original);

        let rest_original = drain_names(&mut original, &items).unwrap();
        let rest_decoded = drain_names(&mut decoded, &items).unwrap();
        prop_assert_eq!(rest_original, rest_decoded);
    }
}

fn drain_one(graph: &mut stagehand::dag::DependencyBatchGraph, items: &[Item]) -> Option<Vec<Item>> {
    graph
        .next_batch(|id: &str| {
            items
                .iter()
                .find(|i| i.id == id)
                .cloned()
                .ok_or_else(|| EngineError::TargetNotFound(id.to_string()))
        })
        .unwrap()
}
