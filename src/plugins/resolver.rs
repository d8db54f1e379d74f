//! Dependency ordering for plugin initialization

use std::collections::{HashMap, HashSet};
use tracing::warn;

/// Order `pending` so that every plugin comes after the dependencies it declares.
///
/// `graph` maps every registered plugin name to its declared dependency names.
/// Dependencies missing from `graph` are skipped with a warning. A dependency
/// that is still being visited closes a cycle; that edge is skipped with a
/// warning. Registered plugins outside `pending` are traversed for ordering
/// but never emitted, so each pending name appears exactly once.
#[must_use]
pub fn resolve_order(pending: &[String], graph: &HashMap<String, Vec<String>>) -> Vec<String> {
    let mut sort = TopologicalSort {
        graph,
        wanted: pending.iter().map(String::as_str).collect(),
        visiting: HashSet::new(),
        visited: HashSet::new(),
        sorted: Vec::with_capacity(pending.len()),
    };

    for name in pending {
        sort.visit(name);
    }
    sort.sorted
}

struct TopologicalSort<'a> {
    graph: &'a HashMap<String, Vec<String>>,
    wanted: HashSet<&'a str>,
    visiting: HashSet<&'a str>,
    visited: HashSet<&'a str>,
    sorted: Vec<String>,
}

impl<'a> TopologicalSort<'a> {
    fn visit(&mut self, name: &'a str) {
        if self.visited.contains(name) {
            return;
        }
        self.visiting.insert(name);

        let graph = self.graph;
        for dependency in graph.get(name).into_iter().flatten() {
            let dependency = dependency.as_str();
            if self.visiting.contains(dependency) {
                warn!(
                    plugin = name,
                    dependency, "Circular dependency detected, skipping edge"
                );
            } else if graph.contains_key(dependency) {
                self.visit(dependency);
            } else {
                warn!(plugin = name, dependency, "Dependency not found");
            }
        }

        self.visiting.remove(name);
        self.visited.insert(name);
        if self.wanted.contains(name) {
            self.sorted.push(name.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn graph(edges: &[(&str, &[&str])]) -> HashMap<String, Vec<String>> {
        edges
            .iter()
            .map(|(name, deps)| {
                (
                    (*name).to_string(),
                    deps.iter().map(|d| (*d).to_string()).collect(),
                )
            })
            .collect()
    }

    fn names(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| (*n).to_string()).collect()
    }

    fn position(order: &[String], name: &str) -> usize {
        order.iter().position(|n| n == name).unwrap()
    }

    #[test]
    fn test_chain_is_ordered() {
        let g = graph(&[("c", &["b"]), ("b", &["a"]), ("a", &[])]);
        let order = resolve_order(&names(&["c", "b", "a"]), &g);
        assert_eq!(order, names(&["a", "b", "c"]));
    }

    #[test]
    fn test_missing_dependency_is_skipped() {
        let g = graph(&[("a", &["ghost"])]);
        let order = resolve_order(&names(&["a"]), &g);
        assert_eq!(order, names(&["a"]));
    }

    #[test]
    fn test_cycle_keeps_both_nodes_once() {
        let g = graph(&[("a", &["b"]), ("b", &["a"])]);
        let order = resolve_order(&names(&["a", "b"]), &g);
        assert_eq!(order, names(&["b", "a"]));
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let g = graph(&[("a", &["a"])]);
        assert_eq!(resolve_order(&names(&["a"]), &g), names(&["a"]));
    }

    #[test]
    fn test_registered_but_not_pending_is_not_emitted() {
        // `base` is already initialized; only `app` and `lib` are pending
        let g = graph(&[("app", &["base", "lib"]), ("lib", &["base"]), ("base", &[])]);
        let order = resolve_order(&names(&["app", "lib"]), &g);
        assert_eq!(order, names(&["lib", "app"]));
    }

    #[test]
    fn test_duplicate_pending_names_appear_once() {
        let g = graph(&[("a", &[])]);
        assert_eq!(resolve_order(&names(&["a", "a"]), &g), names(&["a"]));
    }

    fn arbitrary_graph() -> impl Strategy<Value = HashMap<String, Vec<String>>> {
        (1usize..12).prop_flat_map(|size| {
            prop::collection::vec(prop::collection::vec(0usize..size + 3, 0..4), size).prop_map(
                move |deps| {
                    deps.into_iter()
                        .enumerate()
                        .map(|(i, targets)| {
                            (
                                format!("p{i}"),
                                targets.into_iter().map(|t| format!("p{t}")).collect(),
                            )
                        })
                        .collect()
                },
            )
        })
    }

    proptest! {
        #[test]
        fn prop_every_pending_node_appears_exactly_once(g in arbitrary_graph()) {
            let mut pending: Vec<String> = g.keys().cloned().collect();
            pending.sort();
            let order = resolve_order(&pending, &g);

            prop_assert_eq!(order.len(), pending.len());
            let unique: HashSet<&String> = order.iter().collect();
            prop_assert_eq!(unique.len(), pending.len());
        }

        #[test]
        fn prop_acyclic_dependencies_come_first(size in 1usize..12, seed in prop::collection::vec(any::<bool>(), 144)) {
            // edges only point to lower indices, so the graph has no cycles
            let g: HashMap<String, Vec<String>> = (0..size)
                .map(|i| {
                    let deps = (0..i)
                        .filter(|j| seed[i * 12 + j])
                        .map(|j| format!("p{j}"))
                        .collect();
                    (format!("p{i}"), deps)
                })
                .collect();
            let pending: Vec<String> = (0..size).rev().map(|i| format!("p{i}")).collect();
            let order = resolve_order(&pending, &g);

            for (name, deps) in &g {
                for dep in deps {
                    prop_assert!(position(&order, dep) < position(&order, name));
                }
            }
        }
    }
}
