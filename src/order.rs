//! Execution order over a validated dependency graph.
//!
//! The resolver counts the unresolved incoming edges of every task, seeds the
//! tasks with no dependencies and releases each dependent once its count drops
//! to zero. Among the tasks ready at the same time, the one added to the flow
//! first goes first, which keeps the order reproducible for a given flow.

use std::collections::{BTreeSet, HashMap};

use petgraph::Direction;
use petgraph::graph::NodeIndex;

use crate::error::GraphError;
use crate::graph::DependencyGraph;

/// Returns every task index of the graph so that each provider precedes all
/// of its consumers.
pub(crate) fn resolve(graph: &DependencyGraph) -> Result<Vec<NodeIndex>, GraphError> {
    let graph = &graph.graph;

    let mut dependency_counts: HashMap<NodeIndex, usize> = graph
        .node_indices()
        .map(|index| {
            (
                index,
                graph
                    .neighbors_directed(index, Direction::Incoming)
                    .count(),
            )
        })
        .collect();

    let mut ready: BTreeSet<NodeIndex> = dependency_counts
        .iter()
        .filter(|&(_, &count)| count == 0)
        .map(|(&index, _)| index)
        .collect();

    let mut order = Vec::with_capacity(graph.node_count());

    while let Some(index) = ready.pop_first() {
        order.push(index);

        // One decrement per edge, a provider of several names appears once per name.
        for dependent in graph.neighbors_directed(index, Direction::Outgoing) {
            if let Some(count) = dependency_counts.get_mut(&dependent) {
                *count -= 1;
                if *count == 0 {
                    ready.insert(dependent);
                }
            }
        }
    }

    // Unreachable for a graph built by `DependencyGraph::build`, which already
    // rejects cycles.
    if order.len() != graph.node_count() {
        let tasks = dependency_counts
            .into_iter()
            .filter(|&(_, count)| count > 0)
            .map(|(index, _)| index)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .map(|index| graph[index].clone())
            .collect();

        return Err(GraphError::Cycle { tasks });
    }

    tracing::debug!(
        order = ?order.iter().map(|&i| graph[i].as_str()).collect::<Vec<_>>(),
        "resolved execution order"
    );

    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::tests::decl;

    fn names(graph: &DependencyGraph, order: &[NodeIndex]) -> Vec<String> {
        order.iter().map(|&i| graph.graph[i].clone()).collect()
    }

    #[test]
    fn test_providers_precede_consumers() {
        let tasks = vec![
            decl("test1", &["a", "b"], &["c", "d", "e"]),
            decl("test2", &["c", "d", "e"], &[]),
            decl("test3", &["c", "d"], &[]),
            decl("test4", &["z"], &["a", "b", "c", "d", "e"]),
            decl("test5", &["y"], &["z"]),
            decl("test6", &[], &["y"]),
        ];

        let graph = DependencyGraph::build(&tasks).unwrap();
        let order = names(&graph, &resolve(&graph).unwrap());

        let mut head = order[0..2].to_vec();
        head.sort();
        assert_eq!(head, vec!["test2", "test3"]);
        assert_eq!(order[2..], ["test1", "test4", "test5", "test6"]);
    }

    #[test]
    fn test_every_edge_respected() {
        let tasks = vec![
            decl("d", &[], &["b", "c"]),
            decl("c", &["c"], &["a"]),
            decl("b", &["b"], &["a"]),
            decl("a", &["a"], &[]),
        ];

        let graph = DependencyGraph::build(&tasks).unwrap();
        let order = names(&graph, &resolve(&graph).unwrap());
        let position = |name: &str| order.iter().position(|n| n == name).unwrap();

        for (provider, consumer, _) in graph.edges() {
            assert!(position(provider) < position(consumer));
        }
        assert_eq!(order.first().map(String::as_str), Some("a"));
        assert_eq!(order.last().map(String::as_str), Some("d"));
    }

    #[test]
    fn test_ties_follow_insertion_order() {
        let tasks = vec![
            decl("z", &["1"], &[]),
            decl("y", &["2"], &[]),
            decl("x", &["3"], &[]),
        ];

        let graph = DependencyGraph::build(&tasks).unwrap();
        assert_eq!(names(&graph, &resolve(&graph).unwrap()), ["z", "y", "x"]);
    }

    #[test]
    fn test_empty_graph() {
        let graph = DependencyGraph::build(&[]).unwrap();
        assert!(resolve(&graph).unwrap().is_empty());
    }
}
