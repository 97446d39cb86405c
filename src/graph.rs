//! Dependency graph inferred from provided and required names.
//!
//! Each task becomes one node, added in the order the tasks were added to the
//! flow, so a node index doubles as the position of the task in the flow.
//! An edge `P -> T` labelled `name` means that `T` requires `name` and `P`
//! provides it. A name provided by several tasks yields one edge per provider,
//! so a consumer waits for all of them.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use petgraph::Direction;
use petgraph::algo::{tarjan_scc, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;

use crate::error::GraphError;
use crate::task::Task;

/// A validated, acyclic provider to consumer graph over the tasks of a flow.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    pub(crate) graph: DiGraph<String, String>,
}

impl DependencyGraph {
    /// Builds the graph and checks that it is complete and acyclic.
    pub(crate) fn build(tasks: &[Box<dyn Task>]) -> Result<Self, GraphError> {
        let mut graph = DiGraph::with_capacity(tasks.len(), tasks.len());
        let mut providers: BTreeMap<&str, Vec<NodeIndex>> = BTreeMap::new();

        for task in tasks {
            let index = graph.add_node(task.name().to_string());

            for name in task.provides() {
                providers.entry(name.as_str()).or_default().push(index);
            }
        }

        for (i, task) in tasks.iter().enumerate() {
            let consumer = NodeIndex::new(i);

            for name in task.requires() {
                let found: Vec<_> = providers
                    .get(name.as_str())
                    .into_iter()
                    .flatten()
                    .copied()
                    .filter(|&provider| provider != consumer)
                    .collect();

                if found.is_empty() {
                    return Err(GraphError::NoSuchProvider {
                        task: task.name().to_string(),
                        name: name.clone(),
                    });
                }

                for provider in found {
                    graph.add_edge(provider, consumer, name.clone());
                }
            }
        }

        tracing::debug!(
            nodes = graph.node_count(),
            edges = graph.edge_count(),
            "built dependency graph"
        );

        // toposort only detects cycles here, the run order comes from `order::resolve`.
        if toposort(&graph, None).is_err() {
            let tasks = find_cycle(&graph)
                .into_iter()
                .map(|index| graph[index].clone())
                .collect();

            return Err(GraphError::Cycle { tasks });
        }

        Ok(Self { graph })
    }

    /// Number of tasks in the graph.
    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// All edges as `(provider, consumer, name)`.
    pub fn edges(&self) -> impl Iterator<Item = (&str, &str, &str)> {
        self.graph.edge_references().map(|edge| {
            (
                self.graph[edge.source()].as_str(),
                self.graph[edge.target()].as_str(),
                edge.weight().as_str(),
            )
        })
    }

    /// Names of the tasks the given task waits for, without repetition.
    pub fn dependencies_of(&self, task: &str) -> Vec<&str> {
        let Some(index) = self.find(task) else {
            return vec![];
        };

        let mut seen = HashSet::new();
        let mut deps: Vec<_> = self
            .graph
            .neighbors_directed(index, Direction::Incoming)
            .filter(|dep| seen.insert(*dep))
            .collect();
        deps.sort();
        deps.into_iter().map(|dep| self.graph[dep].as_str()).collect()
    }

    fn find(&self, task: &str) -> Option<NodeIndex> {
        self.graph
            .node_indices()
            .find(|&index| self.graph[index] == task)
    }
}

/// Shortest cycle through the earliest task of the first cyclic component,
/// closed by repeating that task at the end. Self loops never occur, so any
/// component with more than one member is a cycle.
fn find_cycle(graph: &DiGraph<String, String>) -> Vec<NodeIndex> {
    let component: HashSet<NodeIndex> = tarjan_scc(graph)
        .into_iter()
        .filter(|scc| scc.len() > 1)
        .min_by_key(|scc| scc.iter().min().copied())
        .unwrap_or_default()
        .into_iter()
        .collect();

    let Some(&start) = component.iter().min() else {
        return vec![];
    };

    let mut parents: HashMap<NodeIndex, NodeIndex> = HashMap::new();
    let mut queue = VecDeque::from([start]);

    while let Some(node) = queue.pop_front() {
        for next in graph.neighbors_directed(node, Direction::Outgoing) {
            if next == start {
                let mut path = vec![node];
                let mut current = node;
                while let Some(&parent) = parents.get(&current) {
                    current = parent;
                    path.push(current);
                }
                path.reverse();
                path.push(start);
                return path;
            }

            if component.contains(&next) && !parents.contains_key(&next) {
                parents.insert(next, node);
                queue.push_back(next);
            }
        }
    }

    let mut members: Vec<_> = component.into_iter().collect();
    members.sort();
    members
}

impl std::fmt::Display for DependencyGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "graph LR")?;

        for index in self.graph.node_indices() {
            let name = self.graph[index].replace('"', "\\\"");
            writeln!(f, "    {:?}[\"{}\"]", index.index(), name)?;
        }

        for edge in self.graph.edge_references() {
            writeln!(
                f,
                "    {:?} -- \"{}\" --> {:?}",
                edge.source().index(),
                edge.weight().replace('"', "\\\""),
                edge.target().index()
            )?;
        }

        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::context::{Context, Inputs, Journal, Outputs};
    use crate::error::TaskResult;
    use crate::task::{Names, names};

    pub(crate) struct Decl {
        name: String,
        requires: Names,
        provides: Names,
    }

    impl Task for Decl {
        fn name(&self) -> &str {
            &self.name
        }
        fn requires(&self) -> &Names {
            &self.requires
        }
        fn provides(&self) -> &Names {
            &self.provides
        }
        fn apply(&self, _: &Context, _: &mut Journal, _: Inputs) -> TaskResult<Outputs> {
            Ok(Outputs::new())
        }
    }

    pub(crate) fn decl(name: &str, provides: &[&str], requires: &[&str]) -> Box<dyn Task> {
        Box::new(Decl {
            name: name.to_string(),
            requires: names(requires.iter().copied()),
            provides: names(provides.iter().copied()),
        })
    }

    #[test]
    fn test_edges_follow_names() {
        let tasks = vec![
            decl("a", &["x"], &[]),
            decl("b", &["y"], &["x"]),
            decl("c", &[], &["x", "y"]),
        ];

        let graph = DependencyGraph::build(&tasks).unwrap();
        let mut edges: Vec<_> = graph.edges().collect();
        edges.sort();

        assert_eq!(
            edges,
            vec![("a", "b", "x"), ("a", "c", "x"), ("b", "c", "y")]
        );
        assert_eq!(graph.dependencies_of("c"), vec!["a", "b"]);
    }

    #[test]
    fn test_every_provider_gets_an_edge() {
        let tasks = vec![
            decl("p1", &["c"], &[]),
            decl("p2", &["c"], &[]),
            decl("t", &[], &["c"]),
        ];

        let graph = DependencyGraph::build(&tasks).unwrap();
        assert_eq!(graph.dependencies_of("t"), vec!["p1", "p2"]);
    }

    #[test]
    fn test_missing_provider() {
        let tasks = vec![decl("test1", &["a", "b"], &["c", "d"])];

        let err = DependencyGraph::build(&tasks).unwrap_err();
        assert_eq!(
            err,
            GraphError::NoSuchProvider {
                task: "test1".into(),
                name: "c".into(),
            }
        );
    }

    #[test]
    fn test_own_output_does_not_satisfy_requirement() {
        let tasks = vec![decl("loop", &["a"], &["a"])];

        let err = DependencyGraph::build(&tasks).unwrap_err();
        assert!(matches!(err, GraphError::NoSuchProvider { .. }));
    }

    #[test]
    fn test_cycle_reports_path() {
        let tasks = vec![
            decl("test1", &["a", "b"], &["c", "d", "e"]),
            decl("test2", &["c", "d", "e"], &["a", "b"]),
        ];

        let err = DependencyGraph::build(&tasks).unwrap_err();
        let GraphError::Cycle { tasks } = err else {
            panic!("expected a cycle, got {err:?}");
        };

        assert_eq!(tasks.len(), 3);
        assert_eq!(tasks.first(), tasks.last());
        assert!(tasks.contains(&"test1".to_string()));
        assert!(tasks.contains(&"test2".to_string()));
    }

    #[test]
    fn test_cycle_excludes_tasks_outside_loop() {
        let tasks = vec![
            decl("root", &["r"], &[]),
            decl("x", &["x"], &["r", "z"]),
            decl("y", &["y"], &["x"]),
            decl("z", &["z"], &["y"]),
        ];

        let GraphError::Cycle { tasks } = DependencyGraph::build(&tasks).unwrap_err() else {
            panic!("expected a cycle");
        };

        assert_eq!(tasks.len(), 4);
        assert!(!tasks.contains(&"root".to_string()));
    }

    #[test]
    fn test_build_is_idempotent() {
        let tasks = vec![
            decl("a", &["x", "y"], &[]),
            decl("b", &["z"], &["x"]),
            decl("c", &[], &["y", "z"]),
        ];

        let first: Vec<(String, String, String)> = DependencyGraph::build(&tasks)
            .unwrap()
            .edges()
            .map(|(p, c, n)| (p.into(), c.into(), n.into()))
            .collect();
        let second: Vec<(String, String, String)> = DependencyGraph::build(&tasks)
            .unwrap()
            .edges()
            .map(|(p, c, n)| (p.into(), c.into(), n.into()))
            .collect();

        assert_eq!(first, second);
    }

    #[test]
    fn test_mermaid() {
        let tasks = vec![decl("a", &["x"], &[]), decl("b", &[], &["x"])];
        let graph = DependencyGraph::build(&tasks).unwrap();

        assert_eq!(
            graph.to_string(),
            "graph LR\n    0[\"a\"]\n    1[\"b\"]\n    0 -- \"x\" --> 1\n"
        );
    }
}
