use std::any::Any;
use std::collections::HashMap;
use std::fmt::Write;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::time::{Duration, Instant};

use petgraph::graph::NodeIndex;
use petgraph::visit::EdgeRef;
use tracing::Level;
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::context::{Context, Journal};
use crate::error::{ExecutionError, TaskResult};
use crate::flow::Settings;
use crate::graph::DependencyGraph;
use crate::revert::Completed;
use crate::task::Task;

#[derive(Debug, Clone)]
pub struct TaskExecution {
    pub start: Instant,
    pub duration: Duration,
}

/// Run diagnostics and timing metrics, returned by a successful
/// [`Flow::run`](crate::Flow::run).
#[derive(Debug, Default)]
pub struct Diagnostics {
    /// Task names in the order they were applied.
    pub order: Vec<String>,
    /// Timing of every applied task, keyed by task name.
    pub execution_times: HashMap<String, TaskExecution>,
}

impl Diagnostics {
    /// Total time spent inside `apply` calls.
    pub fn total(&self) -> Duration {
        self.execution_times.values().map(|t| t.duration).sum()
    }

    /// Renders the dependency graph as a Mermaid diagram, color-coded by
    /// execution duration from green (fastest) to red (slowest).
    pub fn render_mermaid(&self, graph: &DependencyGraph) -> String {
        let mut f = String::new();
        let _ = writeln!(f, "graph LR");

        let times = &self.execution_times;
        let min_time = times
            .values()
            .map(|t| t.duration.as_secs_f64())
            .fold(f64::MAX, f64::min);
        let max_time = times
            .values()
            .map(|t| t.duration.as_secs_f64())
            .fold(0.0, f64::max);
        let range = if max_time - min_time > f64::EPSILON {
            max_time - min_time
        } else {
            1.0
        };

        for index in graph.graph.node_indices() {
            let name = &graph.graph[index];
            let (label, color) = match times.get(name) {
                Some(exec) => {
                    let t = (exec.duration.as_secs_f64() - min_time) / range;
                    let (r, g) = if t < 0.5 {
                        ((510.0 * t) as u8, 255)
                    } else {
                        (255, (510.0 * (1.0 - t)) as u8)
                    };
                    (format!("{:.2?}", exec.duration), format!("#{r:02X}{g:02X}00"))
                }
                None => ("Not run".to_string(), "#D3D3D3".to_string()),
            };

            let _ = writeln!(
                f,
                "    {:?}[\"{}\\n{}\"]",
                index.index(),
                name.replace('"', "\\\""),
                label
            );
            let _ = writeln!(f, "    style {:?} fill:{}", index.index(), color);
        }

        for edge in graph.graph.edge_references() {
            let _ = writeln!(
                f,
                "    {:?} -- \"{}\" --> {:?}",
                edge.source().index(),
                edge.weight().replace('"', "\\\""),
                edge.target().index()
            );
        }

        f
    }
}

/// Forward execution stopped at a failing task.
pub(crate) struct Failure {
    /// Position of the failing task in the flow.
    pub task: usize,
    pub error: anyhow::Error,
    pub completed: Vec<Completed>,
}

pub(crate) fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        String::from("unknown payload")
    }
}

/// Applies the tasks one by one in the given order, merging every result
/// into the context. Stops at the first failure and hands back the tasks
/// which completed so far, oldest first.
pub(crate) fn execute(
    flow: &str,
    tasks: &[Box<dyn Task>],
    order: &[NodeIndex],
    context: &mut Context,
    settings: &Settings,
) -> Result<Diagnostics, Failure> {
    let root_span = tracing::span!(Level::INFO, "flow", name = flow);
    root_span.pb_set_length(order.len() as u64);
    match crate::utils::get_style_flow() {
        Ok(style) => root_span.pb_set_style(&style),
        Err(e) => tracing::warn!("invalid progress bar template: {e}"),
    }
    root_span.pb_set_message(&format!("Running {flow}..."));
    let _enter = root_span.enter();

    let mut diagnostics = Diagnostics::default();
    let mut completed: Vec<Completed> = Vec::with_capacity(order.len());

    for &index in order {
        let task = tasks[index.index()].as_ref();
        let name = task.name();

        let span = tracing::span!(Level::INFO, "task", name = name);
        let _enter = span.enter();

        let inputs = context.select(task.requires());
        let mut journal = Journal::new();

        tracing::debug!(inputs = inputs.len(), "applying");
        let start = Instant::now();

        let call = || task.apply(context, &mut journal, inputs);

        let result = if settings.catch_panics {
            catch_unwind(AssertUnwindSafe(call)).unwrap_or_else(|panic| {
                Err(ExecutionError::Panic(panic_message(panic)).into())
            })
        } else {
            call()
        };

        let duration = start.elapsed();

        let result = result.and_then(|outputs| -> TaskResult<_> {
            if settings.strict_outputs
                && let Some(missing) = task.provides().iter().find(|n| !outputs.contains(n))
            {
                return Err(ExecutionError::MissingOutput {
                    task: name.to_string(),
                    name: missing.clone(),
                }
                .into());
            }
            Ok(outputs)
        });

        match result {
            Ok(outputs) => {
                context.merge(&outputs);
                context.apply_journal(journal);

                diagnostics.order.push(name.to_string());
                diagnostics
                    .execution_times
                    .insert(name.to_string(), TaskExecution { start, duration });
                completed.push(Completed {
                    task: index.index(),
                    outputs,
                });
                root_span.pb_inc(1);

                tracing::debug!(?duration, "applied");
            }
            Err(error) => {
                tracing::warn!("task '{name}' failed: {error:#}");
                return Err(Failure {
                    task: index.index(),
                    error,
                    completed,
                });
            }
        }
    }

    tracing::info!(
        "flow '{flow}' completed {} task(s) in {:.2?}",
        completed.len(),
        diagnostics.total()
    );

    Ok(diagnostics)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn diagnostics(entries: &[(&str, u64)]) -> Diagnostics {
        let start = Instant::now();
        Diagnostics {
            order: entries.iter().map(|(n, _)| n.to_string()).collect(),
            execution_times: entries
                .iter()
                .map(|&(n, ms)| {
                    (
                        n.to_string(),
                        TaskExecution {
                            start,
                            duration: Duration::from_millis(ms),
                        },
                    )
                })
                .collect(),
        }
    }

    #[test]
    fn test_total() {
        let diag = diagnostics(&[("a", 10), ("b", 5)]);
        assert_eq!(diag.total(), Duration::from_millis(15));
    }

    #[test]
    fn test_panic_message() {
        let payload = catch_unwind(|| panic!("boom")).unwrap_err();
        assert_eq!(panic_message(payload), "boom");

        let payload = catch_unwind(|| std::panic::panic_any(42u8)).unwrap_err();
        assert_eq!(panic_message(payload), "unknown payload");
    }

    #[test]
    fn test_render_mermaid_colors() {
        use crate::graph::tests::decl;

        let tasks = vec![
            decl("fast", &["x"], &[]),
            decl("slow", &["y"], &["x"]),
            decl("skipped", &[], &["y"]),
        ];
        let graph = DependencyGraph::build(&tasks).unwrap();
        let diag = diagnostics(&[("fast", 1), ("slow", 100)]);

        let out = diag.render_mermaid(&graph);
        assert!(out.starts_with("graph LR\n"));
        assert!(out.contains("style 0 fill:#00FF00"));
        assert!(out.contains("style 1 fill:#FF0000"));
        assert!(out.contains("Not run"));
        assert!(out.contains("0 -- \"x\" --> 1"));
    }
}
