use thiserror::Error;

use crate::flow::State;

/// Result from a single task callback, either `apply` or `revert`.
pub type TaskResult<T> = anyhow::Result<T, anyhow::Error>;

/// Reasons a set of tasks cannot form an executable graph.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("Task '{task}' requires '{name}', but no task provides it")]
    NoSuchProvider { task: String, name: String },

    #[error("Cycle detected between tasks: {}", .tasks.join(" -> "))]
    Cycle { tasks: Vec<String> },
}

/// Failures raised by the engine itself while a task is being applied.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("Task '{task}' did not produce declared output '{name}'")]
    MissingOutput { task: String, name: String },

    #[error("Task panicked: {0}")]
    Panic(String),
}

/// A revert call which failed during the rollback pass.
#[derive(Debug, Error)]
#[error("Revert of task '{task}' failed: {error}")]
pub struct RevertFailure {
    pub task: String,
    pub error: anyhow::Error,
}

#[derive(Debug, Error)]
pub enum FlowError {
    /// The task set cannot form a valid executable graph.
    #[error("Flow '{flow}' is in an invalid state: {source}")]
    InvalidState {
        flow: String,
        #[source]
        source: GraphError,
    },

    #[error("Flow '{flow}' already has a task named '{task}'")]
    DuplicateName { flow: String, task: String },

    #[error("Flow '{flow}' has already run (state {state})")]
    AlreadyRun { flow: String, state: State },

    /// A task failed during `apply`. The flow has been rolled back; `source`
    /// is the error the task raised, `reverts` collects any revert calls that
    /// failed along the way.
    #[error("Task '{task}' failed: {source}{}", revert_summary(.reverts))]
    Task {
        task: String,
        #[source]
        source: anyhow::Error,
        reverts: Vec<RevertFailure>,
    },
}

impl FlowError {
    /// Returns the graph error, if this is an invalid-state failure.
    pub fn graph_error(&self) -> Option<&GraphError> {
        match self {
            FlowError::InvalidState { source, .. } => Some(source),
            _ => None,
        }
    }

    /// Returns the error raised by the failing task, if any.
    pub fn task_error(&self) -> Option<&anyhow::Error> {
        match self {
            FlowError::Task { source, .. } => Some(source),
            _ => None,
        }
    }

    pub fn is_invalid_state(&self) -> bool {
        matches!(self, FlowError::InvalidState { .. })
    }
}

fn revert_summary(reverts: &[RevertFailure]) -> String {
    if reverts.is_empty() {
        return String::new();
    }

    let names: Vec<_> = reverts.iter().map(|r| r.task.as_str()).collect();
    format!(" ({} revert(s) also failed: {})", reverts.len(), names.join(", "))
}
