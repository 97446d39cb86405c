//! Compensation of completed tasks after a failure.
//!
//! Completed tasks are reverted most recent first. A failing revert does not
//! stop the pass, its error is kept and the remaining tasks are still
//! reverted. Tasks which never completed, including the one which failed,
//! are never reverted.

use std::panic::{AssertUnwindSafe, catch_unwind};

use crate::context::{Context, Outputs};
use crate::error::{ExecutionError, RevertFailure, TaskResult};
use crate::executor::panic_message;
use crate::flow::Flow;
use crate::task::Task;

/// Why a revert is happening, handed to every revert call of a rollback pass.
///
/// Borrows the flow instead of owning it, so revert logic can look at the
/// flow state (which is [`State::Reverting`](crate::State::Reverting) for the
/// whole pass).
#[derive(Debug, Clone, Copy)]
pub struct Cause<'a> {
    flow: &'a Flow,
    task: &'a str,
    error: &'a anyhow::Error,
}

impl<'a> Cause<'a> {
    pub(crate) fn new(flow: &'a Flow, task: &'a str, error: &'a anyhow::Error) -> Self {
        Self { flow, task, error }
    }

    /// The flow being rolled back.
    pub fn flow(&self) -> &'a Flow {
        self.flow
    }

    /// Name of the task whose `apply` failed.
    pub fn task(&self) -> &'a str {
        self.task
    }

    /// The error raised by the failing task.
    pub fn error(&self) -> &'a anyhow::Error {
        self.error
    }
}

/// A task that completed during the run, with the outputs it returned.
pub(crate) struct Completed {
    /// Position of the task in the flow.
    pub task: usize,
    pub outputs: Outputs,
}

/// Reverts `completed` in reverse order, returning every revert which failed.
pub(crate) fn revert_all(
    tasks: &[Box<dyn Task>],
    completed: &[Completed],
    context: &Context,
    cause: &Cause<'_>,
    catch_panics: bool,
) -> Vec<RevertFailure> {
    let span = tracing::info_span!("revert", flow = cause.flow().name(), failed = cause.task());
    let _enter = span.enter();

    tracing::info!("reverting {} completed task(s)", completed.len());

    let mut failures = Vec::new();

    for entry in completed.iter().rev() {
        let task = tasks[entry.task].as_ref();
        let name = task.name();
        tracing::debug!(task = name, "reverting");

        let call = || -> TaskResult<()> { task.revert(context, Some(&entry.outputs), cause) };

        let result = if catch_panics {
            catch_unwind(AssertUnwindSafe(call))
                .unwrap_or_else(|panic| Err(ExecutionError::Panic(panic_message(panic)).into()))
        } else {
            call()
        };

        if let Err(error) = result {
            tracing::warn!(task = name, "revert failed: {error:#}");
            failures.push(RevertFailure {
                task: name.to_string(),
                error,
            });
        }
    }

    failures
}
