use std::any::Any;
use std::collections::HashSet;
use std::fmt::{Debug, Display};
use std::panic::{AssertUnwindSafe, catch_unwind, resume_unwind};

use petgraph::graph::NodeIndex;

use crate::context::Context;
use crate::error::{FlowError, GraphError};
use crate::executor::{self, Diagnostics};
use crate::graph::DependencyGraph;
use crate::order;
use crate::revert::{self, Cause};
use crate::task::{Task, TaskDef};

/// Lifecycle of a [`Flow`].
///
/// `Pending -> Running -> Success`, or `Running -> Reverting -> Failure` when
/// a task fails. A flow which fails validation goes straight from `Pending`
/// to `Failure`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    Pending,
    Running,
    Success,
    Reverting,
    Failure,
}

impl State {
    pub fn is_terminal(self) -> bool {
        matches!(self, State::Success | State::Failure)
    }
}

impl Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            State::Pending => "PENDING",
            State::Running => "RUNNING",
            State::Success => "SUCCESS",
            State::Reverting => "REVERTING",
            State::Failure => "FAILURE",
        };
        f.write_str(text)
    }
}

/// Engine settings applied to every run of a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Settings {
    /// Turn panics inside `apply` and `revert` into ordinary task errors.
    ///
    /// When unset, a panic escapes [`Flow::run`] as is. No revert pass runs
    /// for a panicking `apply`, the remaining reverts are skipped for a
    /// panicking `revert`, and the flow is left in [`State::Failure`].
    pub catch_panics: bool,
    /// Treat a declared but missing output as a failure of the task.
    pub strict_outputs: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            catch_panics: true,
            strict_outputs: true,
        }
    }
}

/// A validated graph together with the order derived from it.
#[derive(Debug, Clone)]
struct Plan {
    graph: DependencyGraph,
    order: Vec<NodeIndex>,
}

impl Plan {
    fn build(tasks: &[Box<dyn Task>]) -> Result<Self, GraphError> {
        let graph = DependencyGraph::build(tasks)?;
        let order = order::resolve(&graph)?;
        Ok(Self { graph, order })
    }
}

/// A set of tasks executed as one graph-ordered unit.
///
/// Dependencies are never declared by hand: a task which requires a name
/// runs after every task which provides it. If a task fails, the tasks which
/// already completed are reverted in reverse order and the original error is
/// returned.
///
/// A flow runs at most once. Tasks can only be added while it is
/// [`State::Pending`].
///
/// # Example
///
/// ```rust
/// use graphflow::{Context, Flow, Outputs, State};
///
/// let mut flow = Flow::new("example");
/// flow.task()
///     .name("one")
///     .provides(["a"])
///     .run(|_, _, _| Ok(Outputs::new().with("a", 1)))?;
/// flow.task()
///     .name("two")
///     .requires(["a"])
///     .provides(["b"])
///     .run(|_, _, inputs| {
///         let a: i64 = inputs.get_as("a")?;
///         Ok(Outputs::new().with("b", a + 1))
///     })?;
///
/// let mut ctx = Context::new();
/// flow.run(&mut ctx)?;
///
/// assert_eq!(flow.state(), State::Success);
/// assert_eq!(ctx.get_as::<i64>("b")?, Some(2));
/// # Ok::<(), anyhow::Error>(())
/// ```
pub struct Flow {
    name: String,
    tasks: Vec<Box<dyn Task>>,
    names: HashSet<String>,
    state: State,
    settings: Settings,
    plan: Option<Plan>,
}

impl Flow {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_settings(name, Settings::default())
    }

    pub fn with_settings(name: impl Into<String>, settings: Settings) -> Self {
        Self {
            name: name.into(),
            tasks: Vec::new(),
            names: HashSet::new(),
            state: State::Pending,
            settings,
            plan: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Names of all tasks, in the order they were added.
    pub fn task_names(&self) -> impl Iterator<Item = &str> {
        self.tasks.iter().map(|task| task.name())
    }

    /// Starts defining a closure-backed task, see [`TaskDef`].
    pub fn task(&mut self) -> TaskDef<'_> {
        TaskDef::new(self)
    }

    /// Registers a task.
    pub fn add(&mut self, task: impl Task + 'static) -> Result<&mut Self, FlowError> {
        self.add_boxed(Box::new(task))
    }

    pub fn add_boxed(&mut self, task: Box<dyn Task>) -> Result<&mut Self, FlowError> {
        if self.state != State::Pending {
            return Err(FlowError::AlreadyRun {
                flow: self.name.clone(),
                state: self.state,
            });
        }

        if !self.names.insert(task.name().to_string()) {
            return Err(FlowError::DuplicateName {
                flow: self.name.clone(),
                task: task.name().to_string(),
            });
        }

        tracing::debug!(flow = %self.name, task = task.name(), "added task");
        self.tasks.push(task);
        self.plan = None;

        Ok(self)
    }

    /// Builds and validates the dependency graph without running anything.
    pub fn connect(&mut self) -> Result<&DependencyGraph, FlowError> {
        let plan = self.plan()?;
        Ok(&plan.graph)
    }

    /// Like [`Flow::connect`], additionally returning the execution order as
    /// task names.
    pub fn order(&mut self) -> Result<Vec<&str>, FlowError> {
        self.plan()?;
        Ok(self.ordered_names())
    }

    /// Validates the flow, then applies every task in dependency order,
    /// threading values through `context`.
    ///
    /// When a task fails, every task that completed before it is reverted,
    /// most recent first, and the task's own error is returned inside
    /// [`FlowError::Task`]. The context keeps whatever the completed tasks
    /// wrote.
    pub fn run(&mut self, context: &mut Context) -> Result<Diagnostics, FlowError> {
        let order = self.plan()?.order.clone();

        if self.state != State::Pending {
            return Err(FlowError::AlreadyRun {
                flow: self.name.clone(),
                state: self.state,
            });
        }

        self.transition(State::Running);

        let result = catch_unwind(AssertUnwindSafe(|| {
            executor::execute(&self.name, &self.tasks, &order, context, &self.settings)
        }));

        let failure = match result {
            Ok(Ok(diagnostics)) => {
                self.transition(State::Success);
                return Ok(diagnostics);
            }
            Ok(Err(failure)) => failure,
            Err(panic) => self.abort(panic),
        };

        self.transition(State::Reverting);

        let task = self.tasks[failure.task].name().to_string();
        let cause = Cause::new(self, &task, &failure.error);
        let reverts = catch_unwind(AssertUnwindSafe(|| {
            revert::revert_all(
                &self.tasks,
                &failure.completed,
                context,
                &cause,
                self.settings.catch_panics,
            )
        }));

        let reverts = match reverts {
            Ok(reverts) => reverts,
            Err(panic) => self.abort(panic),
        };

        self.transition(State::Failure);

        Err(FlowError::Task {
            task,
            source: failure.error,
            reverts,
        })
    }

    /// The validated dependency graph, if it has been built since the last
    /// change to the task set.
    pub fn graph(&self) -> Option<&DependencyGraph> {
        self.plan.as_ref().map(|plan| &plan.graph)
    }

    fn plan(&mut self) -> Result<&Plan, FlowError> {
        let plan = match self.plan.take() {
            Some(plan) => plan,
            None => Plan::build(&self.tasks).map_err(|source| self.invalid(source))?,
        };

        Ok(self.plan.insert(plan))
    }

    fn invalid(&mut self, source: GraphError) -> FlowError {
        tracing::warn!(flow = %self.name, "validation failed: {source}");

        if self.state == State::Pending {
            self.transition(State::Failure);
        }

        FlowError::InvalidState {
            flow: self.name.clone(),
            source,
        }
    }

    fn ordered_names(&self) -> Vec<&str> {
        self.plan
            .iter()
            .flat_map(|plan| plan.order.iter())
            .map(|index| self.tasks[index.index()].name())
            .collect()
    }

    /// Lets an uncaught panic continue unwinding once the flow is marked
    /// as failed.
    fn abort(&mut self, panic: Box<dyn Any + Send>) -> ! {
        tracing::error!(flow = %self.name, "panic escaped the flow during {}", self.state);
        self.transition(State::Failure);
        resume_unwind(panic)
    }

    fn transition(&mut self, next: State) {
        tracing::info!(flow = %self.name, "{} -> {}", self.state, next);
        self.state = next;
    }
}

impl Debug for Flow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Flow")
            .field("name", &self.name)
            .field("state", &self.state)
            .field("tasks", &self.task_names().collect::<Vec<_>>())
            .finish()
    }
}
