//! All the task-related abstractions.
//!
//! A [`Task`] declares which names it *requires* and which it *provides*. The
//! flow never wires tasks together by hand; edges are inferred from matching
//! names when the graph is built.
use std::any::type_name;
use std::borrow::Cow;
use std::collections::BTreeSet;
use std::sync::Arc;

use crate::context::{Context, Inputs, Journal, Outputs};
use crate::error::{FlowError, TaskResult};
use crate::flow::Flow;
use crate::revert::Cause;

/// Ordered set of value names.
pub type Names = BTreeSet<String>;

/// Builds a [`Names`] set from anything string-like.
pub fn names<I, S>(items: I) -> Names
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    items.into_iter().map(Into::into).collect()
}

/// A unit of work in a flow.
///
/// The declared `requires` and `provides` sets must not change once the task
/// has been added to a flow.
pub trait Task: Send + Sync {
    /// Unique name of the task within its flow.
    fn name(&self) -> &str;

    /// Names this task reads from the context.
    fn requires(&self) -> &Names;

    /// Names this task writes to the context.
    fn provides(&self) -> &Names;

    /// Performs the work. `inputs` holds exactly the required values; the
    /// returned outputs should cover every provided name, extra names are
    /// merged as well.
    fn apply(&self, context: &Context, journal: &mut Journal, inputs: Inputs)
    -> TaskResult<Outputs>;

    /// Undoes the work of a completed `apply`. Called only for tasks which
    /// completed, in reverse completion order, after a later task failed.
    #[inline]
    fn revert(
        &self,
        _context: &Context,
        _result: Option<&Outputs>,
        _cause: &Cause<'_>,
    ) -> TaskResult<()> {
        Ok(())
    }
}

type ApplyFn = Arc<dyn Fn(&Context, &mut Journal, Inputs) -> TaskResult<Outputs> + Send + Sync>;
type RevertFn =
    Arc<dyn Fn(&Context, Option<&Outputs>, &Cause<'_>) -> TaskResult<()> + Send + Sync>;

/// A task backed by closures, created through [`Flow::task`].
pub struct FnTask {
    name: Cow<'static, str>,
    requires: Names,
    provides: Names,
    apply: ApplyFn,
    revert: Option<RevertFn>,
}

impl Task for FnTask {
    fn name(&self) -> &str {
        &self.name
    }

    fn requires(&self) -> &Names {
        &self.requires
    }

    fn provides(&self) -> &Names {
        &self.provides
    }

    fn apply(
        &self,
        context: &Context,
        journal: &mut Journal,
        inputs: Inputs,
    ) -> TaskResult<Outputs> {
        (self.apply)(context, journal, inputs)
    }

    fn revert(
        &self,
        context: &Context,
        result: Option<&Outputs>,
        cause: &Cause<'_>,
    ) -> TaskResult<()> {
        match &self.revert {
            Some(revert) => revert(context, result, cause),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for FnTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnTask")
            .field("name", &self.name)
            .field("requires", &self.requires)
            .field("provides", &self.provides)
            .finish_non_exhaustive()
    }
}

/// Builder returned by [`Flow::task`].
pub struct TaskDef<'a> {
    flow: &'a mut Flow,
    name: Option<Cow<'static, str>>,
    requires: Names,
    provides: Names,
    revert: Option<RevertFn>,
}

impl<'a> TaskDef<'a> {
    pub(crate) fn new(flow: &'a mut Flow) -> Self {
        Self {
            flow,
            name: None,
            requires: Names::new(),
            provides: Names::new(),
            revert: None,
        }
    }

    pub fn name(mut self, name: impl Into<Cow<'static, str>>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn requires<I, S>(mut self, items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.requires.extend(items.into_iter().map(Into::into));
        self
    }

    pub fn provides<I, S>(mut self, items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.provides.extend(items.into_iter().map(Into::into));
        self
    }

    pub fn revert<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Context, Option<&Outputs>, &Cause<'_>) -> TaskResult<()> + Send + Sync + 'static,
    {
        self.revert = Some(Arc::new(callback));
        self
    }

    /// Registers the task in the flow. Without an explicit name, the name of
    /// the callback type is used.
    pub fn run<F>(self, callback: F) -> Result<&'a mut Flow, FlowError>
    where
        F: Fn(&Context, &mut Journal, Inputs) -> TaskResult<Outputs> + Send + Sync + 'static,
    {
        let task = FnTask {
            name: self.name.unwrap_or(type_name::<F>().into()),
            requires: self.requires,
            provides: self.provides,
            apply: Arc::new(callback),
            revert: self.revert,
        };

        self.flow.add(task)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_names_sorted_and_deduplicated() {
        let set = names(["b", "a", "b"]);
        assert_eq!(set.into_iter().collect::<Vec<_>>(), vec!["a", "b"]);
    }

    #[test]
    fn test_task_def_registers_fn_task() {
        let mut flow = Flow::new("test-flow");
        flow.task()
            .name("double")
            .requires(["x"])
            .provides(["y"])
            .run(|_, _, inputs| {
                let x: i64 = inputs.get_as("x")?;
                Ok(Outputs::new().with("y", x * 2))
            })
            .unwrap();

        assert_eq!(flow.task_names().collect::<Vec<_>>(), vec!["double"]);
    }

    #[test]
    fn test_default_name_is_callback_type() {
        let mut flow = Flow::new("test-flow");
        flow.task().run(|_, _, _| Ok(Outputs::new())).unwrap();

        let name = flow.task_names().next().unwrap().to_string();
        assert!(name.contains("test_default_name_is_callback_type"));
    }

    #[test]
    fn test_fn_task_without_revert_is_noop() {
        let task = FnTask {
            name: "t".into(),
            requires: Names::new(),
            provides: names(["a"]),
            apply: Arc::new(
                |_: &Context, _: &mut Journal, _: Inputs| -> TaskResult<Outputs> {
                    Ok(Outputs::new().with("a", 1))
                },
            ),
            revert: None,
        };

        let ctx = Context::new();
        let out = task.apply(&ctx, &mut Journal::new(), Inputs::default()).unwrap();
        assert_eq!(out.get("a"), Some(&json!(1)));
    }
}
