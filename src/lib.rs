#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod context;
mod error;
mod executor;
mod flow;
mod graph;
mod order;
mod revert;
mod task;
mod utils;

pub use crate::context::{Context, Inputs, Journal, Outputs, Value};
pub use crate::error::*;
pub use crate::executor::{Diagnostics, TaskExecution};
pub use crate::flow::{Flow, Settings, State};
pub use crate::graph::DependencyGraph;
pub use crate::revert::Cause;
pub use crate::task::{FnTask, Names, Task, TaskDef, names};

#[cfg(feature = "logging")]
pub use crate::utils::init_logging;
