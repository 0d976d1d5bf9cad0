//! Shared data model.

pub mod cron;
pub mod executor;
pub mod generator;
pub mod process;
pub mod workflow;

pub use cron::{Cron, CronSchedule, USE_EXPRESSION};
pub use executor::Executor;
pub use generator::{Generator, GeneratorArg};
pub use process::{Conditions, FunctionSpec, Process, ProcessState, Resources, Timings};
pub use workflow::{WorkflowGraph, WorkflowSpec};
