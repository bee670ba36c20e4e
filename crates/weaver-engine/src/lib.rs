//! DAG execution engine.
//!
//! A workflow (node list + edge list) is built into an [`Execution`]: an arena
//! of execution nodes whose dependency relations are stored as index lists.
//! The [`Engine`] owns every execution in an [`ExecutionRegistry`], serializes
//! mutations per execution, and fans out snapshots to subscribers after each
//! change. The [`WorkflowRunner`] drives one execution end-to-end against the
//! node executors registered in an [`ExecutorRegistry`].

pub mod coordinator;
pub mod execution;
pub mod executors;
pub mod graph;
pub mod metrics;
pub mod notify;
pub mod registry;
pub mod run_log;
pub mod runner;
pub mod scheduler;

pub use coordinator::Engine;
pub use execution::{Execution, Transition};
pub use executors::{ExecutorRegistry, FnExecutor};
pub use graph::{build, build_workflow, ExecutionNode, NodeIndex};
pub use metrics::ExecutionMetrics;
pub use notify::Subscription;
pub use registry::{ExecutionRegistry, ExecutionStats};
pub use run_log::RunLogger;
pub use runner::{RunSummary, RunnerConfig, WorkflowRunner};
