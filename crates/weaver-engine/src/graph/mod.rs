//! Graph Builder: workflow definition -> execution arena.

pub mod builder;
pub mod node;

pub use builder::{build, build_workflow};
pub use node::{ExecutionNode, NodeIndex};
