use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use weaver_core::types::{NodeDef, NodeStatus};

/// Position of a node in its execution's arena.
pub type NodeIndex = usize;

/// A node of one execution run.
///
/// Copied from the workflow's [`NodeDef`] at build time. `dependencies` and
/// `dependents` index into the same arena and are transposes of each other.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionNode {
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: String,
    pub data: serde_json::Value,
    /// Nodes that must complete before this one may run.
    pub dependencies: Vec<NodeIndex>,
    /// Nodes unlocked when this one completes.
    pub dependents: Vec<NodeIndex>,
    pub status: NodeStatus,
    /// Present iff `status == Completed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    /// Present iff `status == Failed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    /// Executor attempts that failed and were retried.
    #[serde(default)]
    pub retries: u32,
}

impl ExecutionNode {
    pub fn from_def(def: &NodeDef) -> Self {
        Self {
            id: def.id.clone(),
            node_type: def.node_type.clone(),
            data: def.data.clone(),
            dependencies: vec![],
            dependents: vec![],
            status: NodeStatus::Pending,
            result: None,
            error: None,
            start_time: None,
            end_time: None,
            retries: 0,
        }
    }

    /// Time spent between dispatch and finish, if both are recorded.
    pub fn elapsed_ms(&self) -> Option<u64> {
        match (self.start_time, self.end_time) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds().max(0) as u64),
            _ => None,
        }
    }

    pub fn is_root(&self) -> bool {
        self.dependencies.is_empty()
    }

    pub fn is_sink(&self) -> bool {
        self.dependents.is_empty()
    }
}
