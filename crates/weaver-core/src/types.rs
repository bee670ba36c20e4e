use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique execution identifier: `exec_<unix-millis>_<9 random chars>`.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct ExecutionId(pub String);

impl ExecutionId {
    pub fn new() -> Self {
        let millis = Utc::now().timestamp_millis();
        let random = Uuid::new_v4().simple().to_string();
        Self(format!("exec_{}_{}", millis, &random[..9]))
    }

    pub fn from_str(s: &str) -> Self {
        Self(s.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ExecutionId {
    fn from(s: &str) -> Self {
        Self::from_str(s)
    }
}

/// A node as authored in a workflow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDef {
    /// Unique identifier within the workflow.
    pub id: String,
    /// Names the executor that runs this node.
    #[serde(rename = "type", default = "default_node_type")]
    pub node_type: String,
    /// Opaque payload handed to the executor.
    #[serde(default = "empty_object")]
    pub data: serde_json::Value,
}

fn default_node_type() -> String {
    "unknown".to_string()
}

fn empty_object() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

impl NodeDef {
    pub fn new(id: impl Into<String>, node_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            node_type: node_type.into(),
            data: empty_object(),
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }
}

/// `target` depends on `source`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EdgeDef {
    #[serde(alias = "from")]
    pub source: String,
    #[serde(alias = "to")]
    pub target: String,
}

impl EdgeDef {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
        }
    }
}

impl std::fmt::Display for EdgeDef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} -> {}", self.source, self.target)
    }
}

/// A stored workflow: the node list and edge list a run is built from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDef {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub nodes: Vec<NodeDef>,
    #[serde(default)]
    pub edges: Vec<EdgeDef>,
}

impl WorkflowDef {
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            nodes: vec![],
            edges: vec![],
        }
    }

    pub fn with_node(mut self, node: NodeDef) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn with_edge(mut self, source: impl Into<String>, target: impl Into<String>) -> Self {
        self.edges.push(EdgeDef::new(source, target));
        self
    }

    /// Parse a workflow from JSON.
    pub fn from_json(json: &str) -> crate::error::Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Per-node lifecycle: `pending -> running -> {completed | failed}`,
/// or `pending -> skipped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl NodeStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

/// Per-execution lifecycle: `pending -> running -> {completed | failed | cancelled}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

/// Everything an executor needs to run one node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeContext {
    pub execution_id: ExecutionId,
    pub workflow_id: String,
    pub node_id: String,
    pub node_type: String,
    pub data: serde_json::Value,
    /// Results of this node's dependencies, keyed by dependency id.
    pub inputs: HashMap<String, serde_json::Value>,
}

/// Process-wide execution events for loggers and metrics.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutionEvent {
    ExecutionStarted {
        execution_id: ExecutionId,
        workflow_id: String,
        total_nodes: usize,
    },
    NodeDispatched {
        execution_id: ExecutionId,
        node_id: String,
        node_type: String,
    },
    NodeRetrying {
        execution_id: ExecutionId,
        node_id: String,
        attempt: u32,
        error: String,
    },
    NodeCompleted {
        execution_id: ExecutionId,
        node_id: String,
        elapsed_ms: Option<u64>,
    },
    NodeFailed {
        execution_id: ExecutionId,
        node_id: String,
        error: String,
    },
    NodeSkipped {
        execution_id: ExecutionId,
        node_id: String,
        cause: String,
    },
    ExecutionFinished {
        execution_id: ExecutionId,
        status: ExecutionStatus,
        finished_at: DateTime<Utc>,
    },
}

impl ExecutionEvent {
    pub fn execution_id(&self) -> &ExecutionId {
        match self {
            Self::ExecutionStarted { execution_id, .. }
            | Self::NodeDispatched { execution_id, .. }
            | Self::NodeRetrying { execution_id, .. }
            | Self::NodeCompleted { execution_id, .. }
            | Self::NodeFailed { execution_id, .. }
            | Self::NodeSkipped { execution_id, .. }
            | Self::ExecutionFinished { execution_id, .. } => execution_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execution_id_format() {
        let id = ExecutionId::new();
        let parts: Vec<&str> = id.as_str().splitn(3, '_').collect();
        assert_eq!(parts[0], "exec");
        assert!(parts[1].parse::<i64>().is_ok());
        assert_eq!(parts[2].len(), 9);
        assert_ne!(id, ExecutionId::new());
    }

    #[test]
    fn test_workflow_from_json() {
        let json = r#"{
            "id": "wf-1",
            "nodes": [
                {"id": "a", "type": "input", "data": {"content": "hi"}},
                {"id": "b"}
            ],
            "edges": [
                {"source": "a", "target": "b"},
                {"from": "a", "to": "b"}
            ]
        }"#;
        let wf = WorkflowDef::from_json(json).unwrap();
        assert_eq!(wf.nodes.len(), 2);
        assert_eq!(wf.nodes[0].node_type, "input");
        assert_eq!(wf.nodes[1].node_type, "unknown");
        assert!(wf.nodes[1].data.is_object());
        assert_eq!(wf.edges[0], wf.edges[1]);
    }

    #[test]
    fn test_status_terminal() {
        assert!(!NodeStatus::Pending.is_terminal());
        assert!(!NodeStatus::Running.is_terminal());
        assert!(NodeStatus::Skipped.is_terminal());
        assert!(ExecutionStatus::Cancelled.is_terminal());
        assert!(!ExecutionStatus::Running.is_terminal());
        assert_eq!(
            serde_json::to_string(&NodeStatus::Skipped).unwrap(),
            "\"skipped\""
        );
    }

    #[test]
    fn test_event_tagging() {
        let event = ExecutionEvent::NodeFailed {
            execution_id: ExecutionId::from_str("exec_1_abc"),
            node_id: "b".into(),
            error: "boom".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "node_failed");
        assert_eq!(event.execution_id().as_str(), "exec_1_abc");
    }
}
