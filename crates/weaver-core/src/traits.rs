use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::types::{ExecutionId, ExecutionStatus, NodeContext, WorkflowDef};

/// Node executor: runs one node of a given type.
///
/// The engine never interprets node semantics; it hands the node's type,
/// data and upstream results to the executor registered for that type and
/// records whatever comes back.
pub trait NodeExecutor: Send + Sync + 'static {
    /// Run the node, returning its result or an error.
    fn execute(&self, ctx: NodeContext) -> BoxFuture<'_, Result<serde_json::Value>>;
}

/// A finished execution, as handed to persistence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub execution_id: ExecutionId,
    pub workflow_id: String,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Full serialized execution snapshot.
    pub snapshot: serde_json::Value,
}

/// Workflow store: persistence backend for definitions and finished runs.
pub trait WorkflowStore: Send + Sync + 'static {
    /// Insert or replace a workflow definition.
    fn save_workflow(&self, workflow: &WorkflowDef) -> BoxFuture<'_, Result<()>>;

    /// Load a workflow definition by id.
    fn load_workflow(&self, workflow_id: &str) -> BoxFuture<'_, Result<Option<WorkflowDef>>>;

    /// List stored workflow ids.
    fn list_workflows(&self) -> BoxFuture<'_, Result<Vec<String>>>;

    /// Persist a terminal execution snapshot.
    fn save_execution(&self, record: &ExecutionRecord) -> BoxFuture<'_, Result<()>>;

    /// Load a stored execution snapshot.
    fn load_execution(
        &self,
        execution_id: &ExecutionId,
    ) -> BoxFuture<'_, Result<Option<ExecutionRecord>>>;

    /// List stored executions of a workflow, newest first.
    fn list_executions(&self, workflow_id: &str) -> BoxFuture<'_, Result<Vec<ExecutionRecord>>>;
}
