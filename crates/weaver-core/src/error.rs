use thiserror::Error;

#[derive(Debug, Error)]
pub enum WeaverError {
    // Build errors
    #[error("Edge {edge} references unknown node: {node}")]
    UnknownNode { node: String, edge: String },

    #[error("Self-loop on node: {0}")]
    SelfLoop(String),

    #[error("Circular dependency detected: {}", path.join(" -> "))]
    CycleDetected { path: Vec<String> },

    #[error("Duplicate node id: {0}")]
    DuplicateNode(String),

    // Coordination errors
    #[error("Execution not found: {0}")]
    ExecutionNotFound(String),

    #[error("Node {node} not found in execution {execution}")]
    NodeNotFound { execution: String, node: String },

    #[error("Node {node} is not ready to run or finish (status: {status})")]
    NodeNotReady { node: String, status: String },

    #[error("Execution {execution} is not running (status: {status})")]
    ExecutionNotRunning { execution: String, status: String },

    #[error("Execution {execution} already finished (status: {status})")]
    ExecutionTerminal { execution: String, status: String },

    #[error("Execution already started: {0}")]
    ExecutionAlreadyStarted(String),

    // Node errors
    #[error("No executor registered for node type: {0}")]
    ExecutorNotFound(String),

    #[error("Node execution failed: {node}: {message}")]
    NodeExecution { node: String, message: String },

    #[error("Node timeout after {timeout_secs}s: {node}")]
    NodeTimeout { node: String, timeout_secs: u64 },

    // Run errors
    #[error("Workflow execution timeout after {0}s")]
    WorkflowTimeout(u64),

    #[error("Execution cancelled")]
    Cancelled,

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Storage errors
    #[error("Database error: {0}")]
    Database(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl WeaverError {
    /// Errors raised while turning a workflow definition into an execution.
    pub fn is_build_error(&self) -> bool {
        matches!(
            self,
            Self::UnknownNode { .. }
                | Self::SelfLoop(_)
                | Self::CycleDetected { .. }
                | Self::DuplicateNode(_)
        )
    }

    /// Errors returned for rejected run-control or event-reporting calls.
    /// These never mutate execution state.
    pub fn is_coordination_error(&self) -> bool {
        matches!(
            self,
            Self::ExecutionNotFound(_)
                | Self::NodeNotFound { .. }
                | Self::NodeNotReady { .. }
                | Self::ExecutionNotRunning { .. }
                | Self::ExecutionTerminal { .. }
                | Self::ExecutionAlreadyStarted(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, WeaverError>;
