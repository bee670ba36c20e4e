use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;

use weaver_core::error::{Result, WeaverError};
use weaver_core::traits::NodeExecutor;
use weaver_core::types::NodeContext;

/// Registry of node executors, keyed by node type.
pub struct ExecutorRegistry {
    executors: HashMap<String, Arc<dyn NodeExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self {
            executors: HashMap::new(),
        }
    }

    /// Register an executor for a node type, replacing any previous one.
    pub fn register(&mut self, node_type: impl Into<String>, executor: impl NodeExecutor) {
        self.executors.insert(node_type.into(), Arc::new(executor));
    }

    /// Register a closure as the executor for a node type.
    pub fn register_fn<F, Fut>(&mut self, node_type: impl Into<String>, f: F)
    where
        F: Fn(NodeContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<serde_json::Value>> + Send + 'static,
    {
        self.register(node_type, FnExecutor::new(f));
    }

    pub fn unregister(&mut self, node_type: &str) -> bool {
        self.executors.remove(node_type).is_some()
    }

    pub fn get(&self, node_type: &str) -> Option<Arc<dyn NodeExecutor>> {
        self.executors.get(node_type).cloned()
    }

    /// Look up the executor for a node type or fail with `ExecutorNotFound`.
    pub fn resolve(&self, node_type: &str) -> Result<Arc<dyn NodeExecutor>> {
        self.get(node_type)
            .ok_or_else(|| WeaverError::ExecutorNotFound(node_type.to_string()))
    }

    /// Registered node types, sorted.
    pub fn types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.executors.keys().map(|s| s.as_str()).collect();
        types.sort_unstable();
        types
    }

    pub fn len(&self) -> usize {
        self.executors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.executors.is_empty()
    }
}

impl Default for ExecutorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Adapts an async closure to [`NodeExecutor`].
pub struct FnExecutor<F> {
    f: F,
}

impl<F> FnExecutor<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F, Fut> NodeExecutor for FnExecutor<F>
where
    F: Fn(NodeContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<serde_json::Value>> + Send + 'static,
{
    fn execute(&self, ctx: NodeContext) -> BoxFuture<'_, Result<serde_json::Value>> {
        (self.f)(ctx).boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;
    use weaver_core::types::ExecutionId;

    fn ctx(node_type: &str) -> NodeContext {
        NodeContext {
            execution_id: ExecutionId::from_str("exec_test"),
            workflow_id: "wf".into(),
            node_id: "n".into(),
            node_type: node_type.into(),
            data: json!({"x": 2}),
            inputs: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn test_register_fn_and_execute() {
        let mut registry = ExecutorRegistry::new();
        registry.register_fn("double", |ctx: NodeContext| async move {
            let x = ctx.data["x"].as_i64().unwrap_or(0);
            Ok(json!(x * 2))
        });

        let exec = registry.resolve("double").unwrap();
        assert_eq!(exec.execute(ctx("double")).await.unwrap(), json!(4));
    }

    #[test]
    fn test_missing_type() {
        let registry = ExecutorRegistry::new();
        assert!(registry.is_empty());
        assert!(matches!(
            registry.resolve("nope"),
            Err(WeaverError::ExecutorNotFound(t)) if t == "nope"
        ));
    }

    #[test]
    fn test_types_sorted_and_replace() {
        let mut registry = ExecutorRegistry::new();
        registry.register_fn("b", |_| async { Ok(json!(1)) });
        registry.register_fn("a", |_| async { Ok(json!(1)) });
        registry.register_fn("a", |_| async { Ok(json!(2)) });
        assert_eq!(registry.types(), vec!["a", "b"]);
        assert_eq!(registry.len(), 2);
        assert!(registry.unregister("b"));
        assert!(!registry.unregister("b"));
    }
}
