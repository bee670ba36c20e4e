//! Built-in node executors for the CLI.

use std::time::Duration;

use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::debug;

use weaver_core::error::{Result, WeaverError};
use weaver_core::traits::NodeExecutor;
use weaver_core::types::NodeContext;
use weaver_engine::ExecutorRegistry;

/// Registry with `input`, `passthrough`, `delay`, `shell` and `fail`.
pub fn builtin_registry() -> ExecutorRegistry {
    let mut registry = ExecutorRegistry::new();
    registry.register("input", PassthroughExecutor);
    registry.register("passthrough", PassthroughExecutor);
    registry.register("delay", DelayExecutor);
    registry.register("shell", ShellExecutor);
    registry.register("fail", FailExecutor);
    registry
}

/// The node's `data` object with an `inputs` field holding upstream results.
fn merge_inputs(ctx: &NodeContext) -> Value {
    let mut out = match &ctx.data {
        Value::Object(map) => map.clone(),
        Value::Null => Map::new(),
        other => {
            let mut map = Map::new();
            map.insert("value".into(), other.clone());
            map
        }
    };
    if !ctx.inputs.is_empty() {
        let inputs: Map<String, Value> = ctx
            .inputs
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        out.insert("inputs".into(), Value::Object(inputs));
    }
    Value::Object(out)
}

fn invalid(ctx: &NodeContext, e: impl std::fmt::Display) -> WeaverError {
    WeaverError::NodeExecution {
        node: ctx.node_id.clone(),
        message: format!("invalid data: {}", e),
    }
}

pub struct PassthroughExecutor;

impl NodeExecutor for PassthroughExecutor {
    fn execute(&self, ctx: NodeContext) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move { Ok(merge_inputs(&ctx)) })
    }
}

#[derive(Deserialize)]
struct DelayData {
    #[serde(default)]
    ms: u64,
}

/// Sleeps `data.ms` milliseconds, then behaves like `passthrough`.
pub struct DelayExecutor;

impl NodeExecutor for DelayExecutor {
    fn execute(&self, ctx: NodeContext) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move {
            let params: DelayData =
                serde_json::from_value(ctx.data.clone()).map_err(|e| invalid(&ctx, e))?;
            tokio::time::sleep(Duration::from_millis(params.ms)).await;
            Ok(merge_inputs(&ctx))
        })
    }
}

#[derive(Deserialize)]
struct ShellData {
    command: String,
}

/// Runs `data.command` with `sh -c`.
///
/// Upstream results are passed as JSON in `WEAVER_INPUTS`. A non-zero exit
/// fails the node.
pub struct ShellExecutor;

impl NodeExecutor for ShellExecutor {
    fn execute(&self, ctx: NodeContext) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move {
            let params: ShellData =
                serde_json::from_value(ctx.data.clone()).map_err(|e| invalid(&ctx, e))?;
            let inputs = serde_json::to_string(&ctx.inputs)?;

            debug!(node_id = %ctx.node_id, command = %params.command, "Executing shell node");

            let output = tokio::process::Command::new("sh")
                .arg("-c")
                .arg(&params.command)
                .env("WEAVER_INPUTS", inputs)
                .env("WEAVER_NODE_ID", &ctx.node_id)
                .env("WEAVER_EXECUTION_ID", ctx.execution_id.as_str())
                .kill_on_drop(true)
                .output()
                .await
                .map_err(|e| WeaverError::NodeExecution {
                    node: ctx.node_id.clone(),
                    message: e.to_string(),
                })?;

            let stdout = String::from_utf8_lossy(&output.stdout).trim_end().to_string();
            let stderr = String::from_utf8_lossy(&output.stderr).trim_end().to_string();

            if !output.status.success() {
                let code = output.status.code().unwrap_or(-1);
                return Err(WeaverError::NodeExecution {
                    node: ctx.node_id.clone(),
                    message: format!("exit code {}: {}", code, stderr),
                });
            }

            Ok(json!({
                "stdout": stdout,
                "stderr": stderr,
                "exit_code": output.status.code().unwrap_or(0),
            }))
        })
    }
}

/// Always fails with `data.message`.
pub struct FailExecutor;

impl NodeExecutor for FailExecutor {
    fn execute(&self, ctx: NodeContext) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move {
            let message = ctx
                .data
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("node failed")
                .to_string();
            Err(WeaverError::NodeExecution {
                node: ctx.node_id,
                message,
            })
        })
    }
}
