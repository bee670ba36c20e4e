use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use weaver_core::config::{AppConfig, RetryConfig};
use weaver_core::error::{Result, WeaverError};
use weaver_core::traits::{NodeExecutor, WorkflowStore};
use weaver_core::types::{ExecutionId, ExecutionStatus, NodeContext, NodeStatus, WorkflowDef};

use crate::coordinator::Engine;
use crate::execution::Execution;
use crate::executors::ExecutorRegistry;

/// Limits for one run.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub max_concurrency: usize,
    /// Deadline for the whole execution.
    pub timeout: Duration,
    /// Deadline for a single executor call; each retry gets a fresh one.
    pub node_timeout: Duration,
    pub retry: RetryConfig,
}

impl From<&AppConfig> for RunnerConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            max_concurrency: config.engine.max_concurrency.max(1),
            timeout: Duration::from_secs(config.engine.timeout_secs),
            node_timeout: Duration::from_secs(config.engine.node_timeout_secs),
            retry: config.retry.clone(),
        }
    }
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

/// Outcome of one run, built from the terminal snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub execution_id: ExecutionId,
    pub workflow_id: String,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub results: BTreeMap<String, serde_json::Value>,
    pub errors: BTreeMap<String, String>,
    /// Results of completed nodes nothing depends on.
    pub outputs: BTreeMap<String, serde_json::Value>,
    pub total_nodes: usize,
    pub completed_nodes: usize,
    pub failed_nodes: usize,
    pub skipped_nodes: usize,
}

impl RunSummary {
    pub fn from_execution(execution: &Execution) -> Self {
        Self {
            execution_id: execution.id().clone(),
            workflow_id: execution.workflow_id().to_string(),
            status: execution.status(),
            started_at: execution.start_time(),
            finished_at: execution.end_time(),
            duration_ms: execution.duration_ms(),
            results: execution.results().clone(),
            errors: execution.errors().clone(),
            outputs: execution.outputs(),
            total_nodes: execution.node_count(),
            completed_nodes: execution.completed_nodes().len(),
            failed_nodes: execution.failed_nodes().len(),
            skipped_nodes: execution.skipped_nodes().len(),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.status == ExecutionStatus::Completed
    }
}

/// Drives executions end-to-end against registered node executors.
///
/// Ready nodes are dispatched through the [`Engine`] and executed on a
/// `JoinSet`, at most `max_concurrency` at a time. Each task reports exactly
/// one outcome back to the engine, so the engine's state machine stays the
/// single source of truth for what runs next.
pub struct WorkflowRunner {
    engine: Arc<Engine>,
    executors: Arc<ExecutorRegistry>,
    config: RunnerConfig,
    store: Option<Arc<dyn WorkflowStore>>,
    cancel: CancellationToken,
}

impl WorkflowRunner {
    pub fn new(engine: Arc<Engine>, executors: Arc<ExecutorRegistry>, config: RunnerConfig) -> Self {
        Self {
            engine,
            executors,
            config,
            store: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Persist workflow definitions and terminal snapshots to `store`.
    pub fn with_store(mut self, store: Arc<dyn WorkflowStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Stop runs when `cancel` fires.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Build, register and run a workflow.
    pub async fn run(&self, workflow: &WorkflowDef) -> Result<RunSummary> {
        let execution = self.engine.create(workflow)?;
        if let Some(store) = &self.store {
            if let Err(e) = store.save_workflow(workflow).await {
                warn!(workflow_id = %workflow.id, error = %e, "Failed to save workflow");
            }
        }
        self.run_execution(execution.id()).await
    }

    /// Start and drive an already registered execution to a terminal status.
    ///
    /// Returns `WorkflowTimeout` when the overall deadline passes and
    /// `Cancelled` when the runner's token fires; in both cases the execution
    /// is cancelled first. An external `Engine::cancel` ends the run normally
    /// with a `cancelled` summary.
    pub async fn run_execution(&self, id: &ExecutionId) -> Result<RunSummary> {
        let (subscription, updates) = self.engine.subscribe_channel(id)?;
        if let Err(e) = self.engine.start(id) {
            subscription.unsubscribe();
            return Err(e);
        }

        let outcome = tokio::time::timeout(self.config.timeout, self.drive(id, updates)).await;
        subscription.unsubscribe();

        let result = match outcome {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e),
            Err(_) => {
                let secs = self.config.timeout.as_secs();
                warn!(execution_id = %id, timeout_secs = secs, "Execution timed out");
                if let Err(e) = self.engine.cancel(id) {
                    debug!(execution_id = %id, error = %e, "Cancel after timeout rejected");
                }
                Err(WeaverError::WorkflowTimeout(secs))
            }
        };

        self.persist(id).await;
        result?;

        let execution = self
            .engine
            .get(id)
            .ok_or_else(|| WeaverError::ExecutionNotFound(id.to_string()))?;
        Ok(RunSummary::from_execution(&execution))
    }

    async fn drive(
        &self,
        id: &ExecutionId,
        mut updates: mpsc::UnboundedReceiver<Execution>,
    ) -> Result<()> {
        let mut tasks: JoinSet<()> = JoinSet::new();
        let max = self.config.max_concurrency.max(1);

        loop {
            let snapshot = self
                .engine
                .get(id)
                .ok_or_else(|| WeaverError::ExecutionNotFound(id.to_string()))?;
            if snapshot.is_terminal() {
                if !tasks.is_empty() {
                    debug!(execution_id = %id, in_flight = tasks.len(), "Aborting in-flight nodes");
                }
                tasks.abort_all();
                return Ok(());
            }

            for node_id in snapshot.current_batch() {
                if tasks.len() >= max {
                    break;
                }
                if snapshot.node_status(node_id) != Some(NodeStatus::Pending) {
                    continue;
                }
                match self.engine.dispatch_node(id, node_id) {
                    Ok(ctx) => {
                        tasks.spawn(run_node(
                            self.engine.clone(),
                            self.executors.clone(),
                            self.config.clone(),
                            ctx,
                        ));
                    }
                    Err(e) => {
                        debug!(execution_id = %id, node_id = %node_id, error = %e, "Dispatch rejected");
                        break;
                    }
                }
            }

            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!(execution_id = %id, "Run cancelled");
                    tasks.abort_all();
                    if let Err(e) = self.engine.cancel(id) {
                        debug!(execution_id = %id, error = %e, "Cancel rejected");
                    }
                    return Err(WeaverError::Cancelled);
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        if e.is_panic() {
                            error!(execution_id = %id, "Node task panicked outside executor");
                        }
                    }
                }
                update = updates.recv() => {
                    if update.is_none() {
                        return Err(WeaverError::ExecutionNotFound(id.to_string()));
                    }
                }
            }

            // Collapse queued snapshots; the next iteration reads fresh state.
            while updates.try_recv().is_ok() {}
        }
    }

    async fn persist(&self, id: &ExecutionId) {
        let Some(store) = &self.store else {
            return;
        };
        let record = match self.engine.record(id) {
            Ok(record) => record,
            Err(e) => {
                warn!(execution_id = %id, error = %e, "No execution to persist");
                return;
            }
        };
        match store.save_execution(&record).await {
            Ok(()) => debug!(execution_id = %id, status = %record.status, "Execution persisted"),
            Err(e) => warn!(execution_id = %id, error = %e, "Failed to persist execution"),
        }
    }
}

/// Execute one dispatched node and report its single outcome.
async fn run_node(
    engine: Arc<Engine>,
    executors: Arc<ExecutorRegistry>,
    config: RunnerConfig,
    ctx: NodeContext,
) {
    let execution_id = ctx.execution_id.clone();
    let node_id = ctx.node_id.clone();

    let outcome = execute_with_retry(&engine, &executors, &config, ctx).await;
    let reported = match outcome {
        Ok(value) => engine.complete_node(&execution_id, &node_id, value),
        Err(e) => engine.fail_node(&execution_id, &node_id, e.to_string()),
    };
    if let Err(e) = reported {
        debug!(execution_id = %execution_id, node_id = %node_id, error = %e, "Outcome discarded");
    }
}

async fn execute_with_retry(
    engine: &Engine,
    executors: &ExecutorRegistry,
    config: &RunnerConfig,
    ctx: NodeContext,
) -> Result<serde_json::Value> {
    let executor = executors.resolve(&ctx.node_type)?;

    let mut attempt = 0;
    loop {
        match invoke(executor.as_ref(), ctx.clone(), config.node_timeout).await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < config.retry.max_retries => {
                let delay = calculate_backoff(attempt, &config.retry);
                attempt += 1;
                warn!(
                    execution_id = %ctx.execution_id,
                    node_id = %ctx.node_id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Node failed, retrying"
                );
                if let Err(rejected) =
                    engine.record_retry(&ctx.execution_id, &ctx.node_id, attempt, &e.to_string())
                {
                    // Execution went terminal; another attempt would be discarded
                    debug!(node_id = %ctx.node_id, error = %rejected, "Retry abandoned");
                    return Err(e);
                }
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// One executor call under the node deadline. Panics become node errors.
async fn invoke(
    executor: &dyn NodeExecutor,
    ctx: NodeContext,
    timeout: Duration,
) -> Result<serde_json::Value> {
    let node = ctx.node_id.clone();
    let call = AssertUnwindSafe(executor.execute(ctx)).catch_unwind();
    match tokio::time::timeout(timeout, call).await {
        Ok(Ok(result)) => result,
        Ok(Err(panic)) => Err(WeaverError::NodeExecution {
            node,
            message: panic_message(&*panic),
        }),
        Err(_) => Err(WeaverError::NodeTimeout {
            node,
            timeout_secs: timeout.as_secs(),
        }),
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("executor panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("executor panicked: {s}")
    } else {
        "executor panicked".to_string()
    }
}

/// `initial * 2^attempt`, capped, with 0.8x to 1.2x jitter.
fn calculate_backoff(attempt: u32, config: &RetryConfig) -> Duration {
    let ms = config
        .initial_backoff_ms
        .saturating_mul(2u64.saturating_pow(attempt))
        .min(config.max_backoff_ms);
    let jitter = 0.8 + rand::random::<f64>() * 0.4;
    Duration::from_millis((ms as f64 * jitter) as u64)
}
