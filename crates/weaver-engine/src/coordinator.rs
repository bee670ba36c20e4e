use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use weaver_core::error::{Result, WeaverError};
use weaver_core::event::EventBus;
use weaver_core::traits::ExecutionRecord;
use weaver_core::types::{
    EdgeDef, ExecutionEvent, ExecutionId, NodeContext, NodeDef, WorkflowDef,
};

use crate::execution::{Execution, Transition};
use crate::graph;
use crate::metrics::ExecutionMetrics;
use crate::notify::Subscription;
use crate::registry::{ExecutionRegistry, ExecutionSlot, ExecutionStats, SlotState};

/// Execution coordinator.
///
/// Owns every execution through an [`ExecutionRegistry`]. Each mutation locks
/// only the target execution, applies the state transition, publishes
/// [`ExecutionEvent`]s on the shared [`EventBus`] and queues the new snapshot.
/// The lock is released before subscribers see the snapshot, so callbacks may
/// read, cancel or report on the same execution. Rejected calls return a
/// coordination error and leave the execution untouched.
pub struct Engine {
    registry: ExecutionRegistry,
    event_bus: Arc<EventBus>,
}

impl Engine {
    pub fn new(event_bus: Arc<EventBus>) -> Self {
        Self {
            registry: ExecutionRegistry::new(),
            event_bus,
        }
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    pub fn registry(&self) -> &ExecutionRegistry {
        &self.registry
    }

    /// Build an execution from nodes and edges and register it.
    /// Nothing is registered when the build fails.
    pub fn build(&self, workflow_id: &str, nodes: &[NodeDef], edges: &[EdgeDef]) -> Result<Execution> {
        let execution = graph::build(workflow_id, nodes, edges).map_err(|e| {
            warn!(workflow_id, error = %e, "Workflow build failed");
            e
        })?;
        info!(
            execution_id = %execution.id(),
            workflow_id,
            nodes = execution.node_count(),
            "Execution created"
        );
        self.registry.insert(execution.clone());
        Ok(execution)
    }

    /// Build and register an execution of a stored workflow.
    pub fn create(&self, workflow: &WorkflowDef) -> Result<Execution> {
        self.build(&workflow.id, &workflow.nodes, &workflow.edges)
    }

    /// Move a pending execution to running and compute its first batch.
    pub fn start(&self, id: &ExecutionId) -> Result<()> {
        let slot = self.slot(id)?;
        let mut state = slot.lock();
        let transition = state.execution.start().map_err(|e| rejected(id, "start", e))?;

        info!(
            execution_id = %id,
            ready = ?transition.newly_ready,
            "Execution started"
        );
        self.event_bus.publish(ExecutionEvent::ExecutionStarted {
            execution_id: id.clone(),
            workflow_id: state.execution.workflow_id().to_string(),
            total_nodes: state.execution.node_count(),
        });
        // An empty graph finishes here; subscribers hear nothing from start.
        self.publish_transition(&state, &transition, None);
        Ok(())
    }

    /// Mark a ready node running and return the context for its executor.
    pub fn dispatch_node(&self, id: &ExecutionId, node_id: &str) -> Result<NodeContext> {
        let slot = self.slot(id)?;
        let ctx = {
            let mut state = slot.lock();
            let ctx = state
                .execution
                .dispatch(node_id)
                .map_err(|e| rejected(id, "dispatch", e))?;

            debug!(execution_id = %id, node_id, node_type = %ctx.node_type, "Node dispatched");
            self.event_bus.publish(ExecutionEvent::NodeDispatched {
                execution_id: id.clone(),
                node_id: node_id.to_string(),
                node_type: ctx.node_type.clone(),
            });
            slot.enqueue(&state);
            ctx
        };
        slot.deliver();
        Ok(ctx)
    }

    /// Report a node's result.
    pub fn complete_node(
        &self,
        id: &ExecutionId,
        node_id: &str,
        result: serde_json::Value,
    ) -> Result<()> {
        let slot = self.slot(id)?;
        {
            let mut state = slot.lock();
            let transition = state
                .execution
                .complete_node(node_id, result)
                .map_err(|e| rejected(id, "complete_node", e))?;

            let elapsed_ms = state.execution.node(node_id).and_then(|n| n.elapsed_ms());
            debug!(
                execution_id = %id,
                node_id,
                elapsed_ms,
                ready = ?transition.newly_ready,
                "Node completed"
            );
            self.event_bus.publish(ExecutionEvent::NodeCompleted {
                execution_id: id.clone(),
                node_id: node_id.to_string(),
                elapsed_ms,
            });
            self.after_mutation(&slot, &state, &transition, None);
        }
        slot.deliver();
        Ok(())
    }

    /// Report a node's error; its downstream nodes are skipped.
    pub fn fail_node(&self, id: &ExecutionId, node_id: &str, error: impl Into<String>) -> Result<()> {
        let error = error.into();
        let slot = self.slot(id)?;
        {
            let mut state = slot.lock();
            let transition = state
                .execution
                .fail_node(node_id, error.clone())
                .map_err(|e| rejected(id, "fail_node", e))?;

            warn!(
                execution_id = %id,
                node_id,
                error = %error,
                skipped = ?transition.skipped,
                "Node failed"
            );
            self.event_bus.publish(ExecutionEvent::NodeFailed {
                execution_id: id.clone(),
                node_id: node_id.to_string(),
                error,
            });
            self.after_mutation(&slot, &state, &transition, Some(node_id));
        }
        slot.deliver();
        Ok(())
    }

    /// Cancel a non-terminal execution.
    ///
    /// In-flight executor calls are not interrupted; their later reports are
    /// rejected because the execution is terminal.
    pub fn cancel(&self, id: &ExecutionId) -> Result<()> {
        let slot = self.slot(id)?;
        {
            let mut state = slot.lock();
            let transition = state.execution.cancel().map_err(|e| rejected(id, "cancel", e))?;
            self.after_mutation(&slot, &state, &transition, None);
        }
        slot.deliver();
        Ok(())
    }

    /// Count a retried attempt of a running node and publish `NodeRetrying`.
    ///
    /// Only the node's retry counter changes, so subscribers are not notified.
    pub fn record_retry(
        &self,
        id: &ExecutionId,
        node_id: &str,
        attempt: u32,
        error: &str,
    ) -> Result<()> {
        let slot = self.slot(id)?;
        let mut state = slot.lock();
        let retries = state
            .execution
            .record_retry(node_id)
            .map_err(|e| rejected(id, "record_retry", e))?;

        debug!(execution_id = %id, node_id, attempt, retries, "Node retry recorded");
        self.event_bus.publish(ExecutionEvent::NodeRetrying {
            execution_id: id.clone(),
            node_id: node_id.to_string(),
            attempt,
            error: error.to_string(),
        });
        Ok(())
    }

    /// Remove an execution and its subscribers. Returns false if unknown.
    pub fn cleanup(&self, id: &ExecutionId) -> bool {
        let removed = self.registry.remove(id);
        debug!(execution_id = %id, removed, "Execution cleaned up");
        removed
    }

    /// Current snapshot of an execution.
    pub fn get(&self, id: &ExecutionId) -> Option<Execution> {
        self.registry.get(id)
    }

    /// Register a callback receiving a snapshot after every later mutation.
    pub fn subscribe<F>(&self, id: &ExecutionId, callback: F) -> Result<Subscription>
    where
        F: Fn(&Execution) + Send + Sync + 'static,
    {
        let slot = self.slot(id)?;
        let sid = slot.lock().subscribers.add(Arc::new(callback));
        debug!(execution_id = %id, subscriber = sid, "Subscribed");
        Ok(Subscription::new(id.clone(), sid, &slot))
    }

    /// Channel flavour of [`subscribe`](Self::subscribe) for async observers.
    pub fn subscribe_channel(
        &self,
        id: &ExecutionId,
    ) -> Result<(Subscription, mpsc::UnboundedReceiver<Execution>)> {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscription = self.subscribe(id, move |execution| {
            // Receiver gone means the observer stopped listening
            let _ = tx.send(execution.clone());
        })?;
        Ok((subscription, rx))
    }

    /// Registered execution ids, optionally for one workflow.
    pub fn list(&self, workflow_id: Option<&str>) -> Vec<ExecutionId> {
        self.registry.ids(workflow_id)
    }

    pub fn statistics(&self, workflow_id: Option<&str>) -> ExecutionStats {
        self.registry.statistics(workflow_id)
    }

    /// Per-node timing, throughput and retry figures for one execution.
    pub fn metrics(&self, id: &ExecutionId) -> Option<ExecutionMetrics> {
        self.get(id).map(|execution| ExecutionMetrics::from_execution(&execution))
    }

    /// Persistable record of an execution.
    pub fn record(&self, id: &ExecutionId) -> Result<ExecutionRecord> {
        let execution = self
            .get(id)
            .ok_or_else(|| WeaverError::ExecutionNotFound(id.to_string()))?;
        Ok(ExecutionRecord {
            execution_id: execution.id().clone(),
            workflow_id: execution.workflow_id().to_string(),
            status: execution.status(),
            started_at: execution.start_time(),
            finished_at: execution.end_time(),
            snapshot: serde_json::to_value(&execution)?,
        })
    }

    fn slot(&self, id: &ExecutionId) -> Result<Arc<ExecutionSlot>> {
        self.registry.slot(id).ok_or_else(|| {
            warn!(execution_id = %id, "Unknown execution");
            WeaverError::ExecutionNotFound(id.to_string())
        })
    }

    /// Publish skip/finish events and queue one snapshot for subscribers.
    fn after_mutation(
        &self,
        slot: &ExecutionSlot,
        state: &SlotState,
        transition: &Transition,
        cause: Option<&str>,
    ) {
        self.publish_transition(state, transition, cause);
        slot.enqueue(state);
    }

    fn publish_transition(&self, state: &SlotState, transition: &Transition, cause: Option<&str>) {
        let id = state.execution.id();
        for node_id in &transition.skipped {
            self.event_bus.publish(ExecutionEvent::NodeSkipped {
                execution_id: id.clone(),
                node_id: node_id.clone(),
                cause: cause.unwrap_or_default().to_string(),
            });
        }
        if let Some(status) = transition.finished {
            info!(
                execution_id = %id,
                status = %status,
                completed = state.execution.completed_nodes().len(),
                failed = state.execution.failed_nodes().len(),
                skipped = state.execution.skipped_nodes().len(),
                duration_ms = state.execution.duration_ms(),
                "Execution finished"
            );
            self.event_bus.publish(ExecutionEvent::ExecutionFinished {
                execution_id: id.clone(),
                status,
                finished_at: state.execution.end_time().unwrap_or_else(chrono::Utc::now),
            });
        }
    }
}

fn rejected(id: &ExecutionId, op: &str, err: WeaverError) -> WeaverError {
    debug!(execution_id = %id, op, error = %err, "Rejected");
    err
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use serde_json::json;
    use weaver_core::types::{ExecutionStatus, NodeStatus};

    fn engine() -> Engine {
        Engine::new(Arc::new(EventBus::default()))
    }

    fn chain(engine: &Engine) -> ExecutionId {
        let nodes = vec![NodeDef::new("a", "t"), NodeDef::new("b", "t"), NodeDef::new("c", "t")];
        let edges = vec![EdgeDef::new("a", "b"), EdgeDef::new("b", "c")];
        engine.build("wf", &nodes, &edges).unwrap().id().clone()
    }

    fn recorder(engine: &Engine, id: &ExecutionId) -> (Subscription, Arc<Mutex<Vec<Execution>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let sub = engine
            .subscribe(id, move |e| sink.lock().unwrap().push(e.clone()))
            .unwrap();
        (sub, seen)
    }

    #[test]
    fn test_chain_emits_one_snapshot_per_completion() {
        let engine = engine();
        let id = chain(&engine);
        let (_sub, seen) = recorder(&engine, &id);

        engine.start(&id).unwrap();
        assert_eq!(engine.get(&id).unwrap().current_batch(), ["a"]);
        engine.complete_node(&id, "a", json!("A")).unwrap();
        assert_eq!(engine.get(&id).unwrap().current_batch(), ["b"]);
        engine.complete_node(&id, "b", json!("B")).unwrap();
        assert_eq!(engine.get(&id).unwrap().current_batch(), ["c"]);
        engine.complete_node(&id, "c", json!("C")).unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[0].completed_nodes().len(), 1);
        assert_eq!(seen[1].completed_nodes().len(), 2);
        assert_eq!(seen[2].status(), ExecutionStatus::Completed);
    }

    #[test]
    fn test_build_error_registers_nothing() {
        let engine = engine();
        let nodes = vec![NodeDef::new("a", "t")];
        let err = engine.build("wf", &nodes, &[EdgeDef::new("a", "a")]).unwrap_err();
        assert!(err.is_build_error());
        assert!(engine.list(None).is_empty());
    }

    #[test]
    fn test_failure_notifies_once_and_finishes() {
        let engine = engine();
        let id = chain(&engine);
        engine.start(&id).unwrap();
        engine.complete_node(&id, "a", json!(1)).unwrap();

        let (_sub, seen) = recorder(&engine, &id);
        engine.fail_node(&id, "b", "bad input").unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        let snap = &seen[0];
        assert_eq!(snap.status(), ExecutionStatus::Failed);
        assert_eq!(snap.node_status("c"), Some(NodeStatus::Skipped));
        assert!(snap.current_batch().is_empty());
    }

    #[test]
    fn test_rejected_calls_do_not_notify() {
        let engine = engine();
        let id = chain(&engine);
        engine.start(&id).unwrap();
        let (_sub, seen) = recorder(&engine, &id);

        assert!(engine.complete_node(&id, "c", json!(1)).is_err());
        assert!(engine.complete_node(&id, "zzz", json!(1)).is_err());
        assert!(matches!(
            engine.complete_node(&ExecutionId::from_str("nope"), "a", json!(1)),
            Err(WeaverError::ExecutionNotFound(_))
        ));
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_terminal_execution_ignores_reports() {
        let engine = engine();
        let id = chain(&engine);
        engine.start(&id).unwrap();
        engine.dispatch_node(&id, "a").unwrap();
        engine.cancel(&id).unwrap();
        let (_sub, seen) = recorder(&engine, &id);

        assert!(engine.complete_node(&id, "a", json!(1)).is_err());
        assert!(engine.fail_node(&id, "a", "x").is_err());
        assert!(engine.cancel(&id).is_err());

        let snap = engine.get(&id).unwrap();
        assert_eq!(snap.status(), ExecutionStatus::Cancelled);
        assert_eq!(snap.node_status("a"), Some(NodeStatus::Running));
        assert!(snap.results().is_empty());
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let engine = engine();
        let id = chain(&engine);
        let (sub, seen) = recorder(&engine, &id);
        let (_other, other_seen) = recorder(&engine, &id);

        engine.start(&id).unwrap();
        engine.complete_node(&id, "a", json!(1)).unwrap();
        assert!(sub.unsubscribe());
        engine.complete_node(&id, "b", json!(2)).unwrap();

        assert_eq!(seen.lock().unwrap().len(), 1);
        assert_eq!(other_seen.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_cleanup_removes_execution_and_subscribers() {
        let engine = engine();
        let id = chain(&engine);
        let (sub, _seen) = recorder(&engine, &id);

        assert!(engine.cleanup(&id));
        assert!(engine.get(&id).is_none());
        assert!(!sub.unsubscribe());
        assert!(!engine.cleanup(&id));
        assert!(matches!(engine.start(&id), Err(WeaverError::ExecutionNotFound(_))));
    }

    #[tokio::test]
    async fn test_channel_subscription_preserves_order() {
        let engine = engine();
        let id = chain(&engine);
        let (_sub, mut rx) = engine.subscribe_channel(&id).unwrap();

        engine.start(&id).unwrap();
        engine.dispatch_node(&id, "a").unwrap();
        engine.complete_node(&id, "a", json!(1)).unwrap();
        engine.complete_node(&id, "b", json!(2)).unwrap();
        engine.cancel(&id).unwrap();

        let mut statuses = Vec::new();
        while let Ok(snap) = rx.try_recv() {
            statuses.push((snap.completed_nodes().len(), snap.status()));
        }
        assert_eq!(
            statuses,
            vec![
                (0, ExecutionStatus::Running),
                (1, ExecutionStatus::Running),
                (2, ExecutionStatus::Running),
                (2, ExecutionStatus::Cancelled),
            ]
        );
    }

    #[tokio::test]
    async fn test_events_published_to_bus() {
        let engine = engine();
        let mut rx = engine.event_bus().subscribe();
        let id = chain(&engine);
        engine.start(&id).unwrap();
        engine.complete_node(&id, "a", json!(1)).unwrap();
        engine.fail_node(&id, "b", "boom").unwrap();

        let mut kinds = Vec::new();
        while let Ok(event) = rx.try_recv() {
            kinds.push(serde_json::to_value(&event).unwrap()["type"].as_str().unwrap().to_string());
        }
        assert_eq!(
            kinds,
            vec![
                "execution_started",
                "node_completed",
                "node_failed",
                "node_skipped",
                "execution_finished"
            ]
        );
    }

    #[test]
    fn test_concurrent_reports_on_distinct_executions() {
        let engine = Arc::new(engine());
        let ids: Vec<ExecutionId> = (0..8).map(|_| chain(&engine)).collect();

        std::thread::scope(|scope| {
            for id in &ids {
                let engine = engine.clone();
                scope.spawn(move || {
                    engine.start(id).unwrap();
                    for node in ["a", "b", "c"] {
                        engine.complete_node(id, node, json!(node)).unwrap();
                    }
                });
            }
        });

        for id in &ids {
            assert_eq!(engine.get(id).unwrap().status(), ExecutionStatus::Completed);
        }
        let stats = engine.statistics(Some("wf"));
        assert_eq!(stats.total_executions, 8);
        assert!((stats.success_rate - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_empty_workflow_completes_on_start() {
        let engine = engine();
        let id = engine.build("empty", &[], &[]).unwrap().id().clone();
        let (_sub, seen) = recorder(&engine, &id);
        engine.start(&id).unwrap();

        assert_eq!(engine.get(&id).unwrap().status(), ExecutionStatus::Completed);
        assert!(seen.lock().unwrap().is_empty());
        assert!(engine.start(&id).is_err());
    }

    #[test]
    fn test_subscriber_can_read_same_execution() {
        let engine = Arc::new(engine());
        let id = chain(&engine);
        let observed = Arc::new(Mutex::new(Vec::new()));

        let (e2, id2, sink) = (engine.clone(), id.clone(), observed.clone());
        let _sub = engine
            .subscribe(&id, move |_| {
                let current = e2.get(&id2).map(|e| e.completed_nodes().len());
                sink.lock().unwrap().push(current);
            })
            .unwrap();

        engine.start(&id).unwrap();
        engine.complete_node(&id, "a", json!(1)).unwrap();
        engine.complete_node(&id, "b", json!(2)).unwrap();

        assert_eq!(*observed.lock().unwrap(), vec![Some(1), Some(2)]);
    }

    #[test]
    fn test_subscriber_can_cancel_same_execution() {
        let engine = Arc::new(engine());
        let id = chain(&engine);
        let (_rec, seen) = recorder(&engine, &id);

        let (e2, id2) = (engine.clone(), id.clone());
        let _canceller = engine
            .subscribe(&id, move |snapshot| {
                if snapshot.status() == ExecutionStatus::Running {
                    e2.cancel(&id2).unwrap();
                }
            })
            .unwrap();

        engine.start(&id).unwrap();
        engine.complete_node(&id, "a", json!(1)).unwrap();

        assert_eq!(engine.get(&id).unwrap().status(), ExecutionStatus::Cancelled);
        // The nested cancel is delivered after the snapshot that caused it
        let statuses: Vec<ExecutionStatus> = seen.lock().unwrap().iter().map(|e| e.status()).collect();
        assert_eq!(statuses, vec![ExecutionStatus::Running, ExecutionStatus::Cancelled]);
    }

    #[test]
    fn test_concurrent_reports_keep_per_execution_order() {
        let engine = Arc::new(engine());
        let nodes: Vec<NodeDef> = (0..16).map(|i| NodeDef::new(format!("n{i}"), "t")).collect();
        let id = engine.build("wide", &nodes, &[]).unwrap().id().clone();
        let (_sub, seen) = recorder(&engine, &id);
        engine.start(&id).unwrap();

        std::thread::scope(|scope| {
            for chunk in nodes.chunks(4) {
                let engine = engine.clone();
                let id = id.clone();
                scope.spawn(move || {
                    for node in chunk {
                        engine.complete_node(&id, &node.id, json!(1)).unwrap();
                    }
                });
            }
        });

        let counts: Vec<usize> = seen.lock().unwrap().iter().map(|e| e.completed_nodes().len()).collect();
        assert_eq!(counts, (1..=16).collect::<Vec<_>>());
    }

    #[test]
    fn test_record_retry_counts_without_notifying() {
        let engine = engine();
        let mut bus = engine.event_bus().subscribe();
        let id = chain(&engine);
        engine.start(&id).unwrap();
        engine.dispatch_node(&id, "a").unwrap();
        let (_sub, seen) = recorder(&engine, &id);

        engine.record_retry(&id, "a", 1, "flaky").unwrap();
        engine.record_retry(&id, "a", 2, "flaky").unwrap();
        assert!(engine.record_retry(&id, "b", 1, "not running").is_err());

        assert_eq!(engine.get(&id).unwrap().node("a").unwrap().retries, 2);
        assert_eq!(engine.metrics(&id).unwrap().total_retries, 2);
        assert!(seen.lock().unwrap().is_empty());

        let retrying = std::iter::from_fn(|| bus.try_recv().ok())
            .filter(|e| matches!(e, ExecutionEvent::NodeRetrying { .. }))
            .count();
        assert_eq!(retrying, 2);
    }

    #[test]
    fn test_record_snapshot() {
        let engine = engine();
        let id = chain(&engine);
        engine.start(&id).unwrap();
        engine.cancel(&id).unwrap();

        let record = engine.record(&id).unwrap();
        assert_eq!(record.execution_id, id);
        assert_eq!(record.status, ExecutionStatus::Cancelled);
        assert!(record.finished_at.is_some());
        assert_eq!(record.snapshot["workflow_id"], "wf");
    }
}
