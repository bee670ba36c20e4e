use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use weaver_core::error::{Result, WeaverError};
use weaver_core::types::{ExecutionId, ExecutionStatus, NodeContext, NodeStatus};

use crate::graph::{ExecutionNode, NodeIndex};
use crate::scheduler;

/// One run of a workflow.
///
/// Created by the graph builder in `pending` status and mutated only through
/// the [`Engine`](crate::Engine), which serializes every change. Once the
/// status is terminal the execution no longer changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    id: ExecutionId,
    workflow_id: String,
    status: ExecutionStatus,
    start_time: DateTime<Utc>,
    end_time: Option<DateTime<Utc>>,
    nodes: Vec<ExecutionNode>,
    index: HashMap<String, NodeIndex>,
    execution_order: Vec<String>,
    /// Ready nodes that have not finished yet (pending or running).
    current_batch: Vec<String>,
    completed_nodes: BTreeSet<String>,
    failed_nodes: BTreeSet<String>,
    skipped_nodes: BTreeSet<String>,
    results: BTreeMap<String, serde_json::Value>,
    errors: BTreeMap<String, String>,
}

/// What a single accepted mutation changed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Transition {
    /// Nodes that joined `current_batch`.
    pub newly_ready: Vec<String>,
    /// Nodes marked skipped by failure propagation.
    pub skipped: Vec<String>,
    /// Set when the mutation moved the execution into a terminal status.
    pub finished: Option<ExecutionStatus>,
}

impl Execution {
    pub(crate) fn new(
        workflow_id: &str,
        nodes: Vec<ExecutionNode>,
        index: HashMap<String, NodeIndex>,
        execution_order: Vec<String>,
    ) -> Self {
        Self {
            id: ExecutionId::new(),
            workflow_id: workflow_id.to_string(),
            status: ExecutionStatus::Pending,
            start_time: Utc::now(),
            end_time: None,
            nodes,
            index,
            execution_order,
            current_batch: vec![],
            completed_nodes: BTreeSet::new(),
            failed_nodes: BTreeSet::new(),
            skipped_nodes: BTreeSet::new(),
            results: BTreeMap::new(),
            errors: BTreeMap::new(),
        }
    }

    pub fn id(&self) -> &ExecutionId {
        &self.id
    }

    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    pub fn status(&self) -> ExecutionStatus {
        self.status
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    pub fn end_time(&self) -> Option<DateTime<Utc>> {
        self.end_time
    }

    pub fn duration_ms(&self) -> Option<u64> {
        self.end_time
            .map(|end| (end - self.start_time).num_milliseconds().max(0) as u64)
    }

    pub fn node(&self, id: &str) -> Option<&ExecutionNode> {
        self.index.get(id).map(|&i| &self.nodes[i])
    }

    /// Nodes in insertion order.
    pub fn nodes(&self) -> impl Iterator<Item = &ExecutionNode> {
        self.nodes.iter()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn node_status(&self, id: &str) -> Option<NodeStatus> {
        self.node(id).map(|n| n.status)
    }

    pub fn dependency_ids(&self, id: &str) -> Vec<&str> {
        self.node(id)
            .map(|n| n.dependencies.iter().map(|&d| self.nodes[d].id.as_str()).collect())
            .unwrap_or_default()
    }

    pub fn dependent_ids(&self, id: &str) -> Vec<&str> {
        self.node(id)
            .map(|n| n.dependents.iter().map(|&d| self.nodes[d].id.as_str()).collect())
            .unwrap_or_default()
    }

    /// Static topological order, for diagnostics.
    pub fn execution_order(&self) -> &[String] {
        &self.execution_order
    }

    pub fn current_batch(&self) -> &[String] {
        &self.current_batch
    }

    pub fn completed_nodes(&self) -> &BTreeSet<String> {
        &self.completed_nodes
    }

    pub fn failed_nodes(&self) -> &BTreeSet<String> {
        &self.failed_nodes
    }

    pub fn skipped_nodes(&self) -> &BTreeSet<String> {
        &self.skipped_nodes
    }

    pub fn results(&self) -> &BTreeMap<String, serde_json::Value> {
        &self.results
    }

    pub fn errors(&self) -> &BTreeMap<String, String> {
        &self.errors
    }

    /// Ids of nodes currently awaiting their executor.
    pub fn running_nodes(&self) -> Vec<&str> {
        self.nodes
            .iter()
            .filter(|n| n.status == NodeStatus::Running)
            .map(|n| n.id.as_str())
            .collect()
    }

    /// Results of completed nodes that nothing depends on.
    pub fn outputs(&self) -> BTreeMap<String, serde_json::Value> {
        self.nodes
            .iter()
            .filter(|n| n.is_sink())
            .filter_map(|n| n.result.clone().map(|r| (n.id.clone(), r)))
            .collect()
    }

    /// `pending -> running`; seeds `current_batch` with the root nodes.
    pub(crate) fn start(&mut self) -> Result<Transition> {
        match self.status {
            ExecutionStatus::Pending => {}
            ExecutionStatus::Running => {
                return Err(WeaverError::ExecutionAlreadyStarted(self.id.to_string()))
            }
            _ => return Err(self.terminal_error()),
        }

        self.status = ExecutionStatus::Running;
        self.start_time = Utc::now();

        let mut transition = Transition::default();
        self.merge_ready(&mut transition);
        transition.finished = self.finalize_if_drained();
        Ok(transition)
    }

    /// `pending -> running` for one ready node; returns what its executor needs.
    pub(crate) fn dispatch(&mut self, node_id: &str) -> Result<NodeContext> {
        self.ensure_running()?;
        let idx = self.lookup(node_id)?;
        let node = &self.nodes[idx];
        if node.status != NodeStatus::Pending || !self.current_batch.iter().any(|n| n == node_id) {
            return Err(WeaverError::NodeNotReady {
                node: node_id.to_string(),
                status: node.status.to_string(),
            });
        }

        let inputs = node
            .dependencies
            .iter()
            .filter_map(|&d| {
                let dep = &self.nodes[d];
                dep.result.clone().map(|r| (dep.id.clone(), r))
            })
            .collect();

        let node = &mut self.nodes[idx];
        node.status = NodeStatus::Running;
        node.start_time = Some(Utc::now());

        Ok(NodeContext {
            execution_id: self.id.clone(),
            workflow_id: self.workflow_id.clone(),
            node_id: node.id.clone(),
            node_type: node.node_type.clone(),
            data: node.data.clone(),
            inputs,
        })
    }

    /// Record a node's result and unlock its dependents.
    pub(crate) fn complete_node(
        &mut self,
        node_id: &str,
        result: serde_json::Value,
    ) -> Result<Transition> {
        let idx = self.finishable(node_id)?;
        let now = Utc::now();

        let node = &mut self.nodes[idx];
        node.status = NodeStatus::Completed;
        node.result = Some(result.clone());
        node.start_time.get_or_insert(now);
        node.end_time = Some(now);

        self.completed_nodes.insert(node_id.to_string());
        self.results.insert(node_id.to_string(), result);
        self.current_batch.retain(|n| n != node_id);

        let mut transition = Transition::default();
        self.merge_ready(&mut transition);
        transition.finished = self.finalize_if_drained();
        Ok(transition)
    }

    /// Record a node's error and skip everything downstream of it.
    pub(crate) fn fail_node(&mut self, node_id: &str, error: String) -> Result<Transition> {
        let idx = self.finishable(node_id)?;
        let now = Utc::now();

        let node = &mut self.nodes[idx];
        node.status = NodeStatus::Failed;
        node.error = Some(error.clone());
        node.start_time.get_or_insert(now);
        node.end_time = Some(now);

        self.failed_nodes.insert(node_id.to_string());
        self.errors.insert(node_id.to_string(), error);
        self.current_batch.retain(|n| n != node_id);

        let mut transition = Transition {
            skipped: self.skip_downstream(idx),
            ..Transition::default()
        };
        transition.finished = self.finalize_if_drained();
        Ok(transition)
    }

    /// Count a retried executor attempt on a running node.
    /// Status, batch and results are unchanged.
    pub(crate) fn record_retry(&mut self, node_id: &str) -> Result<u32> {
        self.ensure_running()?;
        let idx = self.lookup(node_id)?;
        let node = &mut self.nodes[idx];
        if node.status != NodeStatus::Running {
            return Err(WeaverError::NodeNotReady {
                node: node_id.to_string(),
                status: node.status.to_string(),
            });
        }
        node.retries += 1;
        Ok(node.retries)
    }

    /// Any non-terminal status -> `cancelled`. In-flight nodes keep their status.
    pub(crate) fn cancel(&mut self) -> Result<Transition> {
        if self.is_terminal() {
            return Err(self.terminal_error());
        }
        self.status = ExecutionStatus::Cancelled;
        self.end_time = Some(Utc::now());
        Ok(Transition {
            finished: Some(ExecutionStatus::Cancelled),
            ..Transition::default()
        })
    }

    fn lookup(&self, node_id: &str) -> Result<NodeIndex> {
        self.index
            .get(node_id)
            .copied()
            .ok_or_else(|| WeaverError::NodeNotFound {
                execution: self.id.to_string(),
                node: node_id.to_string(),
            })
    }

    fn terminal_error(&self) -> WeaverError {
        WeaverError::ExecutionTerminal {
            execution: self.id.to_string(),
            status: self.status.to_string(),
        }
    }

    fn ensure_running(&self) -> Result<()> {
        match self.status {
            ExecutionStatus::Running => Ok(()),
            s if s.is_terminal() => Err(self.terminal_error()),
            s => Err(WeaverError::ExecutionNotRunning {
                execution: self.id.to_string(),
                status: s.to_string(),
            }),
        }
    }

    /// A node may finish if it is running, or pending and in the current
    /// batch (dispatch and finish reported together).
    fn finishable(&self, node_id: &str) -> Result<NodeIndex> {
        self.ensure_running()?;
        let idx = self.lookup(node_id)?;
        let node = &self.nodes[idx];
        let ok = match node.status {
            NodeStatus::Running => true,
            NodeStatus::Pending => self.current_batch.iter().any(|n| n == node_id),
            _ => false,
        };
        if !ok {
            return Err(WeaverError::NodeNotReady {
                node: node_id.to_string(),
                status: node.status.to_string(),
            });
        }
        Ok(idx)
    }

    fn merge_ready(&mut self, transition: &mut Transition) {
        for idx in scheduler::ready_set(&self.nodes) {
            let id = &self.nodes[idx].id;
            if !self.current_batch.contains(id) {
                self.current_batch.push(id.clone());
                transition.newly_ready.push(id.clone());
            }
        }
    }

    /// Breadth-first over `dependents`, skipping every still-pending node.
    /// Stops at nodes that already reached a terminal status.
    fn skip_downstream(&mut self, failed: NodeIndex) -> Vec<String> {
        let mut skipped = Vec::new();
        let mut queue: VecDeque<NodeIndex> = self.nodes[failed].dependents.iter().copied().collect();

        while let Some(idx) = queue.pop_front() {
            let node = &mut self.nodes[idx];
            if node.status != NodeStatus::Pending {
                continue;
            }
            node.status = NodeStatus::Skipped;
            self.skipped_nodes.insert(node.id.clone());
            skipped.push(node.id.clone());
            queue.extend(node.dependents.iter().copied());
        }

        let skipped_set: BTreeSet<&str> = skipped.iter().map(|s| s.as_str()).collect();
        self.current_batch.retain(|n| !skipped_set.contains(n.as_str()));
        skipped
    }

    /// An empty batch means no node can make further progress.
    fn finalize_if_drained(&mut self) -> Option<ExecutionStatus> {
        if !self.current_batch.is_empty() {
            return None;
        }
        let status = if self.failed_nodes.is_empty() {
            ExecutionStatus::Completed
        } else {
            ExecutionStatus::Failed
        };
        self.status = status;
        self.end_time = Some(Utc::now());
        Some(status)
    }
}
