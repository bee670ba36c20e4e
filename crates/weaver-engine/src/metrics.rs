//! Per-execution performance view computed from a snapshot.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use weaver_core::types::{ExecutionId, NodeStatus};

use crate::execution::Execution;
use crate::registry::{result_cost, result_tokens};

/// A node is a bottleneck when it took more than this many times the
/// average completed-node duration.
const BOTTLENECK_FACTOR: f64 = 2.0;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ExecutionMetrics {
    pub execution_id: ExecutionId,
    pub total_nodes: usize,
    pub completed_nodes: usize,
    pub failed_nodes: usize,
    /// Dispatch-to-finish time of every finished node.
    pub node_durations: BTreeMap<String, u64>,
    /// Mean over completed nodes with a non-zero duration.
    pub average_node_duration_ms: f64,
    /// Completed nodes per second of execution wall time.
    pub throughput_per_second: f64,
    /// Percentage of all nodes that completed.
    pub success_rate: f64,
    /// Nodes slower than twice the average, in insertion order.
    pub bottlenecks: Vec<String>,
    /// Retried attempts per node; nodes never retried are absent.
    pub retry_counts: BTreeMap<String, u32>,
    pub total_retries: u32,
    pub total_tokens: u64,
    pub total_cost: f64,
    pub running_nodes: Vec<String>,
}

impl ExecutionMetrics {
    pub fn from_execution(execution: &Execution) -> Self {
        Self::at(execution, Utc::now())
    }

    /// Metrics as of `now`; wall time of a running execution ends there.
    pub fn at(execution: &Execution, now: DateTime<Utc>) -> Self {
        let mut node_durations = BTreeMap::new();
        let mut completed_durations = Vec::new();
        let mut retry_counts = BTreeMap::new();

        for node in execution.nodes() {
            if let Some(ms) = node.elapsed_ms() {
                node_durations.insert(node.id.clone(), ms);
                if node.status == NodeStatus::Completed && ms > 0 {
                    completed_durations.push(ms);
                }
            }
            if node.retries > 0 {
                retry_counts.insert(node.id.clone(), node.retries);
            }
        }

        let average_node_duration_ms = if completed_durations.is_empty() {
            0.0
        } else {
            completed_durations.iter().sum::<u64>() as f64 / completed_durations.len() as f64
        };

        let bottlenecks = execution
            .nodes()
            .filter(|n| {
                node_durations
                    .get(&n.id)
                    .is_some_and(|&ms| ms as f64 > average_node_duration_ms * BOTTLENECK_FACTOR)
            })
            .map(|n| n.id.clone())
            .collect();

        let total_nodes = execution.node_count();
        let completed_nodes = execution.completed_nodes().len();
        let end = execution.end_time().unwrap_or(now);
        let wall_ms = (end - execution.start_time()).num_milliseconds();
        let throughput_per_second = if wall_ms > 0 {
            completed_nodes as f64 / (wall_ms as f64 / 1000.0)
        } else {
            0.0
        };

        Self {
            execution_id: execution.id().clone(),
            total_nodes,
            completed_nodes,
            failed_nodes: execution.failed_nodes().len(),
            node_durations,
            average_node_duration_ms,
            throughput_per_second,
            success_rate: if total_nodes > 0 {
                completed_nodes as f64 / total_nodes as f64 * 100.0
            } else {
                0.0
            },
            bottlenecks,
            total_retries: retry_counts.values().sum(),
            retry_counts,
            total_tokens: execution.results().values().map(result_tokens).sum(),
            total_cost: execution.results().values().map(result_cost).sum(),
            running_nodes: execution
                .running_nodes()
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}
