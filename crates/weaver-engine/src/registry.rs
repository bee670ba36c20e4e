use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use serde::Serialize;
use serde_json::Value;

use weaver_core::types::{ExecutionId, ExecutionStatus};

use crate::execution::Execution;
use crate::notify::{DeliveryQueue, SubscriberList};

/// State guarded by one execution's lock.
pub(crate) struct SlotState {
    pub(crate) execution: Execution,
    pub(crate) subscribers: SubscriberList,
}

/// One execution plus its subscribers, behind a per-execution mutex.
pub struct ExecutionSlot {
    state: Mutex<SlotState>,
    deliveries: DeliveryQueue,
}

impl ExecutionSlot {
    fn new(execution: Execution) -> Self {
        Self {
            state: Mutex::new(SlotState {
                execution,
                subscribers: SubscriberList::default(),
            }),
            deliveries: DeliveryQueue::default(),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, SlotState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue the current snapshot for every current subscriber.
    /// Must be called with `state` locked so queue order is mutation order.
    pub(crate) fn enqueue(&self, state: &SlotState) {
        if state.subscribers.is_empty() {
            return;
        }
        self.deliveries
            .push(state.execution.clone(), state.subscribers.callbacks());
    }

    /// Hand queued snapshots to subscribers. Call without holding the lock.
    pub(crate) fn deliver(&self) {
        self.deliveries
            .drain(|id| self.lock().subscribers.contains(id));
    }
}

/// Aggregate over finished executions.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ExecutionStats {
    /// Executions that ended `completed` or `failed`.
    pub total_executions: usize,
    /// Percentage of those that ended `completed`.
    pub success_rate: f64,
    pub average_duration_ms: f64,
    /// Sum of `tokenCount` (or `token_count`) over node results.
    pub total_tokens: u64,
    /// Sum of `cost` over node results.
    pub total_cost: f64,
}

struct Finished {
    status: ExecutionStatus,
    duration_ms: u64,
    tokens: u64,
    cost: f64,
}

/// Token count reported in a node result, if any.
pub(crate) fn result_tokens(result: &Value) -> u64 {
    result
        .get("tokenCount")
        .or_else(|| result.get("token_count"))
        .and_then(Value::as_u64)
        .unwrap_or(0)
}

/// Cost reported in a node result, if any.
pub(crate) fn result_cost(result: &Value) -> f64 {
    result.get("cost").and_then(Value::as_f64).unwrap_or(0.0)
}

/// Keyed store of in-flight and finished executions.
///
/// The outer map lock is held only to look up or swap slots, so work on
/// distinct executions never contends beyond that.
pub struct ExecutionRegistry {
    slots: RwLock<HashMap<ExecutionId, Arc<ExecutionSlot>>>,
}

impl ExecutionRegistry {
    pub fn new() -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
        }
    }

    pub(crate) fn insert(&self, execution: Execution) -> Arc<ExecutionSlot> {
        let id = execution.id().clone();
        let slot = Arc::new(ExecutionSlot::new(execution));
        self.slots
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, slot.clone());
        slot
    }

    pub(crate) fn slot(&self, id: &ExecutionId) -> Option<Arc<ExecutionSlot>> {
        self.slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    /// Snapshot of an execution.
    pub fn get(&self, id: &ExecutionId) -> Option<Execution> {
        self.slot(id).map(|slot| {
            let state = slot.lock();
            state.execution.clone()
        })
    }

    /// Drop an execution and all of its subscribers.
    pub fn remove(&self, id: &ExecutionId) -> bool {
        self.slots
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)
            .is_some()
    }

    pub fn contains(&self, id: &ExecutionId) -> bool {
        self.slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.slots.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn all_slots(&self) -> Vec<Arc<ExecutionSlot>> {
        self.slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Execution ids, optionally restricted to one workflow, sorted.
    pub fn ids(&self, workflow_id: Option<&str>) -> Vec<ExecutionId> {
        let mut ids: Vec<ExecutionId> = self
            .all_slots()
            .iter()
            .filter_map(|slot| {
                let state = slot.lock();
                if workflow_id.map_or(true, |w| state.execution.workflow_id() == w) {
                    Some(state.execution.id().clone())
                } else {
                    None
                }
            })
            .collect();
        ids.sort();
        ids
    }

    /// Success rate, mean duration and token/cost totals over
    /// `completed`/`failed` executions.
    pub fn statistics(&self, workflow_id: Option<&str>) -> ExecutionStats {
        let finished: Vec<Finished> = self
            .all_slots()
            .iter()
            .filter_map(|slot| {
                let state = slot.lock();
                let e = &state.execution;
                if workflow_id.is_some_and(|w| e.workflow_id() != w) {
                    return None;
                }
                match e.status() {
                    ExecutionStatus::Completed | ExecutionStatus::Failed => Some(Finished {
                        status: e.status(),
                        duration_ms: e.duration_ms().unwrap_or(0),
                        tokens: e.results().values().map(result_tokens).sum(),
                        cost: e.results().values().map(result_cost).sum(),
                    }),
                    _ => None,
                }
            })
            .collect();

        if finished.is_empty() {
            return ExecutionStats::default();
        }

        let total = finished.len();
        let succeeded = finished
            .iter()
            .filter(|f| f.status == ExecutionStatus::Completed)
            .count();
        let total_ms: u64 = finished.iter().map(|f| f.duration_ms).sum();

        ExecutionStats {
            total_executions: total,
            success_rate: succeeded as f64 / total as f64 * 100.0,
            average_duration_ms: total_ms as f64 / total as f64,
            total_tokens: finished.iter().map(|f| f.tokens).sum(),
            total_cost: finished.iter().map(|f| f.cost).sum(),
        }
    }
}

impl Default for ExecutionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
