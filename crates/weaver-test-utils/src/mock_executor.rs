use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::json;

use weaver_core::error::{Result, WeaverError};
use weaver_core::traits::NodeExecutor;
use weaver_core::types::NodeContext;

#[derive(Clone)]
enum Outcome {
    Succeed(serde_json::Value),
    Fail(String),
    /// Fail this many calls, then echo.
    FailTimes(u32),
    Panic,
    Hang,
}

#[derive(Default)]
struct State {
    script: Mutex<HashMap<String, Outcome>>,
    calls: Mutex<Vec<String>>,
    running: AtomicUsize,
    peak: AtomicUsize,
}

/// A scripted node executor for tests.
///
/// Unscripted nodes succeed with `{"node": id, "inputs": {...}}`. Clones share
/// state, so a test can keep one handle and register another.
#[derive(Clone, Default)]
pub struct MockExecutor {
    state: Arc<State>,
    delay: Option<Duration>,
}

impl MockExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep this long inside every call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn succeed(self, node: &str, value: serde_json::Value) -> Self {
        self.script(node, Outcome::Succeed(value))
    }

    pub fn fail(self, node: &str, message: &str) -> Self {
        self.script(node, Outcome::Fail(message.to_string()))
    }

    /// Fail the first `times` calls for `node`, then succeed.
    pub fn fail_times(self, node: &str, times: u32) -> Self {
        self.script(node, Outcome::FailTimes(times))
    }

    pub fn panic_on(self, node: &str) -> Self {
        self.script(node, Outcome::Panic)
    }

    /// Never return for `node`.
    pub fn hang(self, node: &str) -> Self {
        self.script(node, Outcome::Hang)
    }

    fn script(self, node: &str, outcome: Outcome) -> Self {
        self.state
            .script
            .lock()
            .unwrap()
            .insert(node.to_string(), outcome);
        self
    }

    /// Node ids in call order, one entry per attempt.
    pub fn calls(&self) -> Vec<String> {
        self.state.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self, node: &str) -> usize {
        self.state
            .calls
            .lock()
            .unwrap()
            .iter()
            .filter(|n| *n == node)
            .count()
    }

    /// Highest number of calls that were in flight at once.
    pub fn peak_concurrency(&self) -> usize {
        self.state.peak.load(Ordering::SeqCst)
    }

    fn next_outcome(&self, node: &str) -> Option<Outcome> {
        let mut script = self.state.script.lock().unwrap();
        match script.get_mut(node) {
            Some(Outcome::FailTimes(0)) => {
                script.remove(node);
                None
            }
            Some(Outcome::FailTimes(n)) => {
                *n -= 1;
                Some(Outcome::Fail(format!("transient failure in {node}")))
            }
            other => other.cloned(),
        }
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl NodeExecutor for MockExecutor {
    fn execute(&self, ctx: NodeContext) -> BoxFuture<'_, Result<serde_json::Value>> {
        Box::pin(async move {
            self.state.calls.lock().unwrap().push(ctx.node_id.clone());
            let now = self.state.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.state.peak.fetch_max(now, Ordering::SeqCst);
            let _guard = InFlight(&self.state.running);

            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }

            match self.next_outcome(&ctx.node_id) {
                Some(Outcome::Succeed(value)) => Ok(value),
                Some(Outcome::Fail(message)) => Err(WeaverError::NodeExecution {
                    node: ctx.node_id.clone(),
                    message,
                }),
                Some(Outcome::Panic) => panic!("mock executor panic in {}", ctx.node_id),
                Some(Outcome::Hang) => futures::future::pending().await,
                Some(Outcome::FailTimes(_)) | None => Ok(json!({
                    "node": ctx.node_id,
                    "inputs": ctx.inputs,
                })),
            }
        })
    }
}
