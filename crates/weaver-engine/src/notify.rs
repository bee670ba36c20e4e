//! Per-execution notification bus.
//!
//! Each execution keeps an ordered list of subscriber callbacks. After every
//! accepted mutation the engine queues the new snapshot together with the
//! callbacks registered at that moment, releases the execution's lock, and
//! then drains the queue. Snapshots are queued under the lock, so delivery is
//! FIFO per execution and happens-after the change it reports.
//!
//! Callbacks run outside the execution's lock and may call back into the
//! engine for the same execution. A snapshot queued by such a nested call is
//! delivered by the drain already in progress once the current callback
//! returns.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tracing::debug;

use weaver_core::types::ExecutionId;

use crate::execution::Execution;
use crate::registry::ExecutionSlot;

pub type Callback = Arc<dyn Fn(&Execution) + Send + Sync>;

/// Identifies one registered callback instance.
pub type SubscriberId = u64;

#[derive(Default)]
pub(crate) struct SubscriberList {
    next_id: SubscriberId,
    entries: Vec<(SubscriberId, Callback)>,
}

impl SubscriberList {
    pub(crate) fn add(&mut self, callback: Callback) -> SubscriberId {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.push((id, callback));
        id
    }

    /// Remove exactly the callback registered under `id`.
    pub(crate) fn remove(&mut self, id: SubscriberId) -> bool {
        match self.entries.iter().position(|(sid, _)| *sid == id) {
            Some(pos) => {
                self.entries.remove(pos);
                true
            }
            None => false,
        }
    }

    pub(crate) fn contains(&self, id: SubscriberId) -> bool {
        self.entries.iter().any(|(sid, _)| *sid == id)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Current callbacks in subscription order.
    pub(crate) fn callbacks(&self) -> Vec<(SubscriberId, Callback)> {
        self.entries.clone()
    }
}

struct Pending {
    snapshot: Execution,
    callbacks: Vec<(SubscriberId, Callback)>,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<Pending>,
    draining: bool,
}

/// FIFO of snapshots waiting to be handed to subscribers.
///
/// At most one caller drains at a time; everyone else only enqueues.
#[derive(Default)]
pub(crate) struct DeliveryQueue {
    inner: Mutex<QueueState>,
}

impl DeliveryQueue {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn push(&self, snapshot: Execution, callbacks: Vec<(SubscriberId, Callback)>) {
        self.lock().pending.push_back(Pending { snapshot, callbacks });
    }

    /// Deliver queued snapshots unless another caller is already draining.
    ///
    /// `still_subscribed` is checked right before each call so a callback
    /// removed after its snapshot was queued is not invoked.
    pub(crate) fn drain(&self, still_subscribed: impl Fn(SubscriberId) -> bool) {
        {
            let mut queue = self.lock();
            if queue.draining {
                return;
            }
            queue.draining = true;
        }
        let _reset = DrainGuard(self);

        loop {
            let next = {
                let mut queue = self.lock();
                match queue.pending.pop_front() {
                    Some(next) => next,
                    None => {
                        queue.draining = false;
                        return;
                    }
                }
            };
            for (id, callback) in &next.callbacks {
                if still_subscribed(*id) {
                    callback(&next.snapshot);
                }
            }
        }
    }
}

/// Clears the draining flag if a callback panics mid-drain. A normal exit
/// clears it together with the empty-queue check instead.
struct DrainGuard<'a>(&'a DeliveryQueue);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.0.lock().draining = false;
        }
    }
}

/// Handle returned by [`Engine::subscribe`](crate::Engine::subscribe).
///
/// Dropping the handle keeps the callback registered; call
/// [`unsubscribe`](Self::unsubscribe) to remove it.
#[must_use = "dropping a Subscription does not unsubscribe"]
pub struct Subscription {
    execution_id: ExecutionId,
    id: SubscriberId,
    slot: Weak<ExecutionSlot>,
}

impl Subscription {
    pub(crate) fn new(execution_id: ExecutionId, id: SubscriberId, slot: &Arc<ExecutionSlot>) -> Self {
        Self {
            execution_id,
            id,
            slot: Arc::downgrade(slot),
        }
    }

    pub fn execution_id(&self) -> &ExecutionId {
        &self.execution_id
    }

    /// Remove this callback. Returns false if the execution was already
    /// cleaned up.
    pub fn unsubscribe(self) -> bool {
        let Some(slot) = self.slot.upgrade() else {
            return false;
        };
        let removed = slot.lock().subscribers.remove(self.id);
        debug!(execution_id = %self.execution_id, subscriber = self.id, removed, "Unsubscribed");
        removed
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("execution_id", &self.execution_id)
            .field("id", &self.id)
            .finish()
    }
}
