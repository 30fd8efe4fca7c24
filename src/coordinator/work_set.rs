//! Per-run work set: the ID state machine plus a backoff-aware queue.

use crate::types::{IdState, ReplayId};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use tokio::time::Instant;

/// An ID waiting to be dispatched
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub(crate) struct WorkItem {
    pub(crate) id: ReplayId,
    /// Fetch attempts already made for this ID in this run
    pub(crate) attempts: u32,
    /// Earliest dispatch time (backoff deadline)
    pub(crate) not_before: Instant,
}

// BinaryHeap is a max-heap; reverse so the earliest deadline, then the lowest ID,
// is on top
impl Ord for WorkItem {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .not_before
            .cmp(&self.not_before)
            .then_with(|| other.id.cmp(&self.id))
    }
}

impl PartialOrd for WorkItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Every ID touched by the current run and the queue of those still pending
#[derive(Debug, Default)]
pub(crate) struct WorkSet {
    queue: BinaryHeap<WorkItem>,
    states: HashMap<ReplayId, IdState>,
}

impl WorkSet {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Queue `id` for its first attempt unless this run already touched it
    pub(crate) fn enqueue_new(&mut self, id: ReplayId, now: Instant) -> bool {
        if self.states.contains_key(&id) {
            return false;
        }

        self.states.insert(id, IdState::Pending);
        self.queue.push(WorkItem {
            id,
            attempts: 0,
            not_before: now,
        });
        true
    }

    /// Pop the next item whose backoff deadline has passed, marking it in flight
    pub(crate) fn pop_ready(&mut self, now: Instant) -> Option<WorkItem> {
        if self.queue.peek()?.not_before > now {
            return None;
        }

        let item = self.queue.pop()?;
        self.transition(item.id, IdState::InFlight);
        Some(item)
    }

    /// Deadline of the earliest queued item
    pub(crate) fn next_ready_at(&self) -> Option<Instant> {
        self.queue.peek().map(|item| item.not_before)
    }

    /// Put a transiently failed ID back in the queue after `not_before`
    pub(crate) fn requeue(&mut self, id: ReplayId, attempts: u32, not_before: Instant) {
        if self.transition(id, IdState::Pending) {
            self.queue.push(WorkItem {
                id,
                attempts,
                not_before,
            });
        }
    }

    /// Apply a state transition, rejecting (and logging) illegal ones
    pub(crate) fn transition(&mut self, id: ReplayId, next: IdState) -> bool {
        let Some(current) = self.states.get_mut(&id) else {
            tracing::error!(replay_id = id.0, next = ?next, "Transition for untracked ID");
            return false;
        };

        match current.advance(next) {
            Some(state) => {
                *current = state;
                true
            }
            None => {
                tracing::error!(
                    replay_id = id.0,
                    from = ?*current,
                    to = ?next,
                    "Illegal ID state transition"
                );
                false
            }
        }
    }

    pub(crate) fn state(&self, id: ReplayId) -> Option<IdState> {
        self.states.get(&id).copied()
    }

    /// Number of IDs still waiting in the queue
    pub(crate) fn pending(&self) -> usize {
        self.queue.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}
