//! # Summary
//!
//! The engine's timer queue. Every timeout in the protocol is an entry
//! here; the dispatcher sleeps until the earliest deadline and then asks
//! the engine to fire whatever came due. Entries are cancelled by id;
//! consumers additionally guard against stale fires with generation
//! counters, since a fire may already be queued when its purpose lapses.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::collections::HashMap;
use std::time::Duration;
use std::time::Instant;

/// Handle to one scheduled timeout.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

/// What a due timer means to the engine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TimerEvent {
    /// A retransmission slot is due for another send.
    Retransmit { slot: u64 },

    /// The local replica leads and owes the group an `Alive`.
    SendAlive,

    /// The leader has been silent for too long.
    SuspectLeader { generation: u64 },

    /// An outstanding catch-up query went unanswered.
    CatchUpResend { generation: u64 },

    /// Unconditional periodic catch-up check.
    CatchUpPeriodic,
}

/// Logical timer queue, ordered by deadline then by insertion.
#[derive(Debug, Default)]
pub struct TimerQueue {
    heap: BinaryHeap<Reverse<(Instant, u64)>>,
    pending: HashMap<u64, TimerEvent>,
    next_id: u64,
}

impl TimerQueue {
    pub fn new() -> Self {
        TimerQueue::default()
    }

    pub fn schedule(&mut self, now: Instant, delay: Duration, event: TimerEvent) -> TimerId {
        let id = self.next_id;
        self.next_id += 1;
        self.heap.push(Reverse((now + delay, id)));
        self.pending.insert(id, event);
        TimerId(id)
    }

    pub fn cancel(&mut self, id: TimerId) {
        self.pending.remove(&id.0);
    }

    /// Earliest live deadline, dropping cancelled entries on the way.
    pub fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(Reverse((deadline, id))) = self.heap.peek().copied() {
            if self.pending.contains_key(&id) {
                return Some(deadline);
            }
            self.heap.pop();
        }
        None
    }

    /// Removes and returns the next timer due at or before `now`.
    pub fn pop_due(&mut self, now: Instant) -> Option<TimerEvent> {
        while let Some(Reverse((deadline, id))) = self.heap.peek().copied() {
            if deadline > now {
                return None;
            }
            self.heap.pop();
            if let Some(event) = self.pending.remove(&id) {
                return Some(event);
            }
        }
        None
    }
}
