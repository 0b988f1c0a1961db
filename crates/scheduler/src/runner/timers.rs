use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::time::Instant;

use crate::task::TaskEnvelope;

struct Timer {
    due: Instant,
    seq: u64,
    envelope: TaskEnvelope,
}

impl PartialEq for Timer {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for Timer {}

impl PartialOrd for Timer {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Timer {
    fn cmp(&self, other: &Self) -> Ordering {
        self.due.cmp(&other.due).then(self.seq.cmp(&other.seq))
    }
}

/// Min-heap of envelopes keyed by due time. Ties release in push order.
#[derive(Default)]
pub(super) struct TimerQueue {
    heap: BinaryHeap<Reverse<Timer>>,
    seq: u64,
}

impl TimerQueue {
    pub(super) fn push(&mut self, due: Instant, envelope: TaskEnvelope) {
        self.seq += 1;
        self.heap.push(Reverse(Timer { due, seq: self.seq, envelope }));
    }

    /// Remove and return every envelope due at or before `now`, earliest first.
    pub(super) fn pop_due(&mut self, now: Instant) -> Vec<TaskEnvelope> {
        let mut due = Vec::new();
        while self.heap.peek().is_some_and(|Reverse(t)| t.due <= now) {
            if let Some(Reverse(timer)) = self.heap.pop() {
                due.push(timer.envelope);
            }
        }
        due
    }

    pub(super) fn len(&self) -> usize {
        self.heap.len()
    }

    pub(super) fn drain_all(&mut self) -> Vec<TaskEnvelope> {
        self.heap.drain().map(|Reverse(t)| t.envelope).collect()
    }
}
