use std::cmp::Reverse;
use std::collections::BinaryHeap;

use super::task::TaskPriority;

/// Max-priority queue of task ids.
///
/// Entries are keyed by `(priority, Reverse(seq))`: higher priority pops
/// first, and within one priority the lower submission sequence pops first.
/// The sequence is unique per push, so the id never takes part in ordering.
#[derive(Debug, Default)]
pub(crate) struct TaskQueue {
    heap: BinaryHeap<(TaskPriority, Reverse<u64>, String)>,
    next_seq: u64,
}

impl TaskQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Push `task_id` behind every entry already queued at `priority`.
    pub(crate) fn push(&mut self, priority: TaskPriority, task_id: String) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push((priority, Reverse(seq), task_id));
    }

    pub(crate) fn pop(&mut self) -> Option<String> {
        self.heap.pop().map(|(_, _, task_id)| task_id)
    }

    pub(crate) fn remove(&mut self, task_id: &str) {
        self.heap.retain(|(_, _, id)| id != task_id);
    }

    pub(crate) fn len(&self) -> usize {
        self.heap.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}
