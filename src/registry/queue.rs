//! Admission heap

use crate::types::{Priority, TaskId};
use chrono::{DateTime, Utc};
use std::collections::BinaryHeap;

/// Heap entry for a queued task
#[derive(Debug, Clone, Eq, PartialEq)]
pub(crate) struct QueuedTask {
    pub(crate) id: TaskId,
    pub(crate) priority: Priority,
    pub(crate) created_at: DateTime<Utc>,
}

// BinaryHeap is a max-heap: the most urgent entry must compare greatest
impl Ord for QueuedTask {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Lower priority value first, then older, then lower id
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.created_at.cmp(&self.created_at))
            .then_with(|| other.id.cmp(&self.id))
    }
}

impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Queued tasks ordered by `(priority, created_at, id)`
#[derive(Debug, Default)]
pub(crate) struct TaskQueue {
    heap: BinaryHeap<QueuedTask>,
}

impl TaskQueue {
    pub(crate) fn push(&mut self, entry: QueuedTask) {
        self.heap.push(entry);
    }

    pub(crate) fn pop(&mut self) -> Option<QueuedTask> {
        self.heap.pop()
    }

    pub(crate) fn peek(&self) -> Option<&QueuedTask> {
        self.heap.peek()
    }

    pub(crate) fn len(&self) -> usize {
        self.heap.len()
    }

    /// Remove a task's entry; returns whether it was queued
    pub(crate) fn remove(&mut self, id: TaskId) -> bool {
        let before = self.heap.len();
        self.heap.retain(|entry| entry.id != id);
        self.heap.len() < before
    }

    /// Queued ids, most urgent first
    pub(crate) fn ordered_ids(&self) -> Vec<TaskId> {
        let mut entries: Vec<_> = self.heap.iter().cloned().collect();
        entries.sort_by(|a, b| b.cmp(a));
        entries.into_iter().map(|e| e.id).collect()
    }
}
