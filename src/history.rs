//! Bounded log of finished tasks

use crate::types::{HistoryEntry, HistoryFilter, TaskId};
use std::collections::VecDeque;
use tokio::sync::RwLock;

/// Default number of entries kept
pub const DEFAULT_CAPACITY: usize = 200;

/// Fixed-capacity ring of terminal task snapshots; the oldest entry is evicted first
pub struct HistoryLog {
    capacity: usize,
    entries: RwLock<VecDeque<HistoryEntry>>,
}

impl HistoryLog {
    /// Empty log holding at most `capacity` entries (at least one)
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: RwLock::new(VecDeque::with_capacity(capacity)),
        }
    }

    /// Maximum number of entries
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append an entry, evicting the oldest when full
    pub async fn push(&self, entry: HistoryEntry) {
        let mut entries = self.entries.write().await;
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    /// Seed the log with persisted entries given oldest first
    pub async fn load(&self, loaded: impl IntoIterator<Item = HistoryEntry>) {
        for entry in loaded {
            self.push(entry).await;
        }
    }

    /// Matching entries, newest first
    pub async fn list(&self, filter: &HistoryFilter) -> Vec<HistoryEntry> {
        let entries = self.entries.read().await;
        entries
            .iter()
            .rev()
            .filter(|e| filter.matches(e))
            .take(filter.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect()
    }

    /// Entry for a task, if still retained
    pub async fn get(&self, id: TaskId) -> Option<HistoryEntry> {
        self.entries
            .read()
            .await
            .iter()
            .rev()
            .find(|e| e.id == id)
            .cloned()
    }

    /// Number of retained entries
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Whether the log is empty
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

impl Default for HistoryLog {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BackendKind, TaskState};
    use chrono::Utc;

    fn entry(id: i64, owner: &str, state: TaskState) -> HistoryEntry {
        HistoryEntry {
            id: TaskId(id),
            owner: owner.into(),
            name: format!("task-{}", id),
            backend: BackendKind::Http,
            category: None,
            state,
            last_error: None,
            bytes_total: 0,
            retry_count: 0,
            created_at: Utc::now(),
            completed_at: Utc::now(),
            upload_reference: None,
            artifact_path: None,
        }
    }

    #[tokio::test]
    async fn evicts_oldest_past_capacity() {
        let log = HistoryLog::default();
        for id in 1..=250 {
            log.push(entry(id, "alice", TaskState::Completed)).await;
        }
        assert_eq!(log.len().await, 200);
        assert!(log.get(TaskId(50)).await.is_none());
        assert!(log.get(TaskId(51)).await.is_some());

        let all = log.list(&HistoryFilter::default()).await;
        assert_eq!(all.first().unwrap().id, TaskId(250));
        assert_eq!(all.last().unwrap().id, TaskId(51));
    }

    #[tokio::test]
    async fn list_filters_and_limits_newest_first() {
        let log = HistoryLog::new(10);
        log.push(entry(1, "alice", TaskState::Completed)).await;
        log.push(entry(2, "bob", TaskState::Failed)).await;
        log.push(entry(3, "alice", TaskState::Cancelled)).await;
        log.push(entry(4, "alice", TaskState::Completed)).await;

        let alice = log
            .list(&HistoryFilter {
                owner: Some("alice".into()),
                limit: Some(2),
                ..Default::default()
            })
            .await;
        let ids: Vec<_> = alice.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![TaskId(4), TaskId(3)]);

        let failed = log
            .list(&HistoryFilter {
                state: Some(TaskState::Failed),
                ..Default::default()
            })
            .await;
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].owner, "bob");
    }

    #[tokio::test]
    async fn zero_capacity_still_keeps_latest() {
        let log = HistoryLog::new(0);
        assert_eq!(log.capacity(), 1);
        log.push(entry(1, "a", TaskState::Completed)).await;
        log.push(entry(2, "a", TaskState::Completed)).await;
        assert_eq!(log.len().await, 1);
        assert!(log.get(TaskId(2)).await.is_some());
    }
}
