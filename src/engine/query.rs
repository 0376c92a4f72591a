//! Read-only views of live tasks and history, and event subscription.

use crate::error::{Error, Result};
use crate::types::{Event, HistoryEntry, HistoryFilter, QueueStats, TaskId, TaskSnapshot};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use super::TransferEngine;

impl TransferEngine {
    /// Snapshot of a live task
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] if the task is unknown or already finished; see
    /// [`get_history`](Self::get_history) for finished tasks.
    pub async fn get_task(&self, id: TaskId) -> Result<TaskSnapshot> {
        self.registry.get(id).await.ok_or(Error::NotFound(id))
    }

    /// All live tasks, most urgent first
    pub async fn list_active(&self) -> Vec<TaskSnapshot> {
        self.registry.list().await
    }

    /// Finished tasks matching `filter`, newest first
    pub async fn list_history(&self, filter: &HistoryFilter) -> Vec<HistoryEntry> {
        self.history.list(filter).await
    }

    /// History entry of a finished task still within the log's capacity
    pub async fn get_history(&self, id: TaskId) -> Option<HistoryEntry> {
        self.history.get(id).await
    }

    /// Queue counters
    pub async fn queue_stats(&self) -> QueueStats {
        let mut stats = self.registry.stats(self.config.engine.max_concurrent).await;
        stats.speed_limit_bps = self.bandwidth.limit();
        stats
    }

    /// Subscribe to task events
    ///
    /// Multiple subscribers are supported. A subscriber that falls more than
    /// the channel capacity behind receives `RecvError::Lagged` and skips ahead.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # use transfer_engine::*;
    /// # async fn example(engine: TransferEngine) {
    /// let mut events = engine.subscribe();
    /// while let Ok(event) = events.recv().await {
    ///     if let Event::StateChanged { id, new_state, .. } = event {
    ///         println!("task {id} is now {new_state}");
    ///     }
    /// }
    /// # }
    /// ```
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.event_tx.subscribe()
    }

    /// Subscribe to task events as a [`futures::Stream`]
    pub fn subscribe_stream(&self) -> BroadcastStream<Event> {
        BroadcastStream::new(self.event_tx.subscribe())
    }
}
