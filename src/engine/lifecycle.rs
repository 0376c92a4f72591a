//! Startup, checkpoint replay and shutdown coordination.

use crate::error::Result;
use crate::registry::{StopReason, Task};
use crate::types::{Event, TaskState};
use std::sync::atomic::Ordering;

use super::TransferEngine;

impl TransferEngine {
    /// Start admitting queued tasks
    ///
    /// Spawns the admission loop. Calling it again has no effect.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            tracing::debug!("admission loop already running");
            return;
        }
        self.start_admission_loop();
        tracing::info!("transfer engine started");
    }

    /// Replay history and unfinished tasks from the checkpoint store
    ///
    /// Paused tasks stay paused. Everything else is re-enqueued with its
    /// original priority and submission time, keeping its backend handle so
    /// the next run re-attaches to a job that is still running.
    pub(crate) async fn restore(&self) -> Result<()> {
        self.registry.seed_ids(self.db.max_task_id().await?);

        let capacity = self.history.capacity();
        self.history
            .load(self.db.recent_history(capacity).await?)
            .await;
        let pruned = self.db.prune_history(capacity).await?;
        if pruned > 0 {
            tracing::debug!(pruned, "pruned old history entries");
        }

        let snapshots = self.db.load_tasks().await?;
        let max_revision = snapshots.iter().map(|s| s.revision).max().unwrap_or(0);
        self.registry.seed_revision(max_revision).await;

        let mut requeued = 0usize;
        let mut paused = 0usize;
        for snapshot in snapshots {
            let mut task = Task::from_snapshot(snapshot);
            if task.state == TaskState::Paused {
                paused += 1;
            } else {
                task.state = TaskState::Queued;
                task.paused_by = None;
                requeued += 1;
            }
            let snapshot = self.registry.insert(task).await;
            self.checkpoint(&snapshot).await;
        }

        if requeued + paused > 0 {
            tracing::info!(requeued, paused, "restored unfinished tasks");
        }
        Ok(())
    }

    /// Gracefully shut down the engine
    ///
    /// 1. Stops admission and refuses new submissions
    /// 2. Stops every worker without a terminal transition; backend jobs keep
    ///    running and are re-attached on the next start
    /// 3. Waits for workers up to the configured shutdown timeout
    /// 4. Writes final checkpoints and closes the database
    ///
    /// # Errors
    ///
    /// Currently infallible; the signature leaves room for persistence
    /// failures during the final checkpoint.
    pub async fn shutdown(&self) -> Result<()> {
        tracing::info!("initiating graceful shutdown");

        let stopped = self.registry.stop_all(StopReason::Shutdown).await;
        self.shutdown_token.cancel();
        self.workers.close();
        tracing::info!(workers = stopped.len(), "signaled workers to stop");

        match tokio::time::timeout(self.config.engine.shutdown_timeout, self.workers.wait()).await {
            Ok(()) => tracing::info!("all workers stopped"),
            Err(_) => tracing::warn!("timeout waiting for workers, proceeding with shutdown"),
        }

        for snapshot in self.registry.list().await {
            self.checkpoint(&snapshot).await;
        }

        self.emit_event(Event::Shutdown);
        self.db.close().await;
        tracing::info!("graceful shutdown complete");
        Ok(())
    }
}
