//! Pause, resume, cancel, priority and queue-wide pause.

use crate::backend::{BackendAdapter, BackendHandle};
use crate::error::{Error, Result};
use crate::registry::PausedBy;
use crate::types::{Event, Priority, Progress, TaskId, TaskSnapshot, TaskState};
use crate::utils::remove_path;
use tracing::{debug, info, warn};

use super::TransferEngine;

impl TransferEngine {
    /// Pause a downloading task
    ///
    /// Backends with native pause keep the job and the slot; resuming is
    /// instant and progress is preserved. Otherwise the backend job is
    /// cancelled, progress is discarded and the slot is released; resuming
    /// re-enqueues the task.
    ///
    /// # Errors
    ///
    /// - [`Error::NotFound`] if the task is not live
    /// - [`Error::InvalidState`] unless the task is `Downloading` (pausing a
    ///   paused task is a no-op)
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # use transfer_engine::*;
    /// # async fn example(engine: TransferEngine, id: TaskId) -> Result<()> {
    /// engine.pause(id).await?;
    /// engine.resume(id).await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn pause(&self, id: TaskId) -> Result<TaskSnapshot> {
        self.pause_task(id, PausedBy::User).await
    }

    async fn pause_task(&self, id: TaskId, by: PausedBy) -> Result<TaskSnapshot> {
        let (state, backend, handle) = self
            .registry
            .inspect(id, |t| (t.state, t.backend, t.backend_handle.clone()))
            .await
            .ok_or(Error::NotFound(id))?;
        match state {
            TaskState::Paused => {
                return self.registry.get(id).await.ok_or(Error::NotFound(id));
            }
            TaskState::Downloading => {}
            current_state => {
                return Err(Error::InvalidState {
                    id,
                    operation: "pause".to_string(),
                    current_state,
                });
            }
        }

        let adapter = self.backends.require(backend)?;
        if adapter.capabilities().pause
            && let Some(handle) = handle
        {
            match adapter.pause(&handle).await {
                Ok(()) => return self.finish_native_pause(id, by, adapter.as_ref(), &handle).await,
                Err(Error::Unsupported { .. }) => {}
                Err(e) => return Err(e),
            }
        }

        // Global pause requeues instead, so resume_all does not depend on it
        let degraded_to = match by {
            PausedBy::User => TaskState::Paused,
            PausedBy::Global | PausedBy::Pressure => TaskState::Queued,
        };
        self.degraded_pause(id, by, degraded_to).await
    }

    async fn finish_native_pause(
        &self,
        id: TaskId,
        by: PausedBy,
        adapter: &dyn BackendAdapter,
        handle: &BackendHandle,
    ) -> Result<TaskSnapshot> {
        let result = self
            .registry
            .transition(id, None, "pause", TaskState::Paused, |t| {
                t.paused_by = Some(by);
                if let Some(control) = &t.control {
                    control.set_paused(true);
                }
            })
            .await;
        let transitioned = match result {
            Ok(transitioned) => transitioned,
            Err(e) => {
                // The task moved on while the backend was pausing
                if let Err(resume_err) = adapter.resume(handle).await {
                    warn!(task_id = id.0, error = %resume_err, "failed to undo backend pause");
                }
                return Err(e);
            }
        };

        self.record(&transitioned).await;
        self.rebalance_bandwidth().await;
        info!(task_id = id.0, by = ?by, "task paused");
        Ok(transitioned.snapshot)
    }

    async fn degraded_pause(&self, id: TaskId, by: PausedBy, to: TaskState) -> Result<TaskSnapshot> {
        let transitioned = self
            .registry
            .transition(id, None, "pause", to, |t| {
                t.slot_held = false;
                t.backend_handle = None;
                t.progress = Progress::default();
                t.paused_by = Some(by);
            })
            .await?;
        self.bandwidth.forget(id).await;
        self.record(&transitioned).await;
        self.wake_admission();
        self.rebalance_bandwidth().await;
        info!(task_id = id.0, by = ?by, to = %to, "task paused without backend support, slot released");
        Ok(transitioned.snapshot)
    }

    /// Resume a paused task
    ///
    /// A natively paused task continues where it stopped. A task paused
    /// without backend support goes back to `Queued`. Tasks that are already
    /// queued or running are left alone.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] if the task is not live, or the backend's error if
    /// it refuses to resume the job.
    pub async fn resume(&self, id: TaskId) -> Result<TaskSnapshot> {
        let (state, backend, handle, slot_held) = self
            .registry
            .inspect(id, |t| (t.state, t.backend, t.backend_handle.clone(), t.slot_held))
            .await
            .ok_or(Error::NotFound(id))?;
        if state != TaskState::Paused {
            return self.registry.get(id).await.ok_or(Error::NotFound(id));
        }

        if slot_held && let Some(handle) = handle {
            let adapter = self.backends.require(backend)?;
            // Peers give up their share before the job runs again
            self.rebalance_bandwidth_with(Some(id)).await;
            if let Err(e) = adapter.resume(&handle).await {
                self.rebalance_bandwidth().await;
                return Err(e);
            }
            let transitioned = self
                .registry
                .transition(id, None, "resume", TaskState::Downloading, |t| {
                    if let Some(control) = &t.control {
                        control.set_paused(false);
                    }
                })
                .await?;
            self.record(&transitioned).await;
            self.rebalance_bandwidth().await;
            info!(task_id = id.0, "task resumed");
            return Ok(transitioned.snapshot);
        }

        let transitioned = self
            .registry
            .transition(id, None, "resume", TaskState::Queued, |_| {})
            .await?;
        self.record(&transitioned).await;
        self.wake_admission();
        info!(task_id = id.0, "task re-enqueued");
        Ok(transitioned.snapshot)
    }

    /// Cancel a task
    ///
    /// The task is `Cancelled` and its slot is free when this returns. The
    /// worker then cancels the backend job and removes partial output in the
    /// background.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] if the task is not live (finished tasks cannot be
    /// cancelled).
    pub async fn cancel(&self, id: TaskId) -> Result<()> {
        let transitioned = self
            .registry
            .transition(id, None, "cancel", TaskState::Cancelled, |_| {})
            .await?;

        // A stopped worker cleans up after itself; without one it happens here
        if transitioned.detached.is_none() {
            if let Some(handle) = &transitioned.snapshot.backend_handle
                && let Some(adapter) = self.backends.get(transitioned.snapshot.backend)
                && let Err(e) = adapter.cancel(&BackendHandle::new(handle.clone())).await
            {
                warn!(task_id = id.0, error = %e, "failed to cancel backend job");
            }
            if let Err(e) = remove_path(&self.task_dir(id)).await {
                warn!(task_id = id.0, error = %e, "failed to remove partial output");
            }
        }

        self.bandwidth.forget(id).await;
        self.record(&transitioned).await;
        self.rebalance_bandwidth().await;
        info!(task_id = id.0, from = %transitioned.old_state, "task cancelled");
        Ok(())
    }

    /// Change a task's priority (lower runs first)
    ///
    /// Queued tasks are reordered immediately; active tasks keep the value for
    /// their next admission.
    pub async fn set_priority(&self, id: TaskId, priority: Priority) -> Result<TaskSnapshot> {
        let snapshot = self.registry.set_priority(id, priority).await?;
        self.checkpoint(&snapshot).await;
        self.wake_admission();
        debug!(task_id = id.0, priority = priority.0, "priority changed");
        Ok(snapshot)
    }

    /// Stop admission and pause every downloading task
    ///
    /// Tasks whose backend cannot pause are requeued and wait for
    /// [`resume_all`](Self::resume_all).
    pub async fn pause_all(&self) -> Result<()> {
        if self.registry.set_paused_all(true).await {
            self.emit_event(Event::QueuePaused);
            info!("queue paused");
        }
        self.pause_downloading(PausedBy::Global).await;
        Ok(())
    }

    /// Restart admission and resume every paused task
    pub async fn resume_all(&self) -> Result<()> {
        let changed = self.registry.set_paused_all(false).await;
        for id in self.registry.ids_in(TaskState::Paused).await {
            if let Err(e) = self.resume(id).await {
                warn!(task_id = id.0, error = %e, "failed to resume task");
            }
        }
        if changed {
            self.emit_event(Event::QueueResumed);
            info!("queue resumed");
        }
        self.wake_admission();
        Ok(())
    }

    /// Freeze or release admission on behalf of a resource-pressure monitor
    ///
    /// Releasing resumes only the tasks this freeze paused.
    pub async fn set_pressure_pause(&self, active: bool) -> Result<()> {
        if !self.registry.set_pressure(active).await {
            return Ok(());
        }
        if active {
            warn!("resource pressure, pausing queue");
            self.emit_event(Event::QueuePaused);
            self.pause_downloading(PausedBy::Pressure).await;
            return Ok(());
        }

        for id in self.registry.ids_in(TaskState::Paused).await {
            let by = self.registry.inspect(id, |t| t.paused_by).await.flatten();
            if by == Some(PausedBy::Pressure)
                && let Err(e) = self.resume(id).await
            {
                warn!(task_id = id.0, error = %e, "failed to resume task");
            }
        }
        if !self.registry.is_frozen().await {
            self.emit_event(Event::QueueResumed);
        }
        info!("resource pressure cleared");
        self.wake_admission();
        Ok(())
    }

    async fn pause_downloading(&self, by: PausedBy) {
        for id in self.registry.ids_in(TaskState::Downloading).await {
            if let Err(e) = self.pause_task(id, by).await {
                debug!(task_id = id.0, error = %e, "task not paused");
            }
        }
    }

    /// Change the global speed limit (None = unlimited)
    pub async fn set_speed_limit(&self, limit_bps: Option<u64>) {
        self.bandwidth.set_limit(limit_bps);
        self.emit_event(Event::SpeedLimitChanged { limit_bps });
        self.rebalance_bandwidth().await;
        info!(?limit_bps, "speed limit changed");
    }
}
