//! Shared state for one admitted run and its retry budget.

use crate::backend::{BackendAdapter, BackendHandle, TaskSpec};
use crate::error::Error;
use crate::registry::RunControl;
use crate::retry::RetryBudget;
use crate::types::{Event, TaskId, TaskSnapshot};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use super::super::TransferEngine;

/// Shared context for a single task run, reducing parameter passing between helpers.
pub(crate) struct TaskContext {
    pub(crate) engine: TransferEngine,
    pub(crate) id: TaskId,
    /// Task as it was at admission
    pub(crate) snapshot: TaskSnapshot,
    pub(crate) control: RunControl,
    pub(crate) adapter: Arc<dyn BackendAdapter>,
}

impl TaskContext {
    pub(super) fn run(&self) -> u64 {
        self.control.run
    }

    pub(super) fn spec(&self) -> TaskSpec {
        TaskSpec {
            id: self.id,
            name: self.snapshot.name.clone(),
            source: self.snapshot.source.clone(),
            category: self.snapshot.category.clone(),
            download_dir: self.engine.task_dir(self.id),
        }
    }

    pub(super) fn budget(&self) -> TaskBudget {
        TaskBudget {
            engine: self.engine.clone(),
            id: self.id,
            run: self.control.run,
            max_retries: AtomicU32::new(self.snapshot.max_retries),
        }
    }

    /// Poll delay, stretched for backends that cannot be throttled while a global cap is set
    pub(super) fn poll_interval(&self) -> Duration {
        let config = &self.engine.config.engine;
        if self.engine.bandwidth.limit().is_some() && !self.adapter.capabilities().bandwidth_cap {
            config.poll_interval * config.congestion_factor.max(1)
        } else {
            config.poll_interval
        }
    }

    /// Best-effort removal of a backend job
    pub(super) async fn cancel_job(&self, handle: &BackendHandle) {
        if let Err(e) = self.adapter.cancel(handle).await {
            tracing::warn!(
                task_id = self.id.0,
                backend = self.adapter.name(),
                %handle,
                error = %e,
                "failed to cancel backend job"
            );
        }
    }
}

/// What a run has created so far
#[derive(Debug, Default)]
pub(super) struct Session {
    /// Backend job owned by this run
    pub(super) handle: Option<BackendHandle>,
    /// Set once the backend reported the artifact
    pub(super) downloaded: bool,
    /// Outputs written by post-processing
    pub(super) produced: Vec<PathBuf>,
}

/// The task's retry budget, stored in the registry
///
/// Every retried operation of a run (submit, poll, upload) draws from it.
pub(super) struct TaskBudget {
    engine: TransferEngine,
    id: TaskId,
    run: u64,
    max_retries: AtomicU32,
}

#[async_trait]
impl RetryBudget for TaskBudget {
    async fn try_consume(&self, _error: &Error) -> Option<u32> {
        let (attempt, max) = self.engine.registry.consume_retry(self.id, self.run).await?;
        self.max_retries.store(max, Ordering::SeqCst);
        Some(attempt)
    }

    async fn retry_scheduled(&self, attempt: u32, delay: Duration, error: &Error) {
        let max_retries = self.max_retries.load(Ordering::SeqCst);
        tracing::warn!(
            task_id = self.id.0,
            attempt,
            max_retries,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "transient failure, retry scheduled"
        );
        self.engine.emit_event(Event::RetryScheduled {
            id: self.id,
            attempt,
            max_retries,
            delay_ms: delay.as_millis() as u64,
            reason: error.to_string(),
        });
        if let Some(snapshot) = self.engine.registry.get(self.id).await {
            self.engine.checkpoint(&snapshot).await;
        }
    }
}
