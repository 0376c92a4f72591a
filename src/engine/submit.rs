//! Job submission.

use crate::error::{Error, Result};
use crate::registry::Task;
use crate::types::{SubmitRequest, TaskId};

use super::TransferEngine;

impl TransferEngine {
    /// Submit a transfer job
    ///
    /// The task starts `Queued` and is admitted once a slot is free for its
    /// backend. The backend is derived from the source unless the request
    /// names one.
    ///
    /// # Errors
    ///
    /// - [`Error::ShuttingDown`] once [`shutdown`](Self::shutdown) has begun
    /// - [`Error::Config`] when no adapter is configured for the backend
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # use transfer_engine::*;
    /// # async fn example(engine: TransferEngine) -> Result<()> {
    /// let request = SubmitRequest::new(
    ///     Source::DirectUrl {
    ///         url: "https://example.com/file.iso".into(),
    ///         filename: None,
    ///     },
    ///     "alice",
    /// );
    /// let id = engine.submit(request).await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn submit(&self, request: SubmitRequest) -> Result<TaskId> {
        if self.registry.is_shutting_down().await {
            return Err(Error::ShuttingDown);
        }
        let backend = request
            .backend
            .unwrap_or_else(|| request.source.default_backend());
        self.backends.require(backend)?;

        let id = self.registry.allocate_id();
        let task = Task::from_request(
            id,
            request,
            backend,
            self.config.engine.default_max_retries,
        );
        let snapshot = self.registry.insert(task).await;
        self.checkpoint(&snapshot).await;

        tracing::info!(
            task_id = id.0,
            backend = %backend,
            priority = snapshot.priority.0,
            name = %snapshot.name,
            "task submitted"
        );
        self.wake_admission();
        Ok(id)
    }
}
