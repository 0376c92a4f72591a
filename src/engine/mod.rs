//! Task orchestration engine split into focused submodules.
//!
//! The [`TransferEngine`] struct and its methods are organized by domain:
//! - [`submit`] - Job submission
//! - [`admission`] - Admission loop and worker spawning
//! - [`control`] - Pause, resume, cancel, priority and global pause
//! - [`query`] - Read-only views and event subscription
//! - [`lifecycle`] - Startup, checkpoint replay and shutdown
//! - [`task_runner`] - Per-task worker: submit, poll, post-process, upload

mod admission;
mod control;
mod lifecycle;
mod query;
mod submit;
mod task_runner;

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
pub(crate) mod test_helpers;
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;

use crate::backend::BackendSet;
use crate::bandwidth::{BandwidthLimiter, ShareCandidate};
use crate::config::Config;
use crate::db::Database;
use crate::error::Result;
use crate::history::HistoryLog;
use crate::post_processing::PostProcessor;
use crate::registry::{Limits, TaskRegistry, Transitioned};
use crate::types::{Event, TaskId, TaskSnapshot};
use crate::upload::{LocalUploader, UploadDispatcher};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use tokio::sync::{Notify, broadcast};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Capacity of the event channel; slower subscribers observe `Lagged`
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Main engine instance (cloneable - all fields are Arc-wrapped)
#[derive(Clone)]
pub struct TransferEngine {
    /// Configuration (wrapped in Arc for sharing across workers)
    pub(crate) config: Arc<Config>,
    /// Single owner of live task state
    pub(crate) registry: Arc<TaskRegistry>,
    /// Adapters by backend kind
    pub(crate) backends: Arc<BackendSet>,
    /// Global cap and per-task allotments
    pub(crate) bandwidth: BandwidthLimiter,
    /// Recently finished tasks
    pub(crate) history: Arc<HistoryLog>,
    /// Destination store
    pub(crate) uploader: Arc<dyn UploadDispatcher>,
    /// Post-download stages
    pub(crate) post_processor: Arc<PostProcessor>,
    /// Checkpoint store
    pub(crate) db: Arc<Database>,
    /// Event broadcast channel sender (multiple subscribers supported)
    pub(crate) event_tx: broadcast::Sender<Event>,
    /// Wakes the admission loop
    pub(crate) wake: Arc<Notify>,
    /// Spawned per-task workers
    pub(crate) workers: TaskTracker,
    /// Stops the admission loop
    pub(crate) shutdown_token: CancellationToken,
    /// Set once the admission loop was spawned
    pub(crate) started: Arc<AtomicBool>,
}

impl TransferEngine {
    /// Create an engine with adapters and uploader built from `config`
    ///
    /// Opens the checkpoint store and replays unfinished tasks. Nothing is
    /// admitted until [`start`](Self::start) is called.
    pub async fn new(config: Config) -> Result<Self> {
        let bandwidth = BandwidthLimiter::new(config.engine.global_bandwidth_bps);
        let backends = BackendSet::from_config(&config, bandwidth.global())?;
        let uploader: Arc<dyn UploadDispatcher> =
            Arc::new(LocalUploader::from_config(&config.upload));
        Self::assemble(config, bandwidth, backends, uploader).await
    }

    /// Create an engine with caller-supplied adapters and uploader
    pub async fn with_backends(
        config: Config,
        backends: BackendSet,
        uploader: Arc<dyn UploadDispatcher>,
    ) -> Result<Self> {
        let bandwidth = BandwidthLimiter::new(config.engine.global_bandwidth_bps);
        Self::assemble(config, bandwidth, backends, uploader).await
    }

    async fn assemble(
        config: Config,
        bandwidth: BandwidthLimiter,
        backends: BackendSet,
        uploader: Arc<dyn UploadDispatcher>,
    ) -> Result<Self> {
        config.validate()?;
        tokio::fs::create_dir_all(&config.engine.work_dir)
            .await
            .map_err(|e| {
                crate::Error::Io(std::io::Error::new(
                    e.kind(),
                    format!(
                        "Failed to create work directory '{}': {}",
                        config.engine.work_dir.display(),
                        e
                    ),
                ))
            })?;

        let db = Database::new(&config.persistence.database_path).await?;
        let (event_tx, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let post_processor = PostProcessor::new(event_tx.clone(), &config.processing);

        let engine = Self {
            registry: Arc::new(TaskRegistry::new(event_tx.clone())),
            history: Arc::new(HistoryLog::new(config.engine.history_capacity)),
            config: Arc::new(config),
            backends: Arc::new(backends),
            bandwidth,
            uploader,
            post_processor: Arc::new(post_processor),
            db: Arc::new(db),
            event_tx,
            wake: Arc::new(Notify::new()),
            workers: TaskTracker::new(),
            shutdown_token: CancellationToken::new(),
            started: Arc::new(AtomicBool::new(false)),
        };

        tracing::info!(
            backends = ?engine.backends.kinds(),
            max_concurrent = engine.config.engine.max_concurrent,
            "transfer engine initialized"
        );

        engine.restore().await?;
        Ok(engine)
    }

    /// Replace the post-processing pipeline
    pub fn with_post_processor(mut self, post_processor: PostProcessor) -> Self {
        self.post_processor = Arc::new(post_processor);
        self
    }

    /// Get the current configuration
    pub fn get_config(&self) -> Arc<Config> {
        Arc::clone(&self.config)
    }

    pub(crate) fn emit_event(&self, event: Event) {
        // Err only means nobody is listening
        self.event_tx.send(event).ok();
    }

    pub(crate) fn wake_admission(&self) {
        self.wake.notify_one();
    }

    pub(crate) fn limits(&self) -> Limits {
        Limits {
            global: self.config.engine.max_concurrent,
            per_backend: self.config.engine.per_backend_limits.clone(),
            preemption: self.config.engine.preemption,
        }
    }

    /// Directory reserved for a task's in-process downloads
    pub(crate) fn task_dir(&self, id: TaskId) -> PathBuf {
        self.config.engine.work_dir.join(format!("task_{}", id))
    }

    /// Write a live task's checkpoint
    pub(crate) async fn checkpoint(&self, snapshot: &TaskSnapshot) {
        if let Err(e) = self.db.checkpoint_task(snapshot).await {
            tracing::warn!(task_id = snapshot.id.0, error = %e, "failed to write task checkpoint");
        }
    }

    /// Persist the outcome of a transition
    ///
    /// Terminal tasks go to the history log and the history table and lose
    /// their checkpoint; everything else is checkpointed.
    pub(crate) async fn record(&self, transitioned: &Transitioned) {
        let Some(entry) = &transitioned.finished else {
            self.checkpoint(&transitioned.snapshot).await;
            return;
        };
        self.history.push(entry.clone()).await;
        if let Err(e) = self.db.insert_history(entry).await {
            tracing::warn!(task_id = entry.id.0, error = %e, "failed to write history entry");
        }
        if let Err(e) = self.db.delete_task(entry.id).await {
            tracing::warn!(task_id = entry.id.0, error = %e, "failed to drop task checkpoint");
        }
        self.wake_admission();
    }

    /// Recompute bandwidth allotments for the current downloading set
    pub(crate) async fn rebalance_bandwidth(&self) {
        self.rebalance_bandwidth_with(None).await;
    }

    /// Recompute allotments counting the paused task `resuming` as downloading
    pub(crate) async fn rebalance_bandwidth_with(&self, resuming: Option<TaskId>) {
        let jobs = self.registry.downloading_jobs(resuming).await;
        let candidates: Vec<ShareCandidate> = jobs
            .into_iter()
            .filter_map(|(id, kind, task_cap, handle)| {
                let adapter = self.backends.get(kind)?;
                adapter.capabilities().bandwidth_cap.then_some(ShareCandidate {
                    id,
                    task_cap,
                    adapter,
                    handle,
                })
            })
            .collect();
        for (id, bps) in self.bandwidth.rebalance(candidates).await {
            self.emit_event(Event::BandwidthAllotted { id, bps });
        }
    }
}
