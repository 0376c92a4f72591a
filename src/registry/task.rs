//! Live task record and per-run control handles

use crate::backend::BackendHandle;
use crate::error::TaskError;
use crate::types::{
    BackendKind, Destination, HistoryEntry, PostProcessStage, Priority, Progress, Source,
    SubmitRequest, TaskId, TaskSnapshot, TaskState,
};
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Why a worker was told to stop
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum StopReason {
    /// The task was cancelled; discard backend job and partial output
    Cancelled,
    /// Paused on a backend without native pause; discard the backend job
    Paused,
    /// Displaced by a more urgent task; discard the backend job
    Requeued,
    /// Engine shutdown; leave the backend job running for replay
    Shutdown,
}

/// Control handles for one admitted run of a task
///
/// A task gets a fresh run on every admission. Workers carry their run id so
/// writes from a stopped run are rejected.
#[derive(Clone, Debug)]
pub(crate) struct RunControl {
    pub(crate) run: u64,
    pub(crate) token: CancellationToken,
    reason: Arc<OnceLock<StopReason>>,
    paused: Arc<watch::Sender<bool>>,
}

impl RunControl {
    pub(crate) fn new(run: u64) -> Self {
        let (paused, _) = watch::channel(false);
        Self {
            run,
            token: CancellationToken::new(),
            reason: Arc::new(OnceLock::new()),
            paused: Arc::new(paused),
        }
    }

    /// Record `reason` (first one wins) and cancel the run
    pub(crate) fn stop(&self, reason: StopReason) {
        let _ = self.reason.set(reason);
        self.token.cancel();
    }

    pub(crate) fn stop_reason(&self) -> Option<StopReason> {
        self.reason.get().copied()
    }

    /// Halt or release the status poller while the backend job is paused
    pub(crate) fn set_paused(&self, paused: bool) {
        self.paused.send_replace(paused);
    }

    pub(crate) fn paused(&self) -> watch::Receiver<bool> {
        self.paused.subscribe()
    }
}

/// Who paused a task
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) enum PausedBy {
    #[default]
    User,
    /// `pause_all`
    Global,
    /// Resource-pressure monitor
    Pressure,
}

/// A task tracked by the registry
#[derive(Clone, Debug)]
pub(crate) struct Task {
    pub(crate) id: TaskId,
    pub(crate) owner: String,
    pub(crate) name: String,
    pub(crate) source: Source,
    pub(crate) backend: BackendKind,
    pub(crate) state: TaskState,
    pub(crate) priority: Priority,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) started_at: Option<DateTime<Utc>>,
    pub(crate) progress: Progress,
    pub(crate) bandwidth_cap_bps: u64,
    pub(crate) category: Option<String>,
    pub(crate) retry_count: u32,
    pub(crate) max_retries: u32,
    pub(crate) last_error: Option<TaskError>,
    pub(crate) artifact_path: Option<PathBuf>,
    pub(crate) stages: Vec<PostProcessStage>,
    pub(crate) destination: Destination,
    pub(crate) backend_handle: Option<BackendHandle>,
    pub(crate) slot_held: bool,
    pub(crate) revision: u64,
    pub(crate) upload_reference: Option<String>,
    /// Set while a worker owns the task
    pub(crate) control: Option<RunControl>,
    /// Set while the task is paused
    pub(crate) paused_by: Option<PausedBy>,
}

impl Task {
    /// New queued task from a submission
    pub(crate) fn from_request(
        id: TaskId,
        request: SubmitRequest,
        backend: BackendKind,
        default_max_retries: u32,
    ) -> Self {
        let name = request
            .name
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| request.source.display_name());
        Self {
            id,
            owner: request.owner,
            name,
            source: request.source,
            backend,
            state: TaskState::Queued,
            priority: request.priority,
            created_at: Utc::now(),
            started_at: None,
            progress: Progress::default(),
            bandwidth_cap_bps: request.bandwidth_cap_bps,
            category: request.category,
            retry_count: 0,
            max_retries: request.max_retries.unwrap_or(default_max_retries),
            last_error: None,
            artifact_path: None,
            stages: request.stages,
            destination: request.destination,
            backend_handle: None,
            slot_held: false,
            revision: 0,
            upload_reference: None,
            control: None,
            paused_by: None,
        }
    }

    /// Rebuild a task from a checkpoint
    ///
    /// Slot and run state are never restored; admission recreates them.
    pub(crate) fn from_snapshot(snapshot: TaskSnapshot) -> Self {
        Self {
            id: snapshot.id,
            owner: snapshot.owner,
            name: snapshot.name,
            source: snapshot.source,
            backend: snapshot.backend,
            state: snapshot.state,
            priority: snapshot.priority,
            created_at: snapshot.created_at,
            started_at: None,
            progress: snapshot.progress,
            bandwidth_cap_bps: snapshot.bandwidth_cap_bps,
            category: snapshot.category,
            retry_count: snapshot.retry_count,
            max_retries: snapshot.max_retries,
            last_error: None,
            artifact_path: snapshot.artifact_path,
            stages: snapshot.stages,
            destination: snapshot.destination,
            backend_handle: snapshot.backend_handle.map(BackendHandle::new),
            slot_held: false,
            revision: snapshot.revision,
            upload_reference: None,
            control: None,
            paused_by: (snapshot.state == TaskState::Paused).then_some(PausedBy::User),
        }
    }

    /// Whether the current run is `run`
    pub(crate) fn owned_by(&self, run: u64) -> bool {
        self.control.as_ref().is_some_and(|c| c.run == run)
    }

    pub(crate) fn snapshot(&self) -> TaskSnapshot {
        TaskSnapshot {
            id: self.id,
            owner: self.owner.clone(),
            name: self.name.clone(),
            source: self.source.clone(),
            backend: self.backend,
            state: self.state,
            priority: self.priority,
            created_at: self.created_at,
            started_at: self.started_at,
            progress: self.progress,
            bandwidth_cap_bps: self.bandwidth_cap_bps,
            category: self.category.clone(),
            retry_count: self.retry_count,
            max_retries: self.max_retries,
            last_error: self.last_error.clone(),
            artifact_path: self.artifact_path.clone(),
            stages: self.stages.clone(),
            destination: self.destination.clone(),
            backend_handle: self.backend_handle.as_ref().map(|h| h.0.clone()),
            slot_held: self.slot_held,
            revision: self.revision,
        }
    }

    /// History record for a task that just reached a terminal state
    pub(crate) fn history_entry(&self) -> HistoryEntry {
        HistoryEntry {
            id: self.id,
            owner: self.owner.clone(),
            name: self.name.clone(),
            backend: self.backend,
            category: self.category.clone(),
            state: self.state,
            last_error: self.last_error.clone(),
            bytes_total: self.progress.bytes_total.max(self.progress.bytes_done),
            retry_count: self.retry_count,
            created_at: self.created_at,
            completed_at: Utc::now(),
            upload_reference: self.upload_reference.clone(),
            artifact_path: self.artifact_path.clone(),
        }
    }
}
