//! Scriptable in-memory backend for engine tests

#![allow(clippy::unwrap_used, clippy::expect_used)]

use super::{
    BackendAdapter, BackendCapabilities, BackendHandle, BackendState, BackendStatus, TaskSpec,
};
use crate::error::{Error, Result};
use crate::types::{BackendKind, Progress, TaskId};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Mutex;

/// Scripted failure for the next submit or poll
#[derive(Clone, Copy, Debug)]
pub(crate) enum Failure {
    /// Connection reset; retryable, classified as a network error
    Transient,
    /// Rejected by the backend; never retried
    Permanent,
}

impl Failure {
    fn into_error(self) -> Error {
        match self {
            Failure::Transient => Error::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "connection reset by backend",
            )),
            Failure::Permanent => Error::backend("mock", "job rejected", false),
        }
    }
}

#[derive(Default)]
struct MockState {
    next_handle: u64,
    submit_failures: VecDeque<Failure>,
    poll_failures: VecDeque<Failure>,
    jobs: HashMap<BackendHandle, BackendStatus>,
    handles: HashMap<TaskId, BackendHandle>,
    submits: usize,
    cancels: Vec<BackendHandle>,
    pauses: usize,
    resumes: usize,
    reattaches: usize,
    caps: Vec<(TaskId, u64)>,
    /// Number of caps applied when each resume arrived
    resume_marks: Vec<usize>,
    released: Vec<BackendHandle>,
}

/// Backend whose jobs only move when a test tells them to
pub(crate) struct MockBackend {
    kind: BackendKind,
    capabilities: BackendCapabilities,
    state: Mutex<MockState>,
}

impl MockBackend {
    /// Mock with native pause and per-job caps
    pub(crate) fn new(kind: BackendKind) -> Self {
        Self::with_capabilities(
            kind,
            BackendCapabilities {
                pause: true,
                bandwidth_cap: true,
            },
        )
    }

    pub(crate) fn with_capabilities(kind: BackendKind, capabilities: BackendCapabilities) -> Self {
        Self {
            kind,
            capabilities,
            state: Mutex::new(MockState::default()),
        }
    }

    pub(crate) fn fail_submits(&self, failures: impl IntoIterator<Item = Failure>) {
        self.state.lock().unwrap().submit_failures.extend(failures);
    }

    pub(crate) fn fail_polls(&self, failures: impl IntoIterator<Item = Failure>) {
        self.state.lock().unwrap().poll_failures.extend(failures);
    }

    /// Current handle of a task's job
    pub(crate) fn handle_of(&self, id: TaskId) -> Option<BackendHandle> {
        self.state.lock().unwrap().handles.get(&id).cloned()
    }

    fn update(&self, id: TaskId, f: impl FnOnce(&mut BackendStatus)) {
        let mut state = self.state.lock().unwrap();
        let handle = state.handles.get(&id).cloned().expect("task never submitted");
        if let Some(status) = state.jobs.get_mut(&handle) {
            f(status);
        }
    }

    pub(crate) fn set_progress(&self, id: TaskId, bytes_done: u64, bytes_total: u64) {
        self.update(id, |s| {
            s.progress = Progress {
                bytes_done,
                bytes_total,
                speed_bps: 1_000,
                eta_secs: None,
            };
        });
    }

    /// Finish the task's job with `artifact` as its output
    pub(crate) fn complete(&self, id: TaskId, artifact: PathBuf) {
        self.update(id, |s| {
            s.state = BackendState::Done;
            s.progress.bytes_done = s.progress.bytes_total;
            s.artifact_path = Some(artifact);
        });
    }

    pub(crate) fn set_errored(&self, id: TaskId, message: &str, transient: bool) {
        let message = message.to_string();
        self.update(id, |s| *s = BackendStatus::errored(s.progress, message, transient));
    }

    /// Forget the task's job as if the backend lost it
    pub(crate) fn remove(&self, id: TaskId) {
        let mut state = self.state.lock().unwrap();
        if let Some(handle) = state.handles.get(&id).cloned() {
            state.jobs.remove(&handle);
        }
    }

    /// Register a job that exists on the backend before any submit
    pub(crate) fn adopt(&self, id: TaskId, handle: BackendHandle) {
        let mut state = self.state.lock().unwrap();
        state
            .jobs
            .insert(handle.clone(), BackendStatus::active(Progress::default()));
        state.handles.insert(id, handle);
    }

    pub(crate) fn submit_count(&self) -> usize {
        self.state.lock().unwrap().submits
    }

    pub(crate) fn cancel_count(&self) -> usize {
        self.state.lock().unwrap().cancels.len()
    }

    pub(crate) fn pause_count(&self) -> usize {
        self.state.lock().unwrap().pauses
    }

    pub(crate) fn resume_count(&self) -> usize {
        self.state.lock().unwrap().resumes
    }

    pub(crate) fn reattach_count(&self) -> usize {
        self.state.lock().unwrap().reattaches
    }

    pub(crate) fn release_count(&self) -> usize {
        self.state.lock().unwrap().released.len()
    }

    /// Last cap applied to the task's job
    pub(crate) fn cap_of(&self, id: TaskId) -> Option<u64> {
        self.state
            .lock()
            .unwrap()
            .caps
            .iter()
            .rev()
            .find(|(task, _)| *task == id)
            .map(|(_, bps)| *bps)
    }

    /// Caps applied before the most recent resume, oldest first
    pub(crate) fn caps_before_last_resume(&self) -> Vec<(TaskId, u64)> {
        let state = self.state.lock().unwrap();
        let upto = state.resume_marks.last().copied().unwrap_or(0);
        state.caps[..upto].to_vec()
    }

    fn task_of(state: &MockState, handle: &BackendHandle) -> Option<TaskId> {
        state
            .handles
            .iter()
            .find(|(_, h)| *h == handle)
            .map(|(id, _)| *id)
    }
}

#[async_trait]
impl BackendAdapter for MockBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn name(&self) -> &str {
        "mock"
    }

    fn capabilities(&self) -> BackendCapabilities {
        self.capabilities
    }

    async fn submit(&self, spec: &TaskSpec) -> Result<BackendHandle> {
        let mut state = self.state.lock().unwrap();
        state.submits += 1;
        if let Some(failure) = state.submit_failures.pop_front() {
            return Err(failure.into_error());
        }
        state.next_handle += 1;
        let handle = BackendHandle::new(format!("mock-{}-{}", spec.id, state.next_handle));
        state
            .jobs
            .insert(handle.clone(), BackendStatus::active(Progress::default()));
        state.handles.insert(spec.id, handle.clone());
        Ok(handle)
    }

    async fn reattach(&self, _spec: &TaskSpec, _handle: &BackendHandle) -> Result<()> {
        self.state.lock().unwrap().reattaches += 1;
        Ok(())
    }

    async fn poll(&self, handle: &BackendHandle) -> Result<BackendStatus> {
        let mut state = self.state.lock().unwrap();
        if let Some(failure) = state.poll_failures.pop_front() {
            return Err(failure.into_error());
        }
        Ok(state
            .jobs
            .get(handle)
            .cloned()
            .unwrap_or_else(BackendStatus::missing))
    }

    async fn pause(&self, handle: &BackendHandle) -> Result<()> {
        if !self.capabilities.pause {
            return Err(Error::unsupported("mock", "pause"));
        }
        let mut state = self.state.lock().unwrap();
        state.pauses += 1;
        if let Some(status) = state.jobs.get_mut(handle)
            && status.state == BackendState::Active
        {
            status.state = BackendState::Paused;
        }
        Ok(())
    }

    async fn resume(&self, handle: &BackendHandle) -> Result<()> {
        if !self.capabilities.pause {
            return Err(Error::unsupported("mock", "resume"));
        }
        let mut state = self.state.lock().unwrap();
        state.resumes += 1;
        let mark = state.caps.len();
        state.resume_marks.push(mark);
        if let Some(status) = state.jobs.get_mut(handle)
            && status.state == BackendState::Paused
        {
            status.state = BackendState::Active;
        }
        Ok(())
    }

    async fn cancel(&self, handle: &BackendHandle) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.jobs.remove(handle);
        state.cancels.push(handle.clone());
        Ok(())
    }

    async fn apply_bandwidth_cap(&self, handle: &BackendHandle, bps: u64) -> Result<()> {
        if !self.capabilities.bandwidth_cap {
            return Err(Error::unsupported("mock", "bandwidth cap"));
        }
        let mut state = self.state.lock().unwrap();
        if let Some(id) = Self::task_of(&state, handle) {
            state.caps.push((id, bps));
        }
        Ok(())
    }

    async fn release(&self, handle: &BackendHandle) -> Result<()> {
        self.state.lock().unwrap().released.push(handle.clone());
        Ok(())
    }
}
