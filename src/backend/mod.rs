//! Download backends
//!
//! Every backend is driven through the [`BackendAdapter`] trait. Adapters only
//! register, observe and control jobs on their backend; retry, scheduling and
//! state bookkeeping belong to the engine. Capabilities a backend lacks are
//! reported with [`Error::Unsupported`] so callers can degrade explicitly.

pub mod cloud;
pub mod extractor;
pub mod http;
pub mod torrent;
pub mod usenet;

#[cfg(test)]
pub(crate) mod mock;

pub use cloud::CloudAdapter;
pub use extractor::{ExtractorAdapter, LinkResolver, ResolvedLink, YtDlpResolver};
pub use http::HttpAdapter;
pub use torrent::TorrentAdapter;
pub use usenet::UsenetAdapter;

use crate::bandwidth::TokenBucket;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::types::{BackendKind, Progress, Source, TaskId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

/// Backend-side identifier of a job
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BackendHandle(pub String);

impl BackendHandle {
    /// Wrap a backend identifier
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The identifier as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for BackendHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Optional controls a backend supports per job
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendCapabilities {
    /// Native pause/resume keeping transfer state
    pub pause: bool,
    /// Per-job download rate cap
    pub bandwidth_cap: bool,
}

/// Job state as reported by a backend
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendState {
    /// Transferring or waiting inside the backend
    Active,
    /// Paused on the backend
    Paused,
    /// Finished; the artifact is ready
    Done,
    /// The backend gave up on the job
    Errored,
    /// The backend does not know the handle
    Missing,
}

/// Failure reported by a backend for an errored job
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendFailure {
    /// Backend error message
    pub message: String,
    /// Whether resubmitting the job may succeed
    pub transient: bool,
}

/// One poll result
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BackendStatus {
    /// Job state
    pub state: BackendState,
    /// Transfer progress
    pub progress: Progress,
    /// Local artifact path when `Done`
    pub artifact_path: Option<PathBuf>,
    /// Failure details when `Errored`
    pub error: Option<BackendFailure>,
}

impl BackendStatus {
    /// Active job with the given progress
    pub fn active(progress: Progress) -> Self {
        Self {
            state: BackendState::Active,
            progress,
            artifact_path: None,
            error: None,
        }
    }

    /// Paused job with the given progress
    pub fn paused(progress: Progress) -> Self {
        Self {
            state: BackendState::Paused,
            ..Self::active(progress)
        }
    }

    /// Finished job
    pub fn done(progress: Progress, artifact_path: Option<PathBuf>) -> Self {
        Self {
            state: BackendState::Done,
            progress,
            artifact_path,
            error: None,
        }
    }

    /// Errored job
    pub fn errored(progress: Progress, message: impl Into<String>, transient: bool) -> Self {
        Self {
            state: BackendState::Errored,
            progress,
            artifact_path: None,
            error: Some(BackendFailure {
                message: message.into(),
                transient,
            }),
        }
    }

    /// Unknown handle
    pub fn missing() -> Self {
        Self {
            state: BackendState::Missing,
            progress: Progress::default(),
            artifact_path: None,
            error: None,
        }
    }
}

/// What an adapter needs to register a job
#[derive(Clone, Debug)]
pub struct TaskSpec {
    /// Engine task ID
    pub id: TaskId,
    /// Display name
    pub name: String,
    /// What to download
    pub source: Source,
    /// Task category
    pub category: Option<String>,
    /// Local directory reserved for this task
    pub download_dir: PathBuf,
}

/// Uniform control surface over one download backend
///
/// Implementations must be cheap to call concurrently and must not retry
/// internally; the engine applies the task's retry budget.
#[async_trait]
pub trait BackendAdapter: Send + Sync {
    /// Backend family served by this adapter
    fn kind(&self) -> BackendKind;

    /// Short backend name for logs and errors (e.g. "transmission")
    fn name(&self) -> &str;

    /// Optional controls this backend supports
    fn capabilities(&self) -> BackendCapabilities;

    /// Register a job; returns the backend handle
    async fn submit(&self, spec: &TaskSpec) -> Result<BackendHandle>;

    /// Take over a job registered before a restart
    ///
    /// Called with the restored handle before it is polled again.
    async fn reattach(&self, _spec: &TaskSpec, _handle: &BackendHandle) -> Result<()> {
        Ok(())
    }

    /// Read the job's current status without blocking on the transfer
    async fn poll(&self, handle: &BackendHandle) -> Result<BackendStatus>;

    /// Pause the job natively
    async fn pause(&self, _handle: &BackendHandle) -> Result<()> {
        Err(Error::unsupported(self.name(), "pause"))
    }

    /// Resume a natively paused job
    async fn resume(&self, _handle: &BackendHandle) -> Result<()> {
        Err(Error::unsupported(self.name(), "resume"))
    }

    /// Cancel the job and discard its data; unknown handles succeed
    async fn cancel(&self, handle: &BackendHandle) -> Result<()>;

    /// Cap the job's download rate (0 = unlimited)
    async fn apply_bandwidth_cap(&self, _handle: &BackendHandle, _bps: u64) -> Result<()> {
        Err(Error::unsupported(self.name(), "bandwidth cap"))
    }

    /// The engine took over the artifact; drop any bookkeeping for the job
    async fn release(&self, _handle: &BackendHandle) -> Result<()> {
        Ok(())
    }
}

/// The adapters available to an engine, one per backend kind
#[derive(Clone, Default)]
pub struct BackendSet {
    adapters: HashMap<BackendKind, Arc<dyn BackendAdapter>>,
}

impl BackendSet {
    /// Empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter under its own kind, replacing any previous one
    pub fn insert(&mut self, adapter: Arc<dyn BackendAdapter>) {
        self.adapters.insert(adapter.kind(), adapter);
    }

    /// Builder-style [`insert`](Self::insert)
    #[must_use]
    pub fn with(mut self, adapter: Arc<dyn BackendAdapter>) -> Self {
        self.insert(adapter);
        self
    }

    /// Adapter for a kind, if configured
    pub fn get(&self, kind: BackendKind) -> Option<Arc<dyn BackendAdapter>> {
        self.adapters.get(&kind).cloned()
    }

    /// Adapter for a kind, or a configuration error naming the missing backend
    pub fn require(&self, kind: BackendKind) -> Result<Arc<dyn BackendAdapter>> {
        self.get(kind).ok_or_else(|| Error::Config {
            message: format!("no {} backend configured", kind),
            key: Some(format!("backends.{}", kind)),
        })
    }

    /// Configured kinds
    pub fn kinds(&self) -> Vec<BackendKind> {
        let mut kinds: Vec<_> = self.adapters.keys().copied().collect();
        kinds.sort();
        kinds
    }

    /// Build the adapters described by `config`
    ///
    /// HTTP and the link extractor are always present. The HTTP adapter draws
    /// from `global` so in-process transfers respect the global cap.
    pub fn from_config(config: &Config, global: TokenBucket) -> Result<Self> {
        let backends = &config.backends;
        let http = Arc::new(HttpAdapter::new(&backends.http, global)?);

        let mut set = BackendSet::new();
        set.insert(http.clone());
        set.insert(Arc::new(ExtractorAdapter::new(
            Arc::new(YtDlpResolver::from_config(&backends.extractor)),
            http.clone(),
        )));

        if let Some(transmission) = &backends.transmission {
            set.insert(Arc::new(TorrentAdapter::transmission(transmission)?));
        } else if let Some(qbittorrent) = &backends.qbittorrent {
            set.insert(Arc::new(TorrentAdapter::qbittorrent(qbittorrent)?));
        }
        if let Some(sabnzbd) = &backends.sabnzbd {
            set.insert(Arc::new(UsenetAdapter::new(sabnzbd)?));
        }
        if let Some(cloud) = &backends.cloud {
            set.insert(Arc::new(CloudAdapter::new(cloud, http)?));
        }

        tracing::info!(backends = ?set.kinds(), "backends configured");
        Ok(set)
    }
}

/// Map a non-success HTTP status from a backend API to a classified error
pub(crate) fn status_error(backend: &str, status: reqwest::StatusCode, context: &str) -> Error {
    let transient = status.is_server_error()
        || status == reqwest::StatusCode::TOO_MANY_REQUESTS
        || status == reqwest::StatusCode::REQUEST_TIMEOUT;
    Error::backend(backend, format!("{} returned HTTP {}", context, status), transient)
}
