//! BitTorrent backends
//!
//! Transmission and qBittorrent are driven through the same [`TorrentService`]
//! seam so the engine sees a single torrent backend with native pause and
//! per-job download caps.

pub mod qbittorrent;
pub mod transmission;

pub use qbittorrent::QBittorrentClient;
pub use transmission::TransmissionClient;

use super::{BackendAdapter, BackendCapabilities, BackendHandle, BackendStatus, TaskSpec};
use crate::config::{QBittorrentConfig, TransmissionConfig};
use crate::error::{Error, Result};
use crate::types::{BackendKind, Progress, Source};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

/// Torrent to add
#[derive(Clone, Debug)]
pub struct AddTorrent {
    /// Magnet URI or .torrent metainfo
    pub payload: TorrentPayload,
    /// Label attached to the torrent for lookup
    pub tag: String,
    /// Category or label forwarded to the client
    pub category: Option<String>,
}

/// What identifies the torrent
#[derive(Clone, Debug)]
pub enum TorrentPayload {
    /// Magnet URI
    Magnet(String),
    /// Bencoded .torrent file
    File {
        /// File name
        filename: String,
        /// Metainfo bytes
        data: Vec<u8>,
    },
}

/// Normalized phase of a torrent
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TorrentPhase {
    /// Fetching metadata, checking, queued or downloading
    Downloading,
    /// Stopped before completion
    Stopped,
    /// All wanted pieces present
    Complete,
    /// Client reports an error
    Failed,
}

/// Normalized torrent status from either client
#[derive(Clone, Debug)]
pub struct TorrentStatus {
    /// Torrent name
    pub name: String,
    /// Normalized phase
    pub phase: TorrentPhase,
    /// Bytes of wanted data present
    pub bytes_done: u64,
    /// Size of wanted data
    pub bytes_total: u64,
    /// Download rate in bytes per second
    pub download_bps: u64,
    /// Client ETA
    pub eta_secs: Option<u64>,
    /// Where the content lives, as seen by the client
    pub content_path: Option<PathBuf>,
    /// Error message and whether it may clear by itself (tracker errors)
    pub error: Option<(String, bool)>,
}

impl TorrentStatus {
    fn into_backend_status(self) -> BackendStatus {
        let progress = Progress {
            bytes_done: self.bytes_done,
            bytes_total: self.bytes_total,
            speed_bps: self.download_bps,
            eta_secs: self.eta_secs,
        };
        match (self.phase, self.error) {
            (TorrentPhase::Failed, error) => {
                let (message, transient) =
                    error.unwrap_or_else(|| ("torrent error".to_string(), false));
                BackendStatus::errored(progress, message, transient)
            }
            (TorrentPhase::Complete, _) => BackendStatus::done(progress, self.content_path),
            (TorrentPhase::Stopped, _) => BackendStatus::paused(progress),
            (TorrentPhase::Downloading, _) => BackendStatus::active(progress),
        }
    }
}

/// Job control on one torrent client
///
/// `key` is whatever [`add`](TorrentService::add) returned.
#[async_trait]
pub trait TorrentService: Send + Sync {
    /// Client name for logs and errors
    fn name(&self) -> &'static str;

    /// Add a torrent; returns the key used by every other call
    async fn add(&self, request: AddTorrent) -> Result<String>;

    /// Current status, None when the client no longer knows the torrent
    async fn status(&self, key: &str) -> Result<Option<TorrentStatus>>;

    /// Stop transferring, keeping data
    async fn stop(&self, key: &str) -> Result<()>;

    /// Restart a stopped torrent
    async fn start(&self, key: &str) -> Result<()>;

    /// Remove the torrent; unknown keys succeed
    async fn remove(&self, key: &str, delete_data: bool) -> Result<()>;

    /// Per-torrent download limit in bytes per second (0 = unlimited)
    async fn set_download_limit(&self, key: &str, bps: u64) -> Result<()>;
}

/// Torrent backend over Transmission or qBittorrent
pub struct TorrentAdapter {
    service: Arc<dyn TorrentService>,
}

impl TorrentAdapter {
    /// Adapter over an arbitrary service
    pub fn with_service(service: Arc<dyn TorrentService>) -> Self {
        Self { service }
    }

    /// Adapter over Transmission RPC
    pub fn transmission(config: &TransmissionConfig) -> Result<Self> {
        Ok(Self::with_service(Arc::new(TransmissionClient::new(
            config.clone(),
        )?)))
    }

    /// Adapter over qBittorrent WebUI
    pub fn qbittorrent(config: &QBittorrentConfig) -> Result<Self> {
        Ok(Self::with_service(Arc::new(QBittorrentClient::new(
            config.clone(),
        )?)))
    }
}

#[async_trait]
impl BackendAdapter for TorrentAdapter {
    fn kind(&self) -> BackendKind {
        BackendKind::Torrent
    }

    fn name(&self) -> &str {
        self.service.name()
    }

    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities {
            pause: true,
            bandwidth_cap: true,
        }
    }

    async fn submit(&self, spec: &TaskSpec) -> Result<BackendHandle> {
        let payload = match &spec.source {
            Source::Magnet { uri } => TorrentPayload::Magnet(uri.clone()),
            Source::TorrentFile { filename, data } => TorrentPayload::File {
                filename: filename.clone(),
                data: data.clone(),
            },
            other => {
                return Err(Error::backend(
                    self.service.name(),
                    format!("cannot add {:?} source", other.default_backend()),
                    false,
                ));
            }
        };
        let key = self
            .service
            .add(AddTorrent {
                payload,
                tag: format!("transfer-engine-{}", spec.id),
                category: spec.category.clone(),
            })
            .await?;
        info!(task_id = spec.id.0, backend = self.service.name(), key, "torrent added");
        Ok(BackendHandle::new(key))
    }

    async fn poll(&self, handle: &BackendHandle) -> Result<BackendStatus> {
        Ok(match self.service.status(handle.as_str()).await? {
            Some(status) => status.into_backend_status(),
            None => BackendStatus::missing(),
        })
    }

    async fn pause(&self, handle: &BackendHandle) -> Result<()> {
        self.service.stop(handle.as_str()).await
    }

    async fn resume(&self, handle: &BackendHandle) -> Result<()> {
        self.service.start(handle.as_str()).await
    }

    async fn cancel(&self, handle: &BackendHandle) -> Result<()> {
        debug!(backend = self.service.name(), %handle, "removing torrent");
        self.service.remove(handle.as_str(), true).await
    }

    async fn apply_bandwidth_cap(&self, handle: &BackendHandle, bps: u64) -> Result<()> {
        self.service.set_download_limit(handle.as_str(), bps).await
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendState;

    fn status(phase: TorrentPhase, error: Option<(String, bool)>) -> TorrentStatus {
        TorrentStatus {
            name: "ubuntu.iso".into(),
            phase,
            bytes_done: 50,
            bytes_total: 100,
            download_bps: 10,
            eta_secs: Some(5),
            content_path: Some(PathBuf::from("/data/ubuntu.iso")),
            error,
        }
    }

    #[test]
    fn phases_map_to_backend_states() {
        assert_eq!(
            status(TorrentPhase::Downloading, None)
                .into_backend_status()
                .state,
            BackendState::Active
        );
        assert_eq!(
            status(TorrentPhase::Stopped, None).into_backend_status().state,
            BackendState::Paused
        );
        let done = status(TorrentPhase::Complete, None).into_backend_status();
        assert_eq!(done.state, BackendState::Done);
        assert_eq!(done.artifact_path, Some(PathBuf::from("/data/ubuntu.iso")));
        assert_eq!(done.progress.eta_secs, Some(5));
    }

    #[test]
    fn failed_phase_carries_error() {
        let failed = status(
            TorrentPhase::Failed,
            Some(("tracker unreachable".into(), true)),
        )
        .into_backend_status();
        assert_eq!(failed.state, BackendState::Errored);
        let error = failed.error.unwrap();
        assert_eq!(error.message, "tracker unreachable");
        assert!(error.transient);
    }
}
