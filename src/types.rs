//! Core types for transfer-engine

use crate::error::TaskError;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::LazyLock;

/// Unique identifier for a task
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub i64);

impl TaskId {
    /// Create a new TaskId
    pub fn new(id: i64) -> Self {
        Self(id)
    }

    /// Get the inner i64 value
    pub fn get(&self) -> i64 {
        self.0
    }
}

impl From<i64> for TaskId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

impl From<TaskId> for i64 {
    fn from(id: TaskId) -> Self {
        id.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

// Implement sqlx Type, Encode, and Decode for database operations
impl sqlx::Type<sqlx::Sqlite> for TaskId {
    fn type_info() -> sqlx::sqlite::SqliteTypeInfo {
        <i64 as sqlx::Type<sqlx::Sqlite>>::type_info()
    }

    fn compatible(ty: &sqlx::sqlite::SqliteTypeInfo) -> bool {
        <i64 as sqlx::Type<sqlx::Sqlite>>::compatible(ty)
    }
}

impl<'q> sqlx::Encode<'q, sqlx::Sqlite> for TaskId {
    fn encode_by_ref(
        &self,
        buf: &mut Vec<sqlx::sqlite::SqliteArgumentValue<'q>>,
    ) -> Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync>> {
        sqlx::Encode::<sqlx::Sqlite>::encode_by_ref(&self.0, buf)
    }
}

impl<'r> sqlx::Decode<'r, sqlx::Sqlite> for TaskId {
    fn decode(value: sqlx::sqlite::SqliteValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let id = <i64 as sqlx::Decode<sqlx::Sqlite>>::decode(value)?;
        Ok(Self(id))
    }
}

/// Task lifecycle state
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    /// Waiting for a concurrency slot
    Queued,
    /// Registered with a backend and transferring
    Downloading,
    /// Paused by the user or a global pause
    Paused,
    /// Running post-processing stages
    Processing,
    /// Handing the artifact to the upload dispatcher
    Uploading,
    /// Finished successfully
    Completed,
    /// Finished with an error
    Failed,
    /// Cancelled by the user
    Cancelled,
}

impl TaskState {
    /// Convert integer state code to TaskState
    pub fn from_i32(state: i32) -> Self {
        match state {
            0 => TaskState::Queued,
            1 => TaskState::Downloading,
            2 => TaskState::Paused,
            3 => TaskState::Processing,
            4 => TaskState::Uploading,
            5 => TaskState::Completed,
            6 => TaskState::Failed,
            7 => TaskState::Cancelled,
            _ => TaskState::Failed, // Default to Failed for unknown state
        }
    }

    /// Convert TaskState to integer state code
    pub fn to_i32(&self) -> i32 {
        match self {
            TaskState::Queued => 0,
            TaskState::Downloading => 1,
            TaskState::Paused => 2,
            TaskState::Processing => 3,
            TaskState::Uploading => 4,
            TaskState::Completed => 5,
            TaskState::Failed => 6,
            TaskState::Cancelled => 7,
        }
    }

    /// Whether the state is final
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Cancelled
        )
    }

    /// Whether the state machine allows moving from `self` to `next`
    pub fn can_transition_to(&self, next: TaskState) -> bool {
        use TaskState::*;
        if self.is_terminal() {
            return false;
        }
        match next {
            Cancelled | Failed => true,
            Downloading => matches!(self, Queued | Paused),
            Paused => matches!(self, Downloading),
            // requeue after preemption, degraded resume
            Queued => matches!(self, Downloading | Paused),
            Processing => matches!(self, Downloading),
            Uploading => matches!(self, Processing),
            Completed => matches!(self, Uploading),
        }
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskState::Queued => "queued",
            TaskState::Downloading => "downloading",
            TaskState::Paused => "paused",
            TaskState::Processing => "processing",
            TaskState::Uploading => "uploading",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
            TaskState::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Task priority; lower values are admitted first
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Priority(pub i32);

impl Priority {
    /// Urgent jobs
    pub const HIGH: Priority = Priority(-10);
    /// Default priority
    pub const NORMAL: Priority = Priority(0);
    /// Background jobs
    pub const LOW: Priority = Priority(10);
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Backend family a task runs on
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// In-process HTTP(S) download
    Http,
    /// Transmission or qBittorrent
    Torrent,
    /// SABnzbd
    Usenet,
    /// Remote cloud retrieval service
    Cloud,
    /// Link resolver in front of the HTTP backend
    Extractor,
}

impl BackendKind {
    /// All backend kinds
    pub const ALL: [BackendKind; 5] = [
        BackendKind::Http,
        BackendKind::Torrent,
        BackendKind::Usenet,
        BackendKind::Cloud,
        BackendKind::Extractor,
    ];

    /// Stable lowercase name used in config keys and the database
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Http => "http",
            BackendKind::Torrent => "torrent",
            BackendKind::Usenet => "usenet",
            BackendKind::Cloud => "cloud",
            BackendKind::Extractor => "extractor",
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "http" => Ok(BackendKind::Http),
            "torrent" => Ok(BackendKind::Torrent),
            "usenet" => Ok(BackendKind::Usenet),
            "cloud" => Ok(BackendKind::Cloud),
            "extractor" => Ok(BackendKind::Extractor),
            other => Err(format!("unknown backend kind: {}", other)),
        }
    }
}

/// What a task downloads
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Source {
    /// Plain HTTP(S) URL
    DirectUrl {
        /// URL to fetch
        url: String,
        /// Override for the saved filename
        #[serde(default, skip_serializing_if = "Option::is_none")]
        filename: Option<String>,
    },
    /// Magnet URI
    Magnet {
        /// The `magnet:?xt=...` URI
        uri: String,
    },
    /// Raw .torrent metainfo
    TorrentFile {
        /// File name of the .torrent
        filename: String,
        /// Bencoded metainfo bytes
        data: Vec<u8>,
    },
    /// NZB fetched by the backend from a URL
    NzbUrl {
        /// URL of the NZB
        url: String,
    },
    /// NZB document content
    NzbFile {
        /// Job name
        name: String,
        /// NZB XML
        content: String,
    },
    /// Page URL whose media link must be resolved first
    MediaExtract {
        /// Page URL
        url: String,
        /// Resolver format selector (e.g. "best")
        #[serde(default, skip_serializing_if = "Option::is_none")]
        format: Option<String>,
    },
    /// Reference understood by the cloud retrieval service
    CloudFile {
        /// Opaque file reference
        reference: String,
    },
}

static BTIH_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"urn:btih:([0-9A-Fa-f]{40}|[A-Za-z2-7]{32})").ok());

impl Source {
    /// Backend the source runs on unless overridden at submission
    pub fn default_backend(&self) -> BackendKind {
        match self {
            Source::DirectUrl { .. } => BackendKind::Http,
            Source::Magnet { .. } | Source::TorrentFile { .. } => BackendKind::Torrent,
            Source::NzbUrl { .. } | Source::NzbFile { .. } => BackendKind::Usenet,
            Source::MediaExtract { .. } => BackendKind::Extractor,
            Source::CloudFile { .. } => BackendKind::Cloud,
        }
    }

    /// Best-effort display name
    pub fn display_name(&self) -> String {
        match self {
            Source::DirectUrl { filename: Some(f), .. } => f.clone(),
            Source::DirectUrl { url, .. } | Source::NzbUrl { url } => {
                last_url_segment(url).unwrap_or_else(|| url.clone())
            }
            Source::Magnet { uri } => magnet_display_name(uri),
            Source::TorrentFile { filename, .. } => filename.clone(),
            Source::NzbFile { name, .. } => name.clone(),
            Source::MediaExtract { url, .. } => url.clone(),
            Source::CloudFile { reference } => reference.clone(),
        }
    }

    /// Info hash of a magnet URI, lowercased when hex
    pub fn magnet_info_hash(&self) -> Option<String> {
        let Source::Magnet { uri } = self else {
            return None;
        };
        let re = BTIH_RE.as_ref()?;
        let hash = re.captures(uri)?.get(1)?.as_str();
        if hash.len() == 40 {
            Some(hash.to_ascii_lowercase())
        } else {
            Some(hash.to_string())
        }
    }
}

fn last_url_segment(url: &str) -> Option<String> {
    let parsed = url::Url::parse(url).ok()?;
    let segment = parsed.path_segments()?.rev().find(|s| !s.is_empty())?;
    urlencoding::decode(segment).ok().map(|s| s.into_owned())
}

fn magnet_display_name(uri: &str) -> String {
    if let Ok(parsed) = url::Url::parse(uri)
        && let Some((_, dn)) = parsed.query_pairs().find(|(k, _)| k == "dn")
        && !dn.is_empty()
    {
        return dn.into_owned();
    }
    let source = Source::Magnet {
        uri: uri.to_string(),
    };
    match source.magnet_info_hash() {
        Some(hash) => format!("magnet-{}", &hash[..hash.len().min(12)]),
        None => "magnet".to_string(),
    }
}

/// Transfer progress; eventually consistent, informational only
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    /// Bytes transferred so far
    pub bytes_done: u64,
    /// Total size when known (0 = unknown)
    pub bytes_total: u64,
    /// Current speed in bytes per second
    pub speed_bps: u64,
    /// Estimated seconds remaining
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eta_secs: Option<u64>,
}

impl Progress {
    /// Completion percentage (0.0 to 100.0), 0.0 when size is unknown
    pub fn percent(&self) -> f32 {
        if self.bytes_total == 0 {
            return 0.0;
        }
        ((self.bytes_done as f64 / self.bytes_total as f64) * 100.0).min(100.0) as f32
    }

    /// Derive an ETA from size and speed when the backend reports none
    pub fn with_estimated_eta(mut self) -> Self {
        if self.eta_secs.is_none() && self.speed_bps > 0 && self.bytes_total >= self.bytes_done {
            self.eta_secs = Some((self.bytes_total - self.bytes_done) / self.speed_bps);
        }
        self
    }
}

/// Post-processing stage applied after the download finishes
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum PostProcessStage {
    /// Extract zip/7z/rar archives
    Extract {
        /// Remove the archive after successful extraction
        #[serde(default)]
        delete_archive: bool,
        /// Password for encrypted archives
        #[serde(default, skip_serializing_if = "Option::is_none")]
        password: Option<String>,
    },
    /// Probe media files with ffprobe
    InspectMedia,
}

impl PostProcessStage {
    /// Stage name used in events and error messages
    pub fn name(&self) -> &'static str {
        match self {
            PostProcessStage::Extract { .. } => "extract",
            PostProcessStage::InspectMedia => "inspect_media",
        }
    }
}

/// Archive type detected by file extension
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArchiveType {
    /// RAR archive (.rar)
    Rar,
    /// 7-Zip archive (.7z)
    SevenZip,
    /// ZIP archive (.zip)
    Zip,
}

/// Where the finished artifact goes
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Destination {
    /// Destination store kind (e.g. "local", "drive")
    pub kind: String,
    /// Store-specific target (folder, chat id, ...)
    pub target: String,
}

impl Default for Destination {
    fn default() -> Self {
        Self {
            kind: "local".to_string(),
            target: String::new(),
        }
    }
}

/// Job submission request
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SubmitRequest {
    /// What to download
    pub source: Source,
    /// Submitting principal
    pub owner: String,
    /// Admission priority (lower first)
    #[serde(default)]
    pub priority: Priority,
    /// Free-form label
    #[serde(default)]
    pub category: Option<String>,
    /// Per-task bandwidth cap in bytes per second (0 = unlimited)
    #[serde(default)]
    pub bandwidth_cap_bps: u64,
    /// Retry budget override (engine default when None)
    #[serde(default)]
    pub max_retries: Option<u32>,
    /// Backend override (derived from the source when None)
    #[serde(default)]
    pub backend: Option<BackendKind>,
    /// Display name override
    #[serde(default)]
    pub name: Option<String>,
    /// Ordered post-processing stages
    #[serde(default)]
    pub stages: Vec<PostProcessStage>,
    /// Upload destination
    #[serde(default)]
    pub destination: Destination,
}

impl SubmitRequest {
    /// Request with default options for the given source and owner
    pub fn new(source: Source, owner: impl Into<String>) -> Self {
        Self {
            source,
            owner: owner.into(),
            priority: Priority::NORMAL,
            category: None,
            bandwidth_cap_bps: 0,
            max_retries: None,
            backend: None,
            name: None,
            stages: Vec::new(),
            destination: Destination::default(),
        }
    }
}

/// Read-only copy of a live task
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskSnapshot {
    /// Task ID
    pub id: TaskId,
    /// Submitting principal
    pub owner: String,
    /// Display name
    pub name: String,
    /// What is downloaded
    pub source: Source,
    /// Backend family
    pub backend: BackendKind,
    /// Lifecycle state
    pub state: TaskState,
    /// Admission priority
    pub priority: Priority,
    /// Submission time (FIFO tie-break)
    pub created_at: DateTime<Utc>,
    /// When the current run was admitted
    pub started_at: Option<DateTime<Utc>>,
    /// Transfer progress
    pub progress: Progress,
    /// Per-task cap in bytes per second (0 = unlimited)
    pub bandwidth_cap_bps: u64,
    /// Free-form label
    pub category: Option<String>,
    /// Retries consumed
    pub retry_count: u32,
    /// Retry budget
    pub max_retries: u32,
    /// Failure reason (only in `Failed`)
    pub last_error: Option<TaskError>,
    /// Local artifact path once the download is done
    pub artifact_path: Option<PathBuf>,
    /// Post-processing stages
    pub stages: Vec<PostProcessStage>,
    /// Upload destination
    pub destination: Destination,
    /// Current backend job handle
    pub backend_handle: Option<String>,
    /// Whether the task occupies a concurrency slot
    pub slot_held: bool,
    /// Monotonic mutation counter for checkpoint ordering
    pub revision: u64,
}

/// Immutable record of a finished task
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// Task ID
    pub id: TaskId,
    /// Submitting principal
    pub owner: String,
    /// Display name
    pub name: String,
    /// Backend family
    pub backend: BackendKind,
    /// Free-form label
    pub category: Option<String>,
    /// Terminal state
    pub state: TaskState,
    /// Failure reason
    pub last_error: Option<TaskError>,
    /// Size in bytes
    pub bytes_total: u64,
    /// Retries consumed
    pub retry_count: u32,
    /// Submission time
    pub created_at: DateTime<Utc>,
    /// Completion time
    pub completed_at: DateTime<Utc>,
    /// Reference returned by the upload dispatcher
    pub upload_reference: Option<String>,
    /// Final local artifact path
    pub artifact_path: Option<PathBuf>,
}

/// Filter for history queries
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct HistoryFilter {
    /// Only entries submitted by this owner
    pub owner: Option<String>,
    /// Only entries in this terminal state
    pub state: Option<TaskState>,
    /// Only entries from this backend
    pub backend: Option<BackendKind>,
    /// Only entries with this category
    pub category: Option<String>,
    /// Maximum number of entries, newest first
    pub limit: Option<usize>,
}

impl HistoryFilter {
    /// Whether an entry passes the filter (ignores `limit`)
    pub fn matches(&self, entry: &HistoryEntry) -> bool {
        self.owner.as_ref().is_none_or(|o| *o == entry.owner)
            && self.state.is_none_or(|s| s == entry.state)
            && self.backend.is_none_or(|b| b == entry.backend)
            && self
                .category
                .as_ref()
                .is_none_or(|c| entry.category.as_ref() == Some(c))
    }
}

/// Queue counters
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Tasks waiting for admission
    pub queued: usize,
    /// Tasks transferring
    pub downloading: usize,
    /// Paused tasks
    pub paused: usize,
    /// Tasks in post-processing
    pub processing: usize,
    /// Tasks uploading
    pub uploading: usize,
    /// Slots currently held
    pub active_slots: usize,
    /// Global concurrency limit
    pub global_limit: usize,
    /// Whether admission is frozen by pause_all or resource pressure
    pub paused_all: bool,
    /// Whether new submissions are accepted
    pub accepting_new: bool,
    /// Global speed limit in bytes per second
    pub speed_limit_bps: Option<u64>,
}

/// One stream reported by ffprobe
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MediaStream {
    /// Stream index
    pub index: u32,
    /// "video", "audio", "subtitle", ...
    pub codec_type: Option<String>,
    /// Codec short name
    pub codec_name: Option<String>,
    /// Frame width for video streams
    pub width: Option<u32>,
    /// Frame height for video streams
    pub height: Option<u32>,
}

/// Media information for one file
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MediaInfo {
    /// Probed file
    pub path: PathBuf,
    /// Container format name
    pub format_name: Option<String>,
    /// Duration in seconds
    pub duration_secs: Option<f64>,
    /// Streams in the container
    pub streams: Vec<MediaStream>,
}

/// Event emitted during task lifecycle
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// Task changed state (`old_state` is None on submission)
    StateChanged {
        /// Task ID
        id: TaskId,
        /// Previous state
        old_state: Option<TaskState>,
        /// New state
        new_state: TaskState,
        /// Progress at the time of the transition
        progress: Progress,
        /// Transition time
        timestamp: DateTime<Utc>,
    },

    /// Periodic progress update
    Progress {
        /// Task ID
        id: TaskId,
        /// Current state
        state: TaskState,
        /// Progress snapshot
        progress: Progress,
    },

    /// A transient failure will be retried
    RetryScheduled {
        /// Task ID
        id: TaskId,
        /// Retry number (1-based)
        attempt: u32,
        /// Retry budget
        max_retries: u32,
        /// Backoff before the retry in milliseconds
        delay_ms: u64,
        /// Failure that triggered the retry
        reason: String,
    },

    /// A post-processing stage started
    StageStarted {
        /// Task ID
        id: TaskId,
        /// Stage name
        stage: String,
    },

    /// Media inspection finished for a file
    MediaInspected {
        /// Task ID
        id: TaskId,
        /// Probe result
        info: MediaInfo,
    },

    /// A new per-task bandwidth allotment was applied
    BandwidthAllotted {
        /// Task ID
        id: TaskId,
        /// Allotment in bytes per second (0 = unlimited)
        bps: u64,
    },

    /// Artifact handed to the destination store
    Uploaded {
        /// Task ID
        id: TaskId,
        /// Reference returned by the dispatcher
        reference: String,
    },

    /// Admission frozen
    QueuePaused,

    /// Admission resumed
    QueueResumed,

    /// Global speed limit changed
    SpeedLimitChanged {
        /// New limit in bytes per second (None = unlimited)
        limit_bps: Option<u64>,
    },

    /// Engine is shutting down
    Shutdown,
}
