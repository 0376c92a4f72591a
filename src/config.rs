//! Configuration types for transfer-engine

use crate::error::{Error, Result};
use crate::types::BackendKind;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration for [`TransferEngine`](crate::TransferEngine)
///
/// Loading the configuration (files, environment) is left to the embedding
/// application; every section has a usable default.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// Scheduling, concurrency and bandwidth settings
    #[serde(default)]
    pub engine: EngineConfig,

    /// Backoff settings shared by every retry loop
    #[serde(default)]
    pub retry: RetryConfig,

    /// Backend service endpoints
    #[serde(default)]
    pub backends: BackendsConfig,

    /// Post-processing tools
    #[serde(default)]
    pub processing: ProcessingConfig,

    /// Local upload dispatcher settings
    #[serde(default)]
    pub upload: UploadConfig,

    /// Checkpoint store
    #[serde(default)]
    pub persistence: PersistenceConfig,
}

impl Config {
    /// Check the configuration for values the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.engine.max_concurrent == 0 {
            return Err(Error::config(
                "max_concurrent must be at least 1",
                "engine.max_concurrent",
            ));
        }
        for (kind, limit) in &self.engine.per_backend_limits {
            if *limit == 0 {
                return Err(Error::config(
                    format!("per-backend limit for {} must be at least 1", kind),
                    format!("engine.per_backend_limits.{}", kind),
                ));
            }
        }
        if self.engine.history_capacity == 0 {
            return Err(Error::config(
                "history_capacity must be at least 1",
                "engine.history_capacity",
            ));
        }
        if self.engine.poll_interval.is_zero() {
            return Err(Error::config(
                "poll_interval must be greater than zero",
                "engine.poll_interval",
            ));
        }
        if self.retry.backoff_multiplier < 1.0 {
            return Err(Error::config(
                "backoff_multiplier must be >= 1.0",
                "retry.backoff_multiplier",
            ));
        }
        if self.backends.transmission.is_some() && self.backends.qbittorrent.is_some() {
            return Err(Error::config(
                "configure either transmission or qbittorrent, not both",
                "backends.qbittorrent",
            ));
        }

        let urls = [
            self.backends
                .transmission
                .as_ref()
                .map(|c| (c.url.as_str(), "backends.transmission.url")),
            self.backends
                .qbittorrent
                .as_ref()
                .map(|c| (c.url.as_str(), "backends.qbittorrent.url")),
            self.backends
                .sabnzbd
                .as_ref()
                .map(|c| (c.url.as_str(), "backends.sabnzbd.url")),
            self.backends
                .cloud
                .as_ref()
                .map(|c| (c.url.as_str(), "backends.cloud.url")),
        ];
        for (value, key) in urls.into_iter().flatten() {
            if let Err(e) = url::Url::parse(value) {
                return Err(Error::config(format!("invalid URL {}: {}", value, e), key));
            }
        }

        Ok(())
    }
}

/// Scheduling and concurrency settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Directory for in-progress HTTP downloads (one subdirectory per task)
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,

    /// Maximum tasks holding a slot at once (default: 3)
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// Optional per-backend slot limits
    #[serde(default)]
    pub per_backend_limits: HashMap<BackendKind, usize>,

    /// How often the status poller queries a backend (default: 2 seconds)
    #[serde(default = "default_poll_interval", with = "duration_ms_serde")]
    pub poll_interval: Duration,

    /// Poll interval multiplier for backends that cannot be throttled while a global cap is set
    #[serde(default = "default_congestion_factor")]
    pub congestion_factor: u32,

    /// Safety tick for the admission loop (default: 5 seconds)
    #[serde(default = "default_admission_tick", with = "duration_ms_serde")]
    pub admission_tick: Duration,

    /// Number of finished tasks kept in the history ring buffer (default: 200)
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,

    /// Retry budget for tasks that do not set one (default: 3)
    #[serde(default = "default_max_retries")]
    pub default_max_retries: u32,

    /// Global bandwidth cap in bytes per second (None = unlimited)
    #[serde(default)]
    pub global_bandwidth_bps: Option<u64>,

    /// What happens when a more urgent task waits for a full queue
    #[serde(default)]
    pub preemption: PreemptionPolicy,

    /// How long shutdown waits for workers to stop (default: 30 seconds)
    #[serde(default = "default_shutdown_timeout", with = "duration_ms_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            work_dir: default_work_dir(),
            max_concurrent: default_max_concurrent(),
            per_backend_limits: HashMap::new(),
            poll_interval: default_poll_interval(),
            congestion_factor: default_congestion_factor(),
            admission_tick: default_admission_tick(),
            history_capacity: default_history_capacity(),
            default_max_retries: default_max_retries(),
            global_bandwidth_bps: None,
            preemption: PreemptionPolicy::default(),
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

/// Preemption policy
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreemptionPolicy {
    /// Running tasks are never displaced (default)
    #[default]
    Disabled,
    /// Requeue the least urgent downloading task when a strictly more urgent one waits
    RequeueLowest,
}

/// Retry configuration for transient failures
///
/// The number of attempts is the task's own retry budget; this only shapes the delays.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Initial delay before first retry (default: 1 second)
    #[serde(default = "default_initial_delay", with = "duration_ms_serde")]
    pub initial_delay: Duration,

    /// Maximum delay between retries (default: 60 seconds)
    #[serde(default = "default_max_delay", with = "duration_ms_serde")]
    pub max_delay: Duration,

    /// Multiplier for exponential backoff (default: 2.0)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Add random jitter to delays (default: true)
    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: true,
        }
    }
}

/// Backend service endpoints
///
/// HTTP and the link extractor are always available. Service-backed
/// variants exist only when their section is present.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct BackendsConfig {
    /// In-process HTTP downloader
    #[serde(default)]
    pub http: HttpConfig,

    /// Transmission RPC endpoint
    #[serde(default)]
    pub transmission: Option<TransmissionConfig>,

    /// qBittorrent WebUI endpoint
    #[serde(default)]
    pub qbittorrent: Option<QBittorrentConfig>,

    /// SABnzbd endpoint
    #[serde(default)]
    pub sabnzbd: Option<SabnzbdConfig>,

    /// Cloud retrieval service endpoint
    #[serde(default)]
    pub cloud: Option<CloudConfig>,

    /// Link resolver for media-extraction URLs
    #[serde(default)]
    pub extractor: ExtractorConfig,
}

/// HTTP downloader settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HttpConfig {
    /// User-Agent header sent with every request
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// TCP connect timeout (default: 30 seconds)
    #[serde(default = "default_connect_timeout", with = "duration_ms_serde")]
    pub connect_timeout: Duration,

    /// Free space kept on the download volume in addition to the file size
    #[serde(default = "default_min_free_space")]
    pub min_free_space: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            user_agent: default_user_agent(),
            connect_timeout: default_connect_timeout(),
            min_free_space: default_min_free_space(),
        }
    }
}

/// Transmission RPC settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransmissionConfig {
    /// RPC endpoint (e.g. `http://localhost:9091/transmission/rpc`)
    pub url: String,

    /// Basic auth username
    #[serde(default)]
    pub username: Option<String>,

    /// Basic auth password
    #[serde(default)]
    pub password: Option<String>,

    /// Download directory as seen by the daemon (daemon default when None)
    #[serde(default)]
    pub download_dir: Option<PathBuf>,

    /// Request timeout (default: 30 seconds)
    #[serde(default = "default_rpc_timeout", with = "duration_ms_serde")]
    pub timeout: Duration,
}

/// qBittorrent WebUI settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QBittorrentConfig {
    /// WebUI base URL (e.g. `http://localhost:8080`)
    pub url: String,

    /// WebUI username
    pub username: String,

    /// WebUI password
    pub password: String,

    /// Save path as seen by the client (client default when None)
    #[serde(default)]
    pub save_path: Option<PathBuf>,

    /// Request timeout (default: 30 seconds)
    #[serde(default = "default_rpc_timeout", with = "duration_ms_serde")]
    pub timeout: Duration,
}

/// SABnzbd settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SabnzbdConfig {
    /// Base URL (e.g. `http://localhost:8085`)
    pub url: String,

    /// API key
    pub api_key: String,

    /// Category applied when the task has none
    #[serde(default)]
    pub default_category: Option<String>,

    /// Request timeout (default: 30 seconds)
    #[serde(default = "default_rpc_timeout", with = "duration_ms_serde")]
    pub timeout: Duration,
}

/// Cloud retrieval service settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CloudConfig {
    /// API base URL; jobs live under `{url}/jobs`
    pub url: String,

    /// Bearer token
    #[serde(default)]
    pub token: Option<String>,

    /// Request timeout (default: 30 seconds)
    #[serde(default = "default_rpc_timeout", with = "duration_ms_serde")]
    pub timeout: Duration,
}

/// Link resolver settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExtractorConfig {
    /// Path to yt-dlp (auto-detected if None)
    #[serde(default)]
    pub ytdlp_path: Option<PathBuf>,

    /// Whether to search PATH for yt-dlp if no explicit path is set (default: true)
    #[serde(default = "default_true")]
    pub search_path: bool,

    /// Format selector used when the task sets none (default: "best")
    #[serde(default = "default_format")]
    pub default_format: String,

    /// Resolver timeout (default: 60 seconds)
    #[serde(default = "default_resolve_timeout", with = "duration_ms_serde")]
    pub timeout: Duration,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            ytdlp_path: None,
            search_path: true,
            default_format: default_format(),
            timeout: default_resolve_timeout(),
        }
    }
}

/// Post-processing settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProcessingConfig {
    /// External tool discovery
    #[serde(default)]
    pub tools: ToolsConfig,

    /// File extensions probed by the media inspection stage
    #[serde(default = "default_media_extensions")]
    pub media_extensions: Vec<String>,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            tools: ToolsConfig::default(),
            media_extensions: default_media_extensions(),
        }
    }
}

/// External tool paths
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Path to ffprobe executable (auto-detected if None)
    #[serde(default)]
    pub ffprobe_path: Option<PathBuf>,

    /// Whether to search PATH for external binaries if explicit paths not set (default: true)
    #[serde(default = "default_true")]
    pub search_path: bool,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            ffprobe_path: None,
            search_path: true,
        }
    }
}

/// Local upload dispatcher settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UploadConfig {
    /// Directory finished artifacts are moved into
    #[serde(default = "default_upload_root")]
    pub root: PathBuf,

    /// What to do when the target already exists
    #[serde(default)]
    pub file_collision: FileCollisionAction,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            root: default_upload_root(),
            file_collision: FileCollisionAction::default(),
        }
    }
}

/// File collision handling
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileCollisionAction {
    /// Append (1), (2), etc. to filename (default)
    #[default]
    Rename,
    /// Overwrite existing file
    Overwrite,
    /// Skip the file
    Skip,
}

/// Checkpoint store settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// SQLite database path
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
        }
    }
}

fn default_work_dir() -> PathBuf {
    PathBuf::from("./work")
}

fn default_upload_root() -> PathBuf {
    PathBuf::from("./completed")
}

fn default_database_path() -> PathBuf {
    PathBuf::from("./transfer_engine.db")
}

fn default_max_concurrent() -> usize {
    3
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(2)
}

fn default_congestion_factor() -> u32 {
    2
}

fn default_admission_tick() -> Duration {
    Duration::from_secs(5)
}

fn default_history_capacity() -> usize {
    200
}

fn default_max_retries() -> u32 {
    3
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_initial_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(60)
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_true() -> bool {
    true
}

fn default_user_agent() -> String {
    format!("transfer-engine/{}", env!("CARGO_PKG_VERSION"))
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_min_free_space() -> u64 {
    100 * 1024 * 1024
}

fn default_rpc_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_format() -> String {
    "best".to_string()
}

fn default_resolve_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_media_extensions() -> Vec<String> {
    [
        "mkv", "mp4", "m4v", "avi", "mov", "webm", "ts", "mp3", "m4a", "flac", "ogg", "opus",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

// Duration serialization helper (milliseconds)
mod duration_ms_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
