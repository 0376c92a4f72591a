//! Media-extraction URLs
//!
//! A page URL is resolved to a direct media link by a [`LinkResolver`]
//! (yt-dlp by default); the transfer itself then runs on the HTTP adapter,
//! which keeps pause, resume and per-job caps.

use super::{
    BackendAdapter, BackendCapabilities, BackendHandle, BackendStatus, HttpAdapter, TaskSpec,
};
use crate::config::ExtractorConfig;
use crate::error::{Error, Result};
use crate::types::{BackendKind, Source};
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info};

const NAME: &str = "extractor";

/// Direct link behind a media page
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedLink {
    /// Direct download URL
    pub url: String,
    /// Suggested file name
    pub filename: Option<String>,
}

/// Turns an indirect media URL into a direct one
#[async_trait]
pub trait LinkResolver: Send + Sync {
    /// Resolve `url` using the given format selector
    async fn resolve(&self, url: &str, format: &str) -> Result<ResolvedLink>;
}

/// yt-dlp based resolver
pub struct YtDlpResolver {
    binary_path: Option<PathBuf>,
    default_format: String,
    timeout: Duration,
}

impl YtDlpResolver {
    /// Resolver using an explicit binary
    pub fn new(binary_path: PathBuf, default_format: impl Into<String>, timeout: Duration) -> Self {
        Self {
            binary_path: Some(binary_path),
            default_format: default_format.into(),
            timeout,
        }
    }

    /// Resolver from configuration, searching PATH when allowed
    ///
    /// A resolver without a binary fails every resolution with a permanent
    /// error rather than failing engine construction.
    pub fn from_config(config: &ExtractorConfig) -> Self {
        let binary_path = config.ytdlp_path.clone().or_else(|| {
            config
                .search_path
                .then(|| which::which("yt-dlp").ok())
                .flatten()
        });
        Self {
            binary_path,
            default_format: config.default_format.clone(),
            timeout: config.timeout,
        }
    }

    /// Whether a yt-dlp binary was found
    pub fn is_available(&self) -> bool {
        self.binary_path.is_some()
    }

    /// Format used when the task sets none
    pub fn default_format(&self) -> &str {
        &self.default_format
    }
}

/// Split yt-dlp `--get-url --get-filename` output into link and file name
///
/// URLs come first (two of them for split audio/video formats); the file
/// name is printed last.
fn parse_output(stdout: &str) -> Option<ResolvedLink> {
    let lines: Vec<&str> = stdout
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect();
    let url = lines.iter().find(|l| l.starts_with("http"))?;
    let filename = lines
        .last()
        .filter(|l| !l.starts_with("http"))
        .map(|l| l.to_string());
    Some(ResolvedLink {
        url: url.to_string(),
        filename,
    })
}

#[async_trait]
impl LinkResolver for YtDlpResolver {
    async fn resolve(&self, url: &str, format: &str) -> Result<ResolvedLink> {
        let Some(binary) = &self.binary_path else {
            return Err(Error::backend(NAME, "yt-dlp not found", false));
        };
        let format = if format.is_empty() {
            self.default_format.as_str()
        } else {
            format
        };

        let child = Command::new(binary)
            .args(["-f", format, "--no-playlist", "--get-url", "--get-filename", url])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::backend(NAME, format!("failed to run yt-dlp: {}", e), false))?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                Error::backend(
                    NAME,
                    format!("yt-dlp timed out after {}s", self.timeout.as_secs()),
                    true,
                )
            })??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let message = stderr.lines().last().unwrap_or("yt-dlp failed").trim().to_string();
            // Network trouble on the extractor side is worth another attempt
            let transient = message.contains("timed out")
                || message.contains("HTTP Error 5")
                || message.contains("HTTP Error 429");
            return Err(Error::backend(NAME, message, transient));
        }

        parse_output(&String::from_utf8_lossy(&output.stdout))
            .ok_or_else(|| Error::backend(NAME, "yt-dlp returned no URL", false))
    }
}

/// Resolves the link, then transfers it over HTTP
pub struct ExtractorAdapter {
    resolver: Arc<dyn LinkResolver>,
    http: Arc<HttpAdapter>,
}

impl ExtractorAdapter {
    /// Adapter using `resolver` in front of `http`
    pub fn new(resolver: Arc<dyn LinkResolver>, http: Arc<HttpAdapter>) -> Self {
        Self { resolver, http }
    }
}

#[async_trait]
impl BackendAdapter for ExtractorAdapter {
    fn kind(&self) -> BackendKind {
        BackendKind::Extractor
    }

    fn name(&self) -> &str {
        NAME
    }

    fn capabilities(&self) -> BackendCapabilities {
        self.http.capabilities()
    }

    async fn submit(&self, spec: &TaskSpec) -> Result<BackendHandle> {
        let Source::MediaExtract { url, format } = &spec.source else {
            return Err(Error::backend(
                NAME,
                format!("cannot extract {:?} source", spec.source.default_backend()),
                false,
            ));
        };

        let link = self
            .resolver
            .resolve(url, format.as_deref().unwrap_or_default())
            .await?;
        debug!(task_id = spec.id.0, page = %url, "link resolved");
        let handle = self
            .http
            .start(spec.id, &link.url, link.filename, &spec.download_dir)
            .await?;
        info!(task_id = spec.id.0, %handle, "extracted media transfer started");
        Ok(handle)
    }

    async fn poll(&self, handle: &BackendHandle) -> Result<BackendStatus> {
        self.http.poll(handle).await
    }

    async fn pause(&self, handle: &BackendHandle) -> Result<()> {
        self.http.pause(handle).await
    }

    async fn resume(&self, handle: &BackendHandle) -> Result<()> {
        self.http.resume(handle).await
    }

    async fn cancel(&self, handle: &BackendHandle) -> Result<()> {
        self.http.cancel(handle).await
    }

    async fn apply_bandwidth_cap(&self, handle: &BackendHandle, bps: u64) -> Result<()> {
        self.http.apply_bandwidth_cap(handle, bps).await
    }

    async fn release(&self, handle: &BackendHandle) -> Result<()> {
        self.http.release(handle).await
    }
}
