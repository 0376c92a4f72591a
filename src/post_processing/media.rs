//! Media inspection stage backed by ffprobe

use crate::config::ToolsConfig;
use crate::error::{Error, Result};
use crate::extraction::collect_files;
use crate::types::{MediaInfo, MediaStream};
use async_trait::async_trait;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tokio::process::Command;

/// Probes a media file for container and stream information
#[async_trait]
pub trait MediaProbe: Send + Sync {
    /// Inspect one file
    async fn probe(&self, path: &Path) -> Result<MediaInfo>;

    /// Name used in logs
    fn name(&self) -> &'static str;
}

/// [`MediaProbe`] running the external `ffprobe` binary
pub struct FfprobeProbe {
    binary_path: PathBuf,
}

impl FfprobeProbe {
    /// Use an explicit binary path
    pub fn new(binary_path: PathBuf) -> Self {
        Self { binary_path }
    }

    /// Find `ffprobe` in PATH
    pub fn from_path() -> Option<Self> {
        which::which("ffprobe").ok().map(Self::new)
    }

    /// Resolve the probe from tool settings: the configured path first, then PATH
    pub fn from_config(tools: &ToolsConfig) -> Option<Self> {
        match &tools.ffprobe_path {
            Some(path) => Some(Self::new(path.clone())),
            None if tools.search_path => Self::from_path(),
            None => None,
        }
    }
}

#[derive(Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
    format: Option<ProbeFormat>,
}

#[derive(Deserialize)]
struct ProbeStream {
    index: u32,
    codec_type: Option<String>,
    codec_name: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
}

#[derive(Deserialize)]
struct ProbeFormat {
    format_name: Option<String>,
    // ffprobe prints numbers as strings
    duration: Option<String>,
}

/// Parse `ffprobe -print_format json -show_format -show_streams` output
pub(crate) fn parse_probe_output(path: &Path, stdout: &[u8]) -> Result<MediaInfo> {
    let output: ProbeOutput = serde_json::from_slice(stdout)?;
    let (format_name, duration_secs) = match output.format {
        Some(format) => (
            format.format_name,
            format.duration.and_then(|d| d.trim().parse::<f64>().ok()),
        ),
        None => (None, None),
    };
    Ok(MediaInfo {
        path: path.to_path_buf(),
        format_name,
        duration_secs,
        streams: output
            .streams
            .into_iter()
            .map(|s| MediaStream {
                index: s.index,
                codec_type: s.codec_type,
                codec_name: s.codec_name,
                width: s.width,
                height: s.height,
            })
            .collect(),
    })
}

#[async_trait]
impl MediaProbe for FfprobeProbe {
    async fn probe(&self, path: &Path) -> Result<MediaInfo> {
        let output = Command::new(&self.binary_path)
            .args(["-v", "quiet", "-print_format", "json", "-show_format", "-show_streams"])
            .arg(path)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| Error::ExternalTool(format!("failed to execute ffprobe: {}", e)))?;

        if !output.status.success() {
            return Err(Error::ExternalTool(format!(
                "ffprobe exited with {} for {}",
                output.status,
                path.display()
            )));
        }
        parse_probe_output(path, &output.stdout)
    }

    fn name(&self) -> &'static str {
        "ffprobe"
    }
}

/// Media files under `artifact` whose extension is in `extensions`
pub(crate) fn media_files(artifact: &Path, extensions: &[String]) -> Result<Vec<PathBuf>> {
    let is_media = |path: &Path| {
        path.extension()
            .map(|ext| ext.to_string_lossy().to_lowercase())
            .is_some_and(|ext| extensions.iter().any(|e| e.eq_ignore_ascii_case(&ext)))
    };
    if artifact.is_dir() {
        Ok(collect_files(artifact)?
            .into_iter()
            .filter(|p| is_media(p))
            .collect())
    } else if is_media(artifact) {
        Ok(vec![artifact.to_path_buf()])
    } else {
        Ok(Vec::new())
    }
}
