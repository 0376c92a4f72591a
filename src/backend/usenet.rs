//! SABnzbd backend
//!
//! Jobs are added with `addurl`/`addfile` and tracked by their `nzo_id`. A
//! job is looked up in the queue first and then in the history, which is
//! where SABnzbd keeps finished and failed jobs. SABnzbd can pause a single
//! job but has no per-job speed limit.

use super::{
    BackendAdapter, BackendCapabilities, BackendHandle, BackendStatus, TaskSpec, status_error,
};
use crate::config::SabnzbdConfig;
use crate::error::{Error, Result};
use crate::types::{BackendKind, Progress, Source};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, multipart};
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use std::path::PathBuf;
use tracing::{debug, info};

const NAME: &str = "sabnzbd";

/// SABnzbd job adapter
pub struct UsenetAdapter {
    client: Client,
    config: SabnzbdConfig,
}

#[derive(Debug, Deserialize)]
struct AddResponse {
    #[serde(default)]
    status: bool,
    #[serde(default)]
    nzo_ids: Vec<String>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct QueueResponse {
    queue: Queue,
}

#[derive(Debug, Deserialize)]
struct Queue {
    #[serde(default, deserialize_with = "lenient_f64")]
    kbpersec: f64,
    #[serde(default)]
    slots: Vec<QueueSlot>,
}

#[derive(Debug, Deserialize)]
struct QueueSlot {
    nzo_id: String,
    #[serde(default)]
    status: String,
    #[serde(default, deserialize_with = "lenient_f64")]
    mb: f64,
    #[serde(default, deserialize_with = "lenient_f64")]
    mbleft: f64,
    #[serde(default)]
    timeleft: String,
}

#[derive(Debug, Deserialize)]
struct HistoryResponse {
    history: History,
}

#[derive(Debug, Deserialize)]
struct History {
    #[serde(default)]
    slots: Vec<HistorySlot>,
}

#[derive(Debug, Deserialize)]
struct HistorySlot {
    nzo_id: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    storage: Option<String>,
    #[serde(default)]
    fail_message: String,
    #[serde(default, deserialize_with = "lenient_f64")]
    bytes: f64,
}

/// SABnzbd reports numbers as strings in most places
fn lenient_f64<'de, D>(deserializer: D) -> std::result::Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::Number(n) => n.as_f64().unwrap_or(0.0),
        Value::String(s) => s.trim().parse().unwrap_or(0.0),
        _ => 0.0,
    })
}

/// Parse SABnzbd's `H:MM:SS` (or `D:HH:MM:SS`) time left
fn parse_timeleft(value: &str) -> Option<u64> {
    let mut secs = 0u64;
    let parts: Vec<&str> = value.split(':').collect();
    if parts.len() < 2 {
        return None;
    }
    let factors = [1u64, 60, 3_600, 86_400];
    for (part, factor) in parts.iter().rev().zip(factors) {
        secs += part.trim().parse::<u64>().ok()? * factor;
    }
    Some(secs)
}

const MB: f64 = 1024.0 * 1024.0;

impl QueueSlot {
    fn into_status(self, kbpersec: f64) -> BackendStatus {
        let downloading = self.status == "Downloading";
        let progress = Progress {
            bytes_done: ((self.mb - self.mbleft).max(0.0) * MB) as u64,
            bytes_total: (self.mb * MB) as u64,
            speed_bps: if downloading { (kbpersec * 1024.0) as u64 } else { 0 },
            eta_secs: if downloading { parse_timeleft(&self.timeleft) } else { None },
        };
        if self.status == "Paused" {
            BackendStatus::paused(progress)
        } else {
            BackendStatus::active(progress)
        }
    }
}

impl HistorySlot {
    fn into_status(self) -> BackendStatus {
        let bytes = self.bytes.max(0.0) as u64;
        let progress = Progress {
            bytes_done: bytes,
            bytes_total: bytes,
            speed_bps: 0,
            eta_secs: None,
        };
        match self.status.as_str() {
            "Completed" => BackendStatus::done(
                progress,
                self.storage.filter(|s| !s.is_empty()).map(PathBuf::from),
            ),
            "Failed" => {
                let message = if self.fail_message.is_empty() {
                    "job failed".to_string()
                } else {
                    self.fail_message
                };
                BackendStatus::errored(progress, message, false)
            }
            // Verifying, Repairing, Extracting, Moving, ...
            _ => BackendStatus::active(progress),
        }
    }
}

impl UsenetAdapter {
    /// Build the adapter for a SABnzbd endpoint
    pub fn new(config: &SabnzbdConfig) -> Result<Self> {
        let client = Client::builder().timeout(config.timeout).build()?;
        Ok(Self {
            client,
            config: config.clone(),
        })
    }

    fn api_url(&self) -> String {
        format!("{}/api", self.config.url.trim_end_matches('/'))
    }

    fn get(&self, params: &[(&str, &str)]) -> RequestBuilder {
        self.client
            .get(self.api_url())
            .query(&[("apikey", self.config.api_key.as_str()), ("output", "json")])
            .query(params)
    }

    async fn call(&self, context: &str, request: RequestBuilder) -> Result<Value> {
        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(status_error(NAME, response.status(), context));
        }
        let body: Value = response.json().await?;
        if body.get("status").and_then(Value::as_bool) == Some(false) {
            let message = body
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("request rejected");
            return Err(Error::backend(NAME, format!("{}: {}", context, message), false));
        }
        Ok(body)
    }

    async fn queue_slot(&self, nzo_id: &str) -> Result<Option<BackendStatus>> {
        let body = self
            .call("queue", self.get(&[("mode", "queue"), ("nzo_ids", nzo_id)]))
            .await?;
        let queue: QueueResponse = serde_json::from_value(body)?;
        let kbpersec = queue.queue.kbpersec;
        Ok(queue
            .queue
            .slots
            .into_iter()
            .find(|s| s.nzo_id == nzo_id)
            .map(|s| s.into_status(kbpersec)))
    }

    async fn history_slot(&self, nzo_id: &str) -> Result<Option<BackendStatus>> {
        let body = self
            .call("history", self.get(&[("mode", "history"), ("nzo_ids", nzo_id)]))
            .await?;
        let history: HistoryResponse = serde_json::from_value(body)?;
        Ok(history
            .history
            .slots
            .into_iter()
            .find(|s| s.nzo_id == nzo_id)
            .map(HistorySlot::into_status))
    }

    async fn queue_action(&self, action: &str, handle: &BackendHandle) -> Result<()> {
        self.call(
            action,
            self.get(&[("mode", "queue"), ("name", action), ("value", handle.as_str())]),
        )
        .await
        .map(|_| ())
    }
}

#[async_trait]
impl BackendAdapter for UsenetAdapter {
    fn kind(&self) -> BackendKind {
        BackendKind::Usenet
    }

    fn name(&self) -> &str {
        NAME
    }

    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities {
            pause: true,
            bandwidth_cap: false,
        }
    }

    async fn submit(&self, spec: &TaskSpec) -> Result<BackendHandle> {
        let category = spec
            .category
            .clone()
            .or_else(|| self.config.default_category.clone())
            .unwrap_or_default();

        let request = match &spec.source {
            Source::NzbUrl { url } => self.get(&[
                ("mode", "addurl"),
                ("name", url.as_str()),
                ("nzbname", spec.name.as_str()),
                ("cat", category.as_str()),
            ]),
            Source::NzbFile { name, content } => {
                let filename = if name.ends_with(".nzb") {
                    name.clone()
                } else {
                    format!("{}.nzb", name)
                };
                let part = multipart::Part::text(content.clone())
                    .file_name(filename)
                    .mime_str("application/x-nzb")?;
                self.client
                    .post(self.api_url())
                    .query(&[
                        ("apikey", self.config.api_key.as_str()),
                        ("output", "json"),
                        ("mode", "addfile"),
                        ("nzbname", spec.name.as_str()),
                        ("cat", category.as_str()),
                    ])
                    .multipart(multipart::Form::new().part("name", part))
            }
            other => {
                return Err(Error::backend(
                    NAME,
                    format!("cannot add {:?} source", other.default_backend()),
                    false,
                ));
            }
        };

        let body = self.call("add", request).await?;
        let added: AddResponse = serde_json::from_value(body)?;
        match added.nzo_ids.into_iter().next() {
            Some(nzo_id) if added.status => {
                info!(task_id = spec.id.0, nzo_id, "NZB added to SABnzbd");
                Ok(BackendHandle::new(nzo_id))
            }
            _ => Err(Error::backend(
                NAME,
                added
                    .error
                    .unwrap_or_else(|| "SABnzbd returned no job id".to_string()),
                false,
            )),
        }
    }

    async fn poll(&self, handle: &BackendHandle) -> Result<BackendStatus> {
        if let Some(status) = self.queue_slot(handle.as_str()).await? {
            return Ok(status);
        }
        if let Some(status) = self.history_slot(handle.as_str()).await? {
            return Ok(status);
        }
        Ok(BackendStatus::missing())
    }

    async fn pause(&self, handle: &BackendHandle) -> Result<()> {
        self.queue_action("pause", handle).await
    }

    async fn resume(&self, handle: &BackendHandle) -> Result<()> {
        self.queue_action("resume", handle).await
    }

    async fn cancel(&self, handle: &BackendHandle) -> Result<()> {
        // The job is in exactly one of queue or history; deleting an unknown id succeeds
        for mode in ["queue", "history"] {
            self.call(
                "delete",
                self.get(&[
                    ("mode", mode),
                    ("name", "delete"),
                    ("value", handle.as_str()),
                    ("del_files", "1"),
                ]),
            )
            .await?;
        }
        debug!(%handle, "SABnzbd job deleted");
        Ok(())
    }
}
