//! Transmission JSON-RPC client
//!
//! Every call is a POST of `{"method", "arguments"}`. The daemon answers 409
//! with a fresh `X-Transmission-Session-Id` until the client echoes it back;
//! the id is cached and the request replayed once.

use super::{AddTorrent, TorrentPayload, TorrentPhase, TorrentService, TorrentStatus};
use crate::backend::status_error;
use crate::config::TransmissionConfig;
use crate::error::{Error, Result};
use async_trait::async_trait;
use base64::Engine as _;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::{Value, json};
use std::path::PathBuf;
use tokio::sync::RwLock;
use tracing::debug;

const NAME: &str = "transmission";
const SESSION_HEADER: &str = "X-Transmission-Session-Id";

/// Fields requested from `torrent-get`
const STATUS_FIELDS: &[&str] = &[
    "hashString",
    "name",
    "status",
    "sizeWhenDone",
    "leftUntilDone",
    "rateDownload",
    "eta",
    "error",
    "errorString",
    "downloadDir",
    "percentDone",
];

// Transmission status codes
const STATUS_STOPPED: i64 = 0;

// Transmission error codes
const ERROR_TRACKER: i64 = 2;
const ERROR_LOCAL: i64 = 3;

/// Transmission RPC client
pub struct TransmissionClient {
    client: Client,
    config: TransmissionConfig,
    session_id: RwLock<Option<String>>,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    result: String,
    #[serde(default)]
    arguments: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcTorrent {
    hash_string: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    status: i64,
    #[serde(default)]
    size_when_done: u64,
    #[serde(default)]
    left_until_done: u64,
    #[serde(default)]
    rate_download: u64,
    #[serde(default)]
    eta: i64,
    #[serde(default)]
    error: i64,
    #[serde(default)]
    error_string: String,
    #[serde(default)]
    download_dir: String,
    #[serde(default)]
    percent_done: f64,
}

impl RpcTorrent {
    fn into_status(self) -> TorrentStatus {
        let complete = self.percent_done >= 1.0 || (self.size_when_done > 0 && self.left_until_done == 0);
        let phase = if self.error == ERROR_LOCAL || self.error == ERROR_TRACKER {
            TorrentPhase::Failed
        } else if complete {
            TorrentPhase::Complete
        } else if self.status == STATUS_STOPPED {
            TorrentPhase::Stopped
        } else {
            TorrentPhase::Downloading
        };
        let error = (phase == TorrentPhase::Failed).then(|| {
            let message = if self.error_string.is_empty() {
                format!("transmission error {}", self.error)
            } else {
                self.error_string.clone()
            };
            (message, self.error == ERROR_TRACKER)
        });
        let content_path =
            (!self.download_dir.is_empty()).then(|| PathBuf::from(&self.download_dir).join(&self.name));

        TorrentStatus {
            name: self.name,
            phase,
            bytes_done: self.size_when_done.saturating_sub(self.left_until_done),
            bytes_total: self.size_when_done,
            download_bps: self.rate_download,
            eta_secs: u64::try_from(self.eta).ok(),
            content_path,
            error,
        }
    }
}

impl TransmissionClient {
    /// Build a client for the configured endpoint
    pub fn new(config: TransmissionConfig) -> Result<Self> {
        let client = Client::builder().timeout(config.timeout).build()?;
        Ok(Self {
            client,
            config,
            session_id: RwLock::new(None),
        })
    }

    /// Issue one RPC call, performing the session handshake when asked to
    async fn rpc(&self, method: &str, arguments: Value) -> Result<Value> {
        let body = json!({ "method": method, "arguments": arguments });

        for _ in 0..2 {
            let mut request = self.client.post(&self.config.url).json(&body);
            if let Some(id) = self.session_id.read().await.as_deref() {
                request = request.header(SESSION_HEADER, id);
            }
            if let Some(username) = &self.config.username {
                request = request.basic_auth(username, self.config.password.as_deref());
            }

            let response = request.send().await?;
            let status = response.status();

            if status == StatusCode::CONFLICT {
                let id = response
                    .headers()
                    .get(SESSION_HEADER)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);
                match id {
                    Some(id) => {
                        debug!(method, "refreshing transmission session id");
                        *self.session_id.write().await = Some(id);
                        continue;
                    }
                    None => return Err(status_error(NAME, status, method)),
                }
            }
            if !status.is_success() {
                return Err(status_error(NAME, status, method));
            }

            let reply: RpcResponse = response.json().await?;
            if reply.result != "success" {
                return Err(Error::backend(
                    NAME,
                    format!("{} failed: {}", method, reply.result),
                    false,
                ));
            }
            return Ok(reply.arguments);
        }

        Err(Error::backend(
            NAME,
            format!("{}: session handshake did not converge", method),
            true,
        ))
    }

    /// Torrent ids argument for a single hash
    fn ids(key: &str) -> Value {
        json!([key])
    }
}

#[async_trait]
impl TorrentService for TransmissionClient {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn add(&self, request: AddTorrent) -> Result<String> {
        let mut arguments = match request.payload {
            TorrentPayload::Magnet(uri) => json!({ "filename": uri }),
            TorrentPayload::File { data, .. } => json!({
                "metainfo": base64::engine::general_purpose::STANDARD.encode(data)
            }),
        };
        if let Some(dir) = &self.config.download_dir {
            arguments["download-dir"] = json!(dir.to_string_lossy());
        }
        let mut labels = vec![request.tag];
        labels.extend(request.category);
        arguments["labels"] = json!(labels);

        let reply = self.rpc("torrent-add", arguments).await?;
        let added = reply
            .get("torrent-added")
            .or_else(|| reply.get("torrent-duplicate"));
        added
            .and_then(|t| t.get("hashString"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| Error::backend(NAME, "torrent-add returned no hash", false))
    }

    async fn status(&self, key: &str) -> Result<Option<TorrentStatus>> {
        let reply = self
            .rpc(
                "torrent-get",
                json!({ "ids": Self::ids(key), "fields": STATUS_FIELDS }),
            )
            .await?;
        let torrents: Vec<RpcTorrent> =
            serde_json::from_value(reply.get("torrents").cloned().unwrap_or(Value::Array(vec![])))?;
        Ok(torrents
            .into_iter()
            .find(|t| t.hash_string.eq_ignore_ascii_case(key))
            .map(RpcTorrent::into_status))
    }

    async fn stop(&self, key: &str) -> Result<()> {
        self.rpc("torrent-stop", json!({ "ids": Self::ids(key) }))
            .await
            .map(|_| ())
    }

    async fn start(&self, key: &str) -> Result<()> {
        self.rpc("torrent-start", json!({ "ids": Self::ids(key) }))
            .await
            .map(|_| ())
    }

    async fn remove(&self, key: &str, delete_data: bool) -> Result<()> {
        // Unknown ids are ignored by the daemon
        self.rpc(
            "torrent-remove",
            json!({ "ids": Self::ids(key), "delete-local-data": delete_data }),
        )
        .await
        .map(|_| ())
    }

    async fn set_download_limit(&self, key: &str, bps: u64) -> Result<()> {
        // Transmission limits are in kB/s
        let arguments = if bps == 0 {
            json!({ "ids": Self::ids(key), "downloadLimited": false })
        } else {
            json!({
                "ids": Self::ids(key),
                "downloadLimited": true,
                "downloadLimit": bps.div_ceil(1000),
            })
        };
        self.rpc("torrent-set", arguments).await.map(|_| ())
    }
}
