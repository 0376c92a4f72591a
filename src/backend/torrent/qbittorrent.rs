//! qBittorrent WebUI client
//!
//! Sessions are cookie based: the client logs in lazily, and a 403 on any
//! call drops the session, logs in again and replays the request once.
//! Torrents are added with a per-task tag which doubles as the lookup key,
//! since the WebUI does not return the hash of an added torrent.

use super::{AddTorrent, TorrentPayload, TorrentPhase, TorrentService, TorrentStatus};
use crate::backend::status_error;
use crate::config::QBittorrentConfig;
use crate::error::{Error, Result};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode, multipart};
use serde::Deserialize;
use std::path::PathBuf;
use tokio::sync::RwLock;
use tracing::{debug, warn};

const NAME: &str = "qbittorrent";

/// qBittorrent reports this ETA for torrents that will never finish
const ETA_INFINITY: i64 = 8_640_000;

/// qBittorrent WebUI client
pub struct QBittorrentClient {
    client: Client,
    config: QBittorrentConfig,
    logged_in: RwLock<bool>,
}

#[derive(Debug, Deserialize)]
struct QbTorrent {
    hash: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    state: String,
    #[serde(default)]
    progress: f64,
    #[serde(default)]
    size: i64,
    #[serde(default)]
    completed: i64,
    #[serde(default)]
    dlspeed: i64,
    #[serde(default)]
    eta: i64,
    #[serde(default)]
    content_path: String,
}

impl QbTorrent {
    fn into_status(self) -> TorrentStatus {
        let phase = parse_state(&self.state, self.progress);
        let error = (phase == TorrentPhase::Failed)
            .then(|| (format!("qbittorrent reports state {}", self.state), false));
        TorrentStatus {
            name: self.name,
            phase,
            bytes_done: self.completed.max(0) as u64,
            bytes_total: self.size.max(0) as u64,
            download_bps: self.dlspeed.max(0) as u64,
            eta_secs: (self.eta > 0 && self.eta < ETA_INFINITY).then_some(self.eta as u64),
            content_path: (!self.content_path.is_empty()).then(|| PathBuf::from(self.content_path)),
            error,
        }
    }
}

/// Map a WebUI state string onto a phase
fn parse_state(state: &str, progress: f64) -> TorrentPhase {
    match state {
        "error" | "missingFiles" => TorrentPhase::Failed,
        "uploading" | "forcedUP" | "stalledUP" | "queuedUP" | "pausedUP" | "stoppedUP"
        | "checkingUP" => TorrentPhase::Complete,
        _ if progress >= 1.0 => TorrentPhase::Complete,
        "pausedDL" | "stoppedDL" => TorrentPhase::Stopped,
        _ => TorrentPhase::Downloading,
    }
}

impl QBittorrentClient {
    /// Build a client with its own cookie jar
    pub fn new(config: QBittorrentConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .cookie_store(true)
            .build()?;
        Ok(Self {
            client,
            config,
            logged_in: RwLock::new(false),
        })
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}{}", self.config.url.trim_end_matches('/'), endpoint)
    }

    async fn login(&self) -> Result<()> {
        let params = [
            ("username", self.config.username.as_str()),
            ("password", self.config.password.as_str()),
        ];
        let response = self
            .client
            .post(self.url("/api/v2/auth/login"))
            .form(&params)
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await.unwrap_or_default();

        if status.is_success() && body.contains("Ok.") {
            debug!("qbittorrent login successful");
            *self.logged_in.write().await = true;
            Ok(())
        } else if status.is_server_error() {
            Err(status_error(NAME, status, "login"))
        } else {
            Err(Error::backend(NAME, "login rejected: invalid credentials", false))
        }
    }

    /// Send an authenticated request built by `build`, re-authenticating once on 403
    async fn send<F>(&self, context: &str, build: F) -> Result<Response>
    where
        F: Fn() -> Result<RequestBuilder>,
    {
        if !*self.logged_in.read().await {
            self.login().await?;
        }

        let response = build()?.send().await?;
        let response = if response.status() == StatusCode::FORBIDDEN {
            warn!("qbittorrent session expired, re-authenticating");
            *self.logged_in.write().await = false;
            self.login().await?;
            build()?.send().await?
        } else {
            response
        };

        if response.status().is_success() {
            Ok(response)
        } else {
            Err(status_error(NAME, response.status(), context))
        }
    }

    async fn post_form(&self, endpoint: &str, params: &[(&str, &str)]) -> Result<Response> {
        self.send(endpoint, || Ok(self.client.post(self.url(endpoint)).form(params)))
            .await
    }

    /// Look up the torrent carrying `tag`
    async fn find(&self, tag: &str) -> Result<Option<QbTorrent>> {
        let endpoint = format!("/api/v2/torrents/info?tag={}", urlencoding::encode(tag));
        let response = self
            .send("torrents/info", || Ok(self.client.get(self.url(&endpoint))))
            .await?;
        let torrents: Vec<QbTorrent> = response.json().await?;
        Ok(torrents.into_iter().next())
    }

    async fn hash_of(&self, tag: &str) -> Result<String> {
        self.find(tag)
            .await?
            .map(|t| t.hash.to_lowercase())
            .ok_or_else(|| Error::backend(NAME, format!("no torrent tagged {}", tag), false))
    }

    /// POST to `primary`, falling back to `legacy` on servers that predate it
    async fn post_with_fallback(&self, primary: &str, legacy: &str, hash: &str) -> Result<()> {
        match self.post_form(primary, &[("hashes", hash)]).await {
            Err(Error::Backend { message, .. }) if message.contains("404") => {
                self.post_form(legacy, &[("hashes", hash)]).await.map(|_| ())
            }
            other => other.map(|_| ()),
        }
    }
}

#[async_trait]
impl TorrentService for QBittorrentClient {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn add(&self, request: AddTorrent) -> Result<String> {
        let build_form = || -> Result<multipart::Form> {
            let mut form = match &request.payload {
                TorrentPayload::Magnet(uri) => multipart::Form::new().text("urls", uri.clone()),
                TorrentPayload::File { filename, data } => {
                    let part = multipart::Part::bytes(data.clone())
                        .file_name(filename.clone())
                        .mime_str("application/x-bittorrent")?;
                    multipart::Form::new().part("torrents", part)
                }
            };
            form = form.text("tags", request.tag.clone());
            if let Some(path) = &self.config.save_path {
                form = form.text("savepath", path.to_string_lossy().into_owned());
            }
            if let Some(category) = &request.category {
                form = form.text("category", category.clone());
            }
            Ok(form)
        };

        let url = self.url("/api/v2/torrents/add");
        let response = self
            .send("torrents/add", || Ok(self.client.post(&url).multipart(build_form()?)))
            .await?;
        let body = response.text().await.unwrap_or_default();
        if body.contains("Fails.") {
            return Err(Error::backend(NAME, "torrent rejected by client", false));
        }
        Ok(request.tag)
    }

    async fn status(&self, key: &str) -> Result<Option<TorrentStatus>> {
        Ok(self.find(key).await?.map(QbTorrent::into_status))
    }

    async fn stop(&self, key: &str) -> Result<()> {
        let hash = self.hash_of(key).await?;
        self.post_with_fallback("/api/v2/torrents/stop", "/api/v2/torrents/pause", &hash)
            .await
    }

    async fn start(&self, key: &str) -> Result<()> {
        let hash = self.hash_of(key).await?;
        self.post_with_fallback("/api/v2/torrents/start", "/api/v2/torrents/resume", &hash)
            .await
    }

    async fn remove(&self, key: &str, delete_data: bool) -> Result<()> {
        let Some(torrent) = self.find(key).await? else {
            return Ok(());
        };
        let hash = torrent.hash.to_lowercase();
        let delete = if delete_data { "true" } else { "false" };
        self.post_form(
            "/api/v2/torrents/delete",
            &[("hashes", &hash), ("deleteFiles", delete)],
        )
        .await
        .map(|_| ())
    }

    async fn set_download_limit(&self, key: &str, bps: u64) -> Result<()> {
        let hash = self.hash_of(key).await?;
        let limit = bps.to_string();
        self.post_form(
            "/api/v2/torrents/setDownloadLimit",
            &[("hashes", &hash), ("limit", &limit)],
        )
        .await
        .map(|_| ())
    }
}
