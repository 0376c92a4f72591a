//! Cloud retrieval backend
//!
//! A remote service fetches the file into its own storage; the job is driven
//! through a small REST API:
//!
//! - `POST {url}/jobs` with `{"reference": ...}` returns `{"id": ...}`
//! - `GET {url}/jobs/{id}` returns the job status
//! - `DELETE {url}/jobs/{id}` removes the job
//!
//! Once the remote job completes, the produced file is pulled into the task's
//! download directory through the HTTP adapter. Neither pause nor per-job
//! caps are available on the remote side.

use super::{
    BackendAdapter, BackendCapabilities, BackendHandle, BackendState, BackendStatus, HttpAdapter,
    TaskSpec, status_error,
};
use crate::config::CloudConfig;
use crate::error::{Error, Result};
use crate::types::{BackendKind, Progress, Source, TaskId};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const NAME: &str = "cloud";

/// Remote retrieval adapter
pub struct CloudAdapter {
    client: Client,
    config: CloudConfig,
    http: Arc<HttpAdapter>,
    jobs: Mutex<HashMap<BackendHandle, CloudJob>>,
}

struct CloudJob {
    task: TaskId,
    dir: PathBuf,
    /// Local pull of the finished file
    local: Option<BackendHandle>,
}

#[derive(Debug, Deserialize)]
struct CreatedJob {
    id: String,
}

#[derive(Debug, Deserialize)]
struct RemoteJob {
    status: String,
    #[serde(default)]
    bytes_done: u64,
    #[serde(default)]
    bytes_total: u64,
    #[serde(default)]
    speed_bps: u64,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    retryable: bool,
    #[serde(default)]
    download_url: Option<String>,
    #[serde(default)]
    file_name: Option<String>,
}

impl CloudAdapter {
    /// Build the adapter; finished files are pulled through `http`
    pub fn new(config: &CloudConfig, http: Arc<HttpAdapter>) -> Result<Self> {
        let client = Client::builder().timeout(config.timeout).build()?;
        Ok(Self {
            client,
            config: config.clone(),
            http,
            jobs: Mutex::new(HashMap::new()),
        })
    }

    fn jobs_url(&self) -> String {
        format!("{}/jobs", self.config.url.trim_end_matches('/'))
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.config.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn remote(&self, handle: &BackendHandle) -> Result<Option<RemoteJob>> {
        let url = format!("{}/{}", self.jobs_url(), urlencoding::encode(handle.as_str()));
        let response = self.authorized(self.client.get(url)).send().await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            s if s.is_success() => Ok(Some(response.json().await?)),
            s => Err(status_error(NAME, s, "job status")),
        }
    }

    /// Start pulling the finished file, or report why it cannot be pulled
    async fn start_pull(&self, handle: &BackendHandle, job: &RemoteJob) -> Result<Option<BackendHandle>> {
        let Some(url) = job.download_url.as_deref() else {
            return Err(Error::backend(
                NAME,
                format!("job {} completed without a download URL", handle),
                false,
            ));
        };
        let mut jobs = self.jobs.lock().await;
        let Some(entry) = jobs.get_mut(handle) else {
            // Neither submitted nor re-attached through this adapter
            return Ok(None);
        };
        if let Some(local) = &entry.local {
            return Ok(Some(local.clone()));
        }
        let local = self
            .http
            .start(entry.task, url, job.file_name.clone(), &entry.dir)
            .await?;
        info!(task_id = entry.task.0, %handle, local = %local, "pulling cloud result");
        entry.local = Some(local.clone());
        Ok(Some(local))
    }
}

#[async_trait]
impl BackendAdapter for CloudAdapter {
    fn kind(&self) -> BackendKind {
        BackendKind::Cloud
    }

    fn name(&self) -> &str {
        NAME
    }

    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities::default()
    }

    async fn submit(&self, spec: &TaskSpec) -> Result<BackendHandle> {
        let Source::CloudFile { reference } = &spec.source else {
            return Err(Error::backend(
                NAME,
                format!("cannot fetch {:?} source", spec.source.default_backend()),
                false,
            ));
        };

        let response = self
            .authorized(self.client.post(self.jobs_url()))
            .json(&json!({ "reference": reference }))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(status_error(NAME, response.status(), "create job"));
        }
        let created: CreatedJob = response.json().await?;
        let handle = BackendHandle::new(created.id);

        self.jobs.lock().await.insert(
            handle.clone(),
            CloudJob {
                task: spec.id,
                dir: spec.download_dir.clone(),
                local: None,
            },
        );
        info!(task_id = spec.id.0, %handle, "cloud job created");
        Ok(handle)
    }

    async fn reattach(&self, spec: &TaskSpec, handle: &BackendHandle) -> Result<()> {
        self.jobs
            .lock()
            .await
            .entry(handle.clone())
            .or_insert_with(|| CloudJob {
                task: spec.id,
                dir: spec.download_dir.clone(),
                local: None,
            });
        debug!(task_id = spec.id.0, %handle, "cloud job re-attached");
        Ok(())
    }

    async fn poll(&self, handle: &BackendHandle) -> Result<BackendStatus> {
        let local = self
            .jobs
            .lock()
            .await
            .get(handle)
            .and_then(|j| j.local.clone());
        if let Some(local) = local {
            return self.http.poll(&local).await;
        }

        let Some(job) = self.remote(handle).await? else {
            return Ok(BackendStatus::missing());
        };
        let progress = Progress {
            bytes_done: job.bytes_done,
            bytes_total: job.bytes_total,
            speed_bps: job.speed_bps,
            eta_secs: None,
        }
        .with_estimated_eta();

        match job.status.as_str() {
            "completed" => match self.start_pull(handle, &job).await? {
                Some(local) => {
                    let status = self.http.poll(&local).await?;
                    Ok(match status.state {
                        BackendState::Done | BackendState::Errored => status,
                        _ => BackendStatus::active(status.progress),
                    })
                }
                None => Ok(BackendStatus::missing()),
            },
            "failed" => Ok(BackendStatus::errored(
                progress,
                job.error.unwrap_or_else(|| "remote job failed".to_string()),
                job.retryable,
            )),
            _ => Ok(BackendStatus::active(progress)),
        }
    }

    async fn cancel(&self, handle: &BackendHandle) -> Result<()> {
        let job = self.jobs.lock().await.remove(handle);
        if let Some(local) = job.and_then(|j| j.local)
            && let Err(e) = self.http.cancel(&local).await
        {
            warn!(%handle, error = %e, "failed to cancel local pull");
        }

        let url = format!("{}/{}", self.jobs_url(), urlencoding::encode(handle.as_str()));
        let response = self.authorized(self.client.delete(url)).send().await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(()),
            s if s.is_success() => {
                debug!(%handle, "cloud job deleted");
                Ok(())
            }
            s => Err(status_error(NAME, s, "delete job")),
        }
    }

    async fn release(&self, handle: &BackendHandle) -> Result<()> {
        if let Some(local) = self.jobs.lock().await.remove(handle).and_then(|j| j.local) {
            self.http.release(&local).await?;
        }
        Ok(())
    }
}
