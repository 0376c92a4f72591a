//! In-process HTTP(S) downloads
//!
//! Each job streams one URL into the task's download directory. Pausing drops
//! the in-flight request; resuming issues a `Range` request from the bytes
//! already on disk. A per-job [`TokenBucket`] enforces the job's allotment and
//! the shared global bucket enforces the engine-wide cap.

use super::{
    BackendAdapter, BackendCapabilities, BackendHandle, BackendStatus, TaskSpec, status_error,
};
use crate::bandwidth::TokenBucket;
use crate::config::HttpConfig;
use crate::error::{Error, Result};
use crate::retry::IsRetryable;
use crate::types::{BackendKind, Progress, Source, TaskId};
use crate::utils::{ensure_free_space, filename_from_response, remove_path, sanitize_filename};
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const NAME: &str = "http";

/// Direct URL downloader
pub struct HttpAdapter {
    client: reqwest::Client,
    min_free_space: u64,
    global: TokenBucket,
    jobs: Arc<Mutex<HashMap<BackendHandle, Arc<HttpJob>>>>,
    next_job: AtomicU64,
}

struct HttpJob {
    url: String,
    dir: PathBuf,
    filename: Option<String>,
    bytes_done: AtomicU64,
    bytes_total: AtomicU64,
    limiter: TokenBucket,
    paused: watch::Sender<bool>,
    cancel: CancellationToken,
    status: Mutex<JobStatus>,
}

struct JobStatus {
    path: Option<PathBuf>,
    outcome: Option<std::result::Result<(), (String, bool)>>,
    last_sample: (Instant, u64),
    speed_bps: u64,
}

enum FetchOutcome {
    Complete,
    Interrupted,
}

impl HttpAdapter {
    /// Create the adapter; `global` is the engine-wide bucket
    pub fn new(config: &HttpConfig, global: TokenBucket) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .connect_timeout(config.connect_timeout)
            .build()?;
        Ok(Self {
            client,
            min_free_space: config.min_free_space,
            global,
            jobs: Arc::new(Mutex::new(HashMap::new())),
            next_job: AtomicU64::new(1),
        })
    }

    /// Start downloading `url` into `dir`
    ///
    /// Used directly for [`Source::DirectUrl`] and by adapters that resolve
    /// or produce a URL before the local transfer.
    pub(crate) async fn start(
        &self,
        id: TaskId,
        url: &str,
        filename: Option<String>,
        dir: &Path,
    ) -> Result<BackendHandle> {
        let parsed = url::Url::parse(url)
            .map_err(|e| Error::backend(NAME, format!("invalid URL {}: {}", url, e), false))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(Error::backend(
                NAME,
                format!("unsupported URL scheme {}", parsed.scheme()),
                false,
            ));
        }
        tokio::fs::create_dir_all(dir).await?;

        let handle = BackendHandle::new(format!(
            "http-{}-{}",
            id,
            self.next_job.fetch_add(1, Ordering::SeqCst)
        ));
        let (paused, _) = watch::channel(false);
        let job = Arc::new(HttpJob {
            url: url.to_string(),
            dir: dir.to_path_buf(),
            filename: filename.map(|f| sanitize_filename(&f)),
            bytes_done: AtomicU64::new(0),
            bytes_total: AtomicU64::new(0),
            limiter: TokenBucket::new(None),
            paused,
            cancel: CancellationToken::new(),
            status: Mutex::new(JobStatus {
                path: None,
                outcome: None,
                last_sample: (Instant::now(), 0),
                speed_bps: 0,
            }),
        });
        self.jobs.lock().await.insert(handle.clone(), job.clone());

        info!(task_id = id.0, %handle, url, "starting HTTP transfer");
        tokio::spawn(run_job(
            self.client.clone(),
            self.global.clone(),
            self.min_free_space,
            handle.clone(),
            job,
        ));
        Ok(handle)
    }

    async fn job(&self, handle: &BackendHandle) -> Option<Arc<HttpJob>> {
        self.jobs.lock().await.get(handle).cloned()
    }
}

#[async_trait]
impl BackendAdapter for HttpAdapter {
    fn kind(&self) -> BackendKind {
        BackendKind::Http
    }

    fn name(&self) -> &str {
        NAME
    }

    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities {
            pause: true,
            bandwidth_cap: true,
        }
    }

    async fn submit(&self, spec: &TaskSpec) -> Result<BackendHandle> {
        match &spec.source {
            Source::DirectUrl { url, filename } => {
                self.start(spec.id, url, filename.clone(), &spec.download_dir)
                    .await
            }
            other => Err(Error::backend(
                NAME,
                format!("cannot download {:?} source", other.default_backend()),
                false,
            )),
        }
    }

    async fn poll(&self, handle: &BackendHandle) -> Result<BackendStatus> {
        let Some(job) = self.job(handle).await else {
            return Ok(BackendStatus::missing());
        };

        let done = job.bytes_done.load(Ordering::SeqCst);
        let total = job.bytes_total.load(Ordering::SeqCst);
        let paused = *job.paused.borrow();

        let mut status = job.status.lock().await;
        let now = Instant::now();
        let (then, then_bytes) = status.last_sample;
        let elapsed = now.duration_since(then).as_secs_f64();
        if elapsed >= 0.5 {
            status.speed_bps = if paused {
                0
            } else {
                (done.saturating_sub(then_bytes) as f64 / elapsed) as u64
            };
            status.last_sample = (now, done);
        }
        let progress = Progress {
            bytes_done: done,
            bytes_total: total,
            speed_bps: status.speed_bps,
            eta_secs: None,
        }
        .with_estimated_eta();

        Ok(match &status.outcome {
            Some(Ok(())) => BackendStatus::done(progress, status.path.clone()),
            Some(Err((message, transient))) => {
                BackendStatus::errored(progress, message.clone(), *transient)
            }
            None if paused => BackendStatus::paused(progress),
            None => BackendStatus::active(progress),
        })
    }

    async fn pause(&self, handle: &BackendHandle) -> Result<()> {
        let job = self
            .job(handle)
            .await
            .ok_or_else(|| Error::backend(NAME, format!("unknown job {}", handle), false))?;
        job.paused.send_replace(true);
        debug!(%handle, "HTTP transfer paused");
        Ok(())
    }

    async fn resume(&self, handle: &BackendHandle) -> Result<()> {
        let job = self
            .job(handle)
            .await
            .ok_or_else(|| Error::backend(NAME, format!("unknown job {}", handle), false))?;
        job.paused.send_replace(false);
        debug!(%handle, "HTTP transfer resumed");
        Ok(())
    }

    async fn cancel(&self, handle: &BackendHandle) -> Result<()> {
        let Some(job) = self.jobs.lock().await.remove(handle) else {
            return Ok(());
        };
        job.cancel.cancel();
        let status = job.status.lock().await;
        if !matches!(status.outcome, Some(Ok(())))
            && let Some(path) = &status.path
            && let Err(e) = remove_path(path).await
        {
            warn!(%handle, ?path, error = %e, "failed to remove partial download");
        }
        Ok(())
    }

    async fn apply_bandwidth_cap(&self, handle: &BackendHandle, bps: u64) -> Result<()> {
        let job = self
            .job(handle)
            .await
            .ok_or_else(|| Error::backend(NAME, format!("unknown job {}", handle), false))?;
        job.limiter.set_rate((bps > 0).then_some(bps));
        Ok(())
    }

    async fn release(&self, handle: &BackendHandle) -> Result<()> {
        self.jobs.lock().await.remove(handle);
        Ok(())
    }
}

async fn run_job(
    client: reqwest::Client,
    global: TokenBucket,
    min_free_space: u64,
    handle: BackendHandle,
    job: Arc<HttpJob>,
) {
    let mut paused_rx = job.paused.subscribe();

    loop {
        while *paused_rx.borrow_and_update() {
            tokio::select! {
                _ = job.cancel.cancelled() => return,
                changed = paused_rx.changed() => if changed.is_err() { return },
            }
        }

        let outcome = tokio::select! {
            _ = job.cancel.cancelled() => return,
            r = fetch(&client, &global, min_free_space, &job, &mut paused_rx) => r,
        };

        match outcome {
            Ok(FetchOutcome::Complete) => {
                info!(%handle, bytes = job.bytes_done.load(Ordering::SeqCst), "HTTP transfer complete");
                job.status.lock().await.outcome = Some(Ok(()));
                return;
            }
            Ok(FetchOutcome::Interrupted) => continue,
            Err(e) => {
                warn!(%handle, error = %e, "HTTP transfer failed");
                let transient = e.is_retryable();
                job.status.lock().await.outcome = Some(Err((e.to_string(), transient)));
                return;
            }
        }
    }
}

async fn fetch(
    client: &reqwest::Client,
    global: &TokenBucket,
    min_free_space: u64,
    job: &HttpJob,
    paused_rx: &mut watch::Receiver<bool>,
) -> Result<FetchOutcome> {
    let offset = job.bytes_done.load(Ordering::SeqCst);
    let mut request = client.get(&job.url);
    if offset > 0 {
        request = request.header(reqwest::header::RANGE, format!("bytes={}-", offset));
    }

    let response = request.send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(status_error(NAME, status, "download"));
    }

    let resumed = offset > 0 && status == reqwest::StatusCode::PARTIAL_CONTENT;
    if offset > 0 && !resumed {
        debug!(url = %job.url, "server ignored Range, restarting from zero");
        job.bytes_done.store(0, Ordering::SeqCst);
    }
    let start = if resumed { offset } else { 0 };
    let total = response.content_length().map(|len| len + start);
    job.bytes_total.store(total.unwrap_or(0), Ordering::SeqCst);

    let path = {
        let mut status = job.status.lock().await;
        match &status.path {
            Some(path) => path.clone(),
            None => {
                let name = job
                    .filename
                    .clone()
                    .unwrap_or_else(|| filename_from_response(&response, &job.url));
                let path = job.dir.join(name);
                status.path = Some(path.clone());
                path
            }
        }
    };

    if let Some(total) = total {
        ensure_free_space(&job.dir, (total - start).saturating_add(min_free_space))?;
    }

    let mut file = if resumed {
        tokio::fs::OpenOptions::new().append(true).open(&path).await?
    } else {
        tokio::fs::File::create(&path).await?
    };

    let mut stream = response.bytes_stream();
    loop {
        tokio::select! {
            biased;
            changed = paused_rx.changed() => {
                if changed.is_ok() && *paused_rx.borrow_and_update() {
                    file.flush().await?;
                    return Ok(FetchOutcome::Interrupted);
                }
            }
            chunk = stream.next() => match chunk {
                Some(Ok(bytes)) => {
                    let len = bytes.len() as u64;
                    job.limiter.acquire(len).await;
                    global.acquire(len).await;
                    file.write_all(&bytes).await?;
                    job.bytes_done.fetch_add(len, Ordering::SeqCst);
                }
                Some(Err(e)) => {
                    file.flush().await?;
                    return Err(e.into());
                }
                None => break,
            }
        }
    }
    file.flush().await?;

    let done = job.bytes_done.load(Ordering::SeqCst);
    if let Some(total) = total
        && done < total
    {
        return Err(Error::backend(
            NAME,
            format!("connection closed after {} of {} bytes", done, total),
            true,
        ));
    }
    Ok(FetchOutcome::Complete)
}
