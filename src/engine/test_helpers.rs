//! Shared test helpers for creating TransferEngine instances in tests.

use crate::backend::mock::MockBackend;
use crate::backend::{BackendAdapter, BackendCapabilities, BackendSet};
use crate::config::{Config, RetryConfig};
use crate::engine::TransferEngine;
use crate::error::{Error, Result};
use crate::post_processing::{MediaProbe, PostProcessor};
use crate::types::{
    BackendKind, Destination, HistoryEntry, MediaInfo, Priority, Source, SubmitRequest, TaskId,
    TaskSnapshot, TaskState,
};
use crate::upload::{UploadDispatcher, UploadReference};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

/// Upper bound for every wait in engine tests
const WAIT_TIMEOUT: Duration = Duration::from_secs(10);

/// Uploader that records what it was given instead of moving files
#[derive(Default)]
pub(crate) struct MockUploader {
    failures: Mutex<VecDeque<bool>>,
    uploads: Mutex<Vec<(PathBuf, Destination)>>,
    attempts: Mutex<usize>,
    delay: Mutex<Duration>,
}

impl MockUploader {
    /// Make every upload take `delay` before it lands
    pub(crate) fn slow_down(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    /// Queue failures for the next uploads; `true` marks a transient one
    pub(crate) fn fail_next(&self, transient: impl IntoIterator<Item = bool>) {
        self.failures.lock().unwrap().extend(transient);
    }

    pub(crate) fn uploads(&self) -> Vec<(PathBuf, Destination)> {
        self.uploads.lock().unwrap().clone()
    }

    pub(crate) fn attempts(&self) -> usize {
        *self.attempts.lock().unwrap()
    }
}

#[async_trait]
impl UploadDispatcher for MockUploader {
    async fn upload(&self, artifact: &Path, destination: &Destination) -> Result<UploadReference> {
        *self.attempts.lock().unwrap() += 1;
        let delay = *self.delay.lock().unwrap();
        tokio::time::sleep(delay).await;
        if let Some(transient) = self.failures.lock().unwrap().pop_front() {
            return Err(Error::Upload {
                message: "destination unavailable".to_string(),
                transient,
            });
        }
        self.uploads
            .lock()
            .unwrap()
            .push((artifact.to_path_buf(), destination.clone()));
        let name = artifact
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(UploadReference(format!("mock://{}", name)))
    }
}

/// Media probe taking a fixed time per file, with scripted failures
#[derive(Default)]
pub(crate) struct ScriptedProbe {
    delay: Duration,
    failures: Mutex<VecDeque<Error>>,
    calls: AtomicUsize,
}

impl ScriptedProbe {
    pub(crate) fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            ..Self::default()
        })
    }

    /// Fail the next probe with `error`
    pub(crate) fn fail_next(&self, error: Error) {
        self.failures.lock().unwrap().push_back(error);
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaProbe for ScriptedProbe {
    async fn probe(&self, path: &Path) -> Result<MediaInfo> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        let failure = self.failures.lock().unwrap().pop_front();
        if let Some(error) = failure {
            return Err(error);
        }
        Ok(MediaInfo {
            path: path.to_path_buf(),
            format_name: Some("matroska".to_string()),
            duration_secs: Some(1.0),
            streams: Vec::new(),
        })
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}

/// Engine wired to mock backends and a mock uploader
pub(crate) struct Harness {
    pub(crate) engine: TransferEngine,
    pub(crate) uploader: Arc<MockUploader>,
    pub(crate) backends: Vec<Arc<MockBackend>>,
    /// Keeps the work dir and database alive
    pub(crate) dir: TempDir,
}

impl Harness {
    /// Mock registered for `kind`
    pub(crate) fn mock(&self, kind: BackendKind) -> &Arc<MockBackend> {
        self.backends
            .iter()
            .find(|b| b.kind() == kind)
            .expect("no mock for backend")
    }

    /// Write a downloaded file for a mock job to report
    pub(crate) fn artifact(&self, name: &str, contents: &[u8]) -> PathBuf {
        let path = self.dir.path().join("downloads").join(name);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, contents).unwrap();
        path
    }
}

/// Config with fast polling and retries, rooted in `dir`
pub(crate) fn test_config(dir: &Path) -> Config {
    let mut config = Config::default();
    config.engine.work_dir = dir.join("work");
    config.engine.max_concurrent = 2;
    config.engine.poll_interval = Duration::from_millis(10);
    config.engine.admission_tick = Duration::from_millis(50);
    config.engine.default_max_retries = 3;
    config.engine.shutdown_timeout = Duration::from_secs(5);
    config.retry = RetryConfig {
        initial_delay: Duration::from_millis(5),
        max_delay: Duration::from_millis(20),
        backoff_multiplier: 2.0,
        jitter: false,
    };
    config.upload.root = dir.join("uploads");
    config.persistence.database_path = dir.join("state/engine.db");
    config
}

/// Mock backends for HTTP (no pause, caps) and torrent (native pause, caps)
pub(crate) fn default_mocks() -> Vec<Arc<MockBackend>> {
    vec![
        Arc::new(MockBackend::with_capabilities(
            BackendKind::Http,
            BackendCapabilities {
                pause: false,
                bandwidth_cap: true,
            },
        )),
        Arc::new(MockBackend::new(BackendKind::Torrent)),
    ]
}

/// Started engine with the default mocks
pub(crate) async fn create_test_engine() -> Harness {
    create_test_engine_with(|_| {}, default_mocks()).await
}

/// Started engine with adjusted config and the given mocks
pub(crate) async fn create_test_engine_with(
    configure: impl FnOnce(&mut Config),
    backends: Vec<Arc<MockBackend>>,
) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    configure(&mut config);
    let harness = build(config, backends, dir).await;
    harness.engine.start();
    harness
}

/// Started engine with the default mocks whose media inspection uses `probe`
pub(crate) async fn create_test_engine_with_probe(
    probe: Arc<ScriptedProbe>,
    configure: impl FnOnce(&mut Config),
) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    configure(&mut config);
    let mut harness = build(config, default_mocks(), dir).await;
    let processor = PostProcessor::new(
        harness.engine.event_tx.clone(),
        &harness.engine.config.processing,
    )
    .with_probe(Some(probe as Arc<dyn MediaProbe>));
    harness.engine = harness.engine.with_post_processor(processor);
    harness.engine.start();
    harness
}

/// Engine over an existing directory, not started
pub(crate) async fn build(config: Config, backends: Vec<Arc<MockBackend>>, dir: TempDir) -> Harness {
    let set = backends.iter().fold(BackendSet::new(), |set, backend| {
        set.with(Arc::clone(backend) as Arc<dyn BackendAdapter>)
    });
    let uploader = Arc::new(MockUploader::default());
    let engine = TransferEngine::with_backends(
        config,
        set,
        Arc::clone(&uploader) as Arc<dyn UploadDispatcher>,
    )
    .await
    .unwrap();
    Harness {
        engine,
        uploader,
        backends,
        dir,
    }
}

pub(crate) fn http_request(name: &str) -> SubmitRequest {
    SubmitRequest::new(
        Source::DirectUrl {
            url: format!("https://files.example.com/{}", name),
            filename: None,
        },
        "alice",
    )
}

pub(crate) fn torrent_request(name: &str) -> SubmitRequest {
    SubmitRequest::new(
        Source::Magnet {
            uri: format!("magnet:?xt=urn:btih:{:0>40}&dn={}", name.len(), name),
        },
        "bob",
    )
}

pub(crate) async fn submit_http(engine: &TransferEngine, name: &str, priority: i32) -> TaskId {
    let mut request = http_request(name);
    request.priority = Priority(priority);
    engine.submit(request).await.unwrap()
}

/// Poll `check` until it holds, panicking after the test timeout
pub(crate) async fn wait_until<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
    while !check().await {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {}",
            what
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub(crate) async fn wait_for_state(engine: &TransferEngine, id: TaskId, state: TaskState) -> TaskSnapshot {
    wait_until(&format!("task {} to reach {}", id, state), || async move {
        engine
            .get_task(id)
            .await
            .is_ok_and(|snapshot| snapshot.state == state)
    })
    .await;
    engine.get_task(id).await.unwrap()
}

/// Wait until the registry recorded the task's backend job
pub(crate) async fn wait_for_job(engine: &TransferEngine, id: TaskId) -> TaskSnapshot {
    wait_until(&format!("task {} to get a backend job", id), || async move {
        engine
            .get_task(id)
            .await
            .is_ok_and(|snapshot| snapshot.backend_handle.is_some())
    })
    .await;
    engine.get_task(id).await.unwrap()
}

pub(crate) async fn wait_for_history(engine: &TransferEngine, id: TaskId) -> HistoryEntry {
    wait_until(&format!("task {} to finish", id), || async move {
        engine.get_history(id).await.is_some()
    })
    .await;
    engine.get_history(id).await.unwrap()
}
