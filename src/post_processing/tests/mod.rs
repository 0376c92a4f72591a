use super::*;
use crate::retry::FixedBudget;
use crate::types::{MediaInfo, MediaStream};
use async_trait::async_trait;
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tempfile::TempDir;

/// Probe that answers without running any binary
struct FakeProbe {
    calls: AtomicUsize,
    failures: AtomicUsize,
    error: &'static str,
}

impl FakeProbe {
    fn new(fail: bool) -> Arc<Self> {
        Self::failing(if fail { usize::MAX } else { 0 }, "probe crashed")
    }

    /// Fails the first `times` calls with `error`
    fn failing(times: usize, error: &'static str) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            failures: AtomicUsize::new(times),
            error,
        })
    }
}

#[async_trait]
impl MediaProbe for FakeProbe {
    async fn probe(&self, path: &Path) -> Result<MediaInfo> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let failed = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(Error::ExternalTool(self.error.into()));
        }
        Ok(MediaInfo {
            path: path.to_path_buf(),
            format_name: Some("matroska".into()),
            duration_secs: Some(10.0),
            streams: vec![MediaStream {
                index: 0,
                codec_type: Some("video".into()),
                codec_name: Some("h264".into()),
                width: Some(640),
                height: Some(360),
            }],
        })
    }

    fn name(&self) -> &'static str {
        "fake"
    }
}

fn processor(probe: Option<Arc<dyn MediaProbe>>) -> (PostProcessor, broadcast::Receiver<Event>) {
    let (tx, rx) = broadcast::channel(64);
    let processor = PostProcessor::new(tx, &ProcessingConfig::default()).with_probe(probe);
    (processor, rx)
}

fn write_zip(path: &Path, files: &[(&str, &[u8])]) {
    let file = std::fs::File::create(path).unwrap();
    let mut writer = ::zip::ZipWriter::new(file);
    let options =
        ::zip::write::FileOptions::default().compression_method(::zip::CompressionMethod::Stored);
    for (name, content) in files {
        writer.start_file(*name, options).unwrap();
        writer.write_all(content).unwrap();
    }
    writer.finish().unwrap();
}

fn fast_retry() -> RetryConfig {
    RetryConfig {
        initial_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(1),
        backoff_multiplier: 1.0,
        jitter: false,
    }
}

/// Run a pipeline with no retries to spend
async fn run(
    processor: &PostProcessor,
    stages: &[PostProcessStage],
    artifact: PathBuf,
    cancel: &CancellationToken,
) -> Result<PathBuf> {
    processor
        .run_pipeline(TaskId(1), stages, artifact, &fast_retry(), &FixedBudget::new(0), cancel)
        .await
}

fn extract(delete_archive: bool) -> PostProcessStage {
    PostProcessStage::Extract {
        delete_archive,
        password: None,
    }
}

#[tokio::test]
async fn empty_pipeline_returns_artifact() {
    let (processor, _rx) = processor(None);
    let artifact = PathBuf::from("/tmp/nothing-to-do");
    let out = run(&processor, &[], artifact.clone(), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(out, artifact);
}

#[tokio::test]
async fn extract_writes_next_to_archive_and_keeps_it() {
    let dir = TempDir::new().unwrap();
    let archive = dir.path().join("movie.zip");
    write_zip(&archive, &[("movie.mkv", b"frames")]);
    let (processor, mut rx) = processor(None);

    let out = processor
        .run_stage(TaskId(1), &extract(false), &archive, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(out, dir.path().join("movie.extracted"));
    assert_eq!(std::fs::read(out.join("movie.mkv")).unwrap(), b"frames");
    assert!(archive.exists());
    assert!(matches!(
        rx.try_recv().unwrap(),
        Event::StageStarted { stage, .. } if stage == "extract"
    ));
}

#[tokio::test]
async fn extract_deletes_archive_only_on_success() {
    let dir = TempDir::new().unwrap();
    let archive = dir.path().join("pack.zip");
    write_zip(&archive, &[("a.txt", b"a")]);
    let (processor, _rx) = processor(None);

    processor
        .run_stage(TaskId(1), &extract(true), &archive, &CancellationToken::new())
        .await
        .unwrap();
    assert!(!archive.exists());
}

#[tokio::test]
async fn failed_extraction_cleans_up_and_keeps_download() {
    let dir = TempDir::new().unwrap();
    let download = dir.path().join("release");
    std::fs::create_dir(&download).unwrap();
    write_zip(&download.join("good.zip"), &[("ok.txt", b"ok")]);
    std::fs::write(download.join("zz-broken.zip"), b"not a zip").unwrap();
    let (processor, _rx) = processor(None);

    let err = processor
        .run_stage(TaskId(7), &extract(true), &download, &CancellationToken::new())
        .await
        .unwrap_err();

    match err {
        Error::Processing {
            stage, retryable, ..
        } => {
            assert_eq!(stage, "extract");
            assert!(!retryable);
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(!dir.path().join("release.extracted").exists());
    assert!(download.join("good.zip").exists());
    assert!(download.join("zz-broken.zip").exists());
}

#[tokio::test]
async fn directory_without_archives_passes_through() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("file.mkv"), b"x").unwrap();
    let (processor, _rx) = processor(None);

    let out = processor
        .run_stage(TaskId(1), &extract(false), dir.path(), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(out, dir.path());
}

#[tokio::test]
async fn inspect_media_is_skipped_without_inspector() {
    let dir = TempDir::new().unwrap();
    let file = dir.path().join("a.mkv");
    std::fs::write(&file, b"x").unwrap();
    let (processor, mut rx) = processor(None);

    let out = processor
        .run_stage(TaskId(1), &PostProcessStage::InspectMedia, &file, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(out, file);
    assert!(matches!(rx.try_recv().unwrap(), Event::StageStarted { .. }));
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn inspect_media_reports_each_file() {
    let dir = TempDir::new().unwrap();
    for name in ["a.mkv", "b.mp4", "notes.txt"] {
        std::fs::write(dir.path().join(name), b"x").unwrap();
    }
    let probe = FakeProbe::new(false);
    let (processor, mut rx) = processor(Some(probe.clone()));

    processor
        .run_stage(TaskId(3), &PostProcessStage::InspectMedia, dir.path(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(probe.calls.load(Ordering::SeqCst), 2);
    let mut inspected = 0;
    while let Ok(event) = rx.try_recv() {
        if let Event::MediaInspected { id, info } = event {
            assert_eq!(id, TaskId(3));
            assert_eq!(info.streams.len(), 1);
            inspected += 1;
        }
    }
    assert_eq!(inspected, 2);
}

#[tokio::test]
async fn inspection_failure_is_permanent_processing_error() {
    let dir = TempDir::new().unwrap();
    let file = dir.path().join("a.mkv");
    std::fs::write(&file, b"x").unwrap();
    let (processor, _rx) = processor(Some(FakeProbe::new(true)));

    let err = processor
        .run_stage(TaskId(1), &PostProcessStage::InspectMedia, &file, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Processing { ref stage, retryable: false, .. } if stage == "inspect_media"
    ));
}

#[tokio::test]
async fn timed_out_inspection_is_retried_against_the_budget() {
    let dir = TempDir::new().unwrap();
    let file = dir.path().join("a.mkv");
    std::fs::write(&file, b"x").unwrap();
    let probe = FakeProbe::failing(1, "ffprobe timeout");
    let (processor, _rx) = processor(Some(probe.clone()));
    let budget = FixedBudget::new(2);

    let out = processor
        .run_pipeline(
            TaskId(1),
            &[PostProcessStage::InspectMedia],
            file.clone(),
            &fast_retry(),
            &budget,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(out, file);
    assert_eq!(probe.calls.load(Ordering::SeqCst), 2);
    assert_eq!(budget.used(), 1);
}

#[tokio::test]
async fn crashed_inspection_spends_no_retries() {
    let dir = TempDir::new().unwrap();
    let file = dir.path().join("a.mkv");
    std::fs::write(&file, b"x").unwrap();
    let probe = FakeProbe::new(true);
    let (processor, _rx) = processor(Some(probe.clone()));
    let budget = FixedBudget::new(2);

    let err = processor
        .run_pipeline(
            TaskId(1),
            &[PostProcessStage::InspectMedia],
            file,
            &fast_retry(),
            &budget,
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Processing { retryable: false, .. }));
    assert_eq!(probe.calls.load(Ordering::SeqCst), 1);
    assert_eq!(budget.used(), 0);
}

#[tokio::test]
async fn pipeline_chains_artifacts_between_stages() {
    let dir = TempDir::new().unwrap();
    let archive = dir.path().join("show.zip");
    write_zip(&archive, &[("ep1.mkv", b"1"), ("ep2.mkv", b"2")]);
    let probe = FakeProbe::new(false);
    let (processor, _rx) = processor(Some(probe.clone()));

    let out = run(
        &processor,
        &[extract(false), PostProcessStage::InspectMedia],
        archive,
        &CancellationToken::new(),
    )
    .await
    .unwrap();

    assert_eq!(out, dir.path().join("show.extracted"));
    assert_eq!(probe.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn cancelled_pipeline_runs_no_stage() {
    let (processor, mut rx) = processor(None);
    let token = CancellationToken::new();
    token.cancel();

    let err = run(&processor, &[extract(false)], PathBuf::from("/tmp/x"), &token)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Cancelled));
    assert!(rx.try_recv().is_err());
}
