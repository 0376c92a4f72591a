//! Post-processing pipeline for finished transfers
//!
//! Stages run in the order the task lists them. Each stage takes the current
//! artifact path and returns the next one:
//! 1. Extract - archive extraction (RAR, 7z, ZIP) into `<stem>.extracted`
//! 2. InspectMedia - ffprobe stream/format report, artifact unchanged
//!
//! A failing stage removes its own partial output and never touches the
//! original download. Stage errors keep the retry classification of their
//! cause, so a timed-out tool run is tried again.

use crate::config::{ProcessingConfig, RetryConfig};
use crate::error::{Error, Result};
use crate::retry::{IsRetryable, RetryBudget, with_retry};
use crate::types::{Event, PostProcessStage, TaskId};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

mod extract;
mod media;

pub use media::{FfprobeProbe, MediaProbe};

/// Post-processing pipeline executor
pub struct PostProcessor {
    /// Event channel for stage events
    event_tx: broadcast::Sender<Event>,
    /// Media prober, `None` when ffprobe is unavailable
    probe: Option<Arc<dyn MediaProbe>>,
    /// Extensions considered media files
    media_extensions: Vec<String>,
}

impl PostProcessor {
    /// Build the pipeline, discovering ffprobe from the tool settings
    pub fn new(event_tx: broadcast::Sender<Event>, config: &ProcessingConfig) -> Self {
        let probe = FfprobeProbe::from_config(&config.tools)
            .map(|p| Arc::new(p) as Arc<dyn MediaProbe>);
        if probe.is_none() {
            debug!("ffprobe not found, media inspection will be skipped");
        }
        Self {
            event_tx,
            probe,
            media_extensions: config.media_extensions.clone(),
        }
    }

    /// Replace the media prober
    pub fn with_probe(mut self, probe: Option<Arc<dyn MediaProbe>>) -> Self {
        self.probe = probe;
        self
    }

    /// Run every stage in order, returning the final artifact path
    ///
    /// A stage failing with a retryable error runs again against `budget`.
    pub async fn run_pipeline(
        &self,
        id: TaskId,
        stages: &[PostProcessStage],
        artifact: PathBuf,
        retry: &RetryConfig,
        budget: &dyn RetryBudget,
        cancel: &CancellationToken,
    ) -> Result<PathBuf> {
        let mut current = artifact;
        for stage in stages {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let input = current;
            current = with_retry(retry, budget, cancel, || {
                self.run_stage(id, stage, &input, cancel)
            })
            .await?;
        }
        Ok(current)
    }

    /// Run a single stage
    pub async fn run_stage(
        &self,
        id: TaskId,
        stage: &PostProcessStage,
        artifact: &Path,
        cancel: &CancellationToken,
    ) -> Result<PathBuf> {
        info!(task_id = id.0, stage = stage.name(), ?artifact, "starting stage");
        self.event_tx
            .send(Event::StageStarted {
                id,
                stage: stage.name().to_string(),
            })
            .ok();

        match stage {
            PostProcessStage::Extract {
                delete_archive,
                password,
            } => extract::run(id, artifact, *delete_archive, password.as_deref(), cancel).await,
            PostProcessStage::InspectMedia => {
                self.inspect_media(id, artifact, cancel).await?;
                Ok(artifact.to_path_buf())
            }
        }
    }

    async fn inspect_media(
        &self,
        id: TaskId,
        artifact: &Path,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let Some(probe) = &self.probe else {
            warn!(task_id = id.0, "ffprobe unavailable, skipping media inspection");
            return Ok(());
        };

        let files = media::media_files(artifact, &self.media_extensions).map_err(|e| {
            Error::Processing {
                stage: "inspect_media".to_string(),
                message: format!("cannot scan {}: {}", artifact.display(), e),
                retryable: e.is_retryable(),
            }
        })?;
        if files.is_empty() {
            debug!(task_id = id.0, ?artifact, "no media files to inspect");
            return Ok(());
        }

        for file in files {
            let info = tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                result = probe.probe(&file) => result.map_err(|e| Error::Processing {
                    stage: "inspect_media".to_string(),
                    message: format!("{} failed on {}: {}", probe.name(), file.display(), e),
                    retryable: e.is_retryable(),
                })?,
            };
            debug!(
                task_id = id.0,
                ?file,
                streams = info.streams.len(),
                duration = ?info.duration_secs,
                "media inspected"
            );
            self.event_tx.send(Event::MediaInspected { id, info }).ok();
        }
        Ok(())
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;
