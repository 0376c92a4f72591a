//! Post-download stages, upload and the final state transition.

use crate::error::{Error, Result};
use crate::retry::with_retry;
use crate::types::{Event, TaskState};
use std::future::Future;
use std::path::PathBuf;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::context::{Session, TaskContext};

/// Take a downloaded artifact through processing and upload to `Completed`
pub(super) async fn finish(ctx: &TaskContext, session: &mut Session, artifact: PathBuf) -> Result<()> {
    let engine = &ctx.engine;
    let run = Some(ctx.run());
    let token = &ctx.control.token;

    let processing = engine
        .registry
        .transition(ctx.id, run, "process", TaskState::Processing, |t| {
            t.artifact_path = Some(artifact.clone());
        })
        .await?;
    session.downloaded = true;
    engine.record(&processing).await;

    // The transfer is over; its share goes to the others
    engine.bandwidth.forget(ctx.id).await;
    engine.rebalance_bandwidth().await;

    let budget = ctx.budget();
    let retry = &engine.config.retry;
    let output = with_heartbeat(
        ctx,
        engine.post_processor.run_pipeline(
            ctx.id,
            &ctx.snapshot.stages,
            artifact.clone(),
            retry,
            &budget,
            token,
        ),
    )
    .await?;
    if output != artifact {
        session.produced.push(output.clone());
    }

    let uploading = engine
        .registry
        .transition(ctx.id, run, "upload", TaskState::Uploading, |t| {
            t.artifact_path = Some(output.clone());
        })
        .await?;
    engine.record(&uploading).await;

    let destination = &ctx.snapshot.destination;
    let reference = with_heartbeat(
        ctx,
        with_retry(retry, &budget, token, || {
            engine.uploader.upload(&output, destination)
        }),
    )
    .await?;
    engine.emit_event(Event::Uploaded {
        id: ctx.id,
        reference: reference.0.clone(),
    });

    let completed = engine
        .registry
        .transition(ctx.id, run, "complete", TaskState::Completed, |t| {
            t.upload_reference = Some(reference.0.clone());
        })
        .await?;

    if let Some(handle) = &session.handle
        && let Err(e) = ctx.adapter.release(handle).await
    {
        warn!(task_id = ctx.id.0, %handle, error = %e, "failed to release backend job");
    }
    engine.record(&completed).await;

    info!(
        task_id = ctx.id.0,
        name = %ctx.snapshot.name,
        reference = %reference,
        "task completed"
    );
    Ok(())
}

/// Drive `work` until it ends or the run is stopped
///
/// Publishes the task's progress every poll interval meanwhile.
async fn with_heartbeat<T>(ctx: &TaskContext, work: impl Future<Output = Result<T>>) -> Result<T> {
    let mut ticks = tokio::time::interval(ctx.engine.config.engine.poll_interval);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately
    ticks.tick().await;
    tokio::pin!(work);

    loop {
        tokio::select! {
            _ = ctx.control.token.cancelled() => return Err(Error::Cancelled),
            result = &mut work => return result,
            _ = ticks.tick() => {
                if let Err(e) = ctx.engine.registry.publish_progress(ctx.id, ctx.run()).await {
                    debug!(task_id = ctx.id.0, error = %e, "run ended, progress not published");
                }
            }
        }
    }
}
