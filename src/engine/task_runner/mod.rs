//! Per-task worker: one spawned future per admitted run.
//!
//! Split into focused submodules:
//! - [`context`] - Run context, session bookkeeping and the task retry budget
//! - [`poller`] - Status polling until the backend reports the artifact
//! - [`finalization`] - Post-processing, upload and the terminal transition
//!
//! A worker never decides how it was stopped. When its run is stopped the
//! [`StopReason`] recorded by the caller selects the cleanup.

mod context;
mod finalization;
mod poller;

pub(crate) use context::TaskContext;

use crate::backend::{BackendHandle, BackendState};
use crate::error::{Error, Result, TaskError};
use crate::registry::StopReason;
use crate::retry::with_retry;
use crate::types::TaskState;
use crate::utils::remove_path;
use context::Session;
use tracing::{debug, error, info, warn};

/// Drive one admitted run to its end
pub(crate) async fn run_task(ctx: TaskContext) {
    let mut session = Session::default();
    let result = drive(&ctx, &mut session).await;

    if let Err(e) = result {
        match ctx.control.stop_reason() {
            Some(reason) => stopped(&ctx, &session, reason).await,
            None => failed(&ctx, &session, e).await,
        }
    }
    debug!(task_id = ctx.id.0, run = ctx.run(), "task worker finished");
}

async fn drive(ctx: &TaskContext, session: &mut Session) -> Result<()> {
    attach(ctx, session).await?;
    ctx.engine.rebalance_bandwidth().await;
    let artifact = poller::watch(ctx, session).await?;
    finalization::finish(ctx, session, artifact).await
}

/// Re-attach to a job recorded before a restart, or submit a new one
async fn attach(ctx: &TaskContext, session: &mut Session) -> Result<()> {
    let Some(handle) = ctx.snapshot.backend_handle.clone().map(BackendHandle::new) else {
        return submit(ctx, session).await;
    };

    if let Err(e) = ctx.adapter.reattach(&ctx.spec(), &handle).await {
        warn!(task_id = ctx.id.0, %handle, error = %e, "adapter refused the restored job");
    }
    match ctx.adapter.poll(&handle).await {
        Ok(status) if status.state == BackendState::Missing => {
            info!(
                task_id = ctx.id.0,
                %handle,
                "recorded backend job is gone, submitting again"
            );
            ctx.engine
                .registry
                .update(ctx.id, ctx.run(), |t| t.backend_handle = None)
                .await?;
            submit(ctx, session).await
        }
        Ok(status) => {
            if status.state == BackendState::Paused {
                match ctx.adapter.resume(&handle).await {
                    Ok(()) | Err(Error::Unsupported { .. }) => {}
                    Err(e) => warn!(task_id = ctx.id.0, error = %e, "failed to resume re-attached job"),
                }
            }
            info!(task_id = ctx.id.0, %handle, state = ?status.state, "re-attached to backend job");
            session.handle = Some(handle);
            Ok(())
        }
        // Let the poller retry against the task budget
        Err(e) => {
            warn!(task_id = ctx.id.0, %handle, error = %e, "could not reach backend for re-attach");
            session.handle = Some(handle);
            Ok(())
        }
    }
}

/// Create the backend job and record its handle
pub(super) async fn submit(ctx: &TaskContext, session: &mut Session) -> Result<()> {
    let spec = ctx.spec();
    let budget = ctx.budget();
    let handle = with_retry(
        &ctx.engine.config.retry,
        &budget,
        &ctx.control.token,
        || ctx.adapter.submit(&spec),
    )
    .await?;

    // From here on the stop path owns the job
    session.handle = Some(handle.clone());
    let snapshot = ctx
        .engine
        .registry
        .update(ctx.id, ctx.run(), |t| t.backend_handle = Some(handle.clone()))
        .await?;
    ctx.engine.checkpoint(&snapshot).await;
    if ctx.control.token.is_cancelled() {
        return Err(Error::Cancelled);
    }

    info!(
        task_id = ctx.id.0,
        backend = ctx.adapter.name(),
        %handle,
        "backend job submitted"
    );
    Ok(())
}

/// Cleanup for a run stopped by a control operation or shutdown
async fn stopped(ctx: &TaskContext, session: &Session, reason: StopReason) {
    match reason {
        StopReason::Cancelled => {
            if let Some(handle) = &session.handle {
                ctx.cancel_job(handle).await;
            }
            remove_quietly(ctx, &ctx.engine.task_dir(ctx.id)).await;
            for path in &session.produced {
                remove_quietly(ctx, path).await;
            }
        }
        StopReason::Paused | StopReason::Requeued => {
            if let Some(handle) = &session.handle {
                ctx.cancel_job(handle).await;
            }
            remove_quietly(ctx, &ctx.engine.task_dir(ctx.id)).await;
        }
        // The job keeps running in the backend and is re-attached on restart
        StopReason::Shutdown => {}
    }
    ctx.engine.bandwidth.forget(ctx.id).await;
    ctx.engine.rebalance_bandwidth().await;
    debug!(task_id = ctx.id.0, run = ctx.run(), ?reason, "task run stopped");
}

/// Record a permanent failure
async fn failed(ctx: &TaskContext, session: &Session, e: Error) {
    let task_error = TaskError::from(&e);
    match ctx
        .engine
        .registry
        .transition(ctx.id, Some(ctx.run()), "fail", TaskState::Failed, |t| {
            t.last_error = Some(task_error);
        })
        .await
    {
        Ok(transitioned) => {
            error!(task_id = ctx.id.0, error = %e, "task failed");
            ctx.engine.record(&transitioned).await;
        }
        Err(_) => {
            // Stopped between the failure and its transition
            if let Some(reason) = ctx.control.stop_reason() {
                stopped(ctx, session, reason).await;
            }
            return;
        }
    }

    // Finished jobs stay in the backend with their artifact for inspection
    if !session.downloaded
        && let Some(handle) = &session.handle
    {
        ctx.cancel_job(handle).await;
    }
    ctx.engine.bandwidth.forget(ctx.id).await;
    ctx.engine.rebalance_bandwidth().await;
}

async fn remove_quietly(ctx: &TaskContext, path: &std::path::Path) {
    if let Err(e) = remove_path(path).await {
        warn!(task_id = ctx.id.0, ?path, error = %e, "failed to remove partial output");
    }
}
