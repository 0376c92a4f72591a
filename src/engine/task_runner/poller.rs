//! Watches a backend job until it reports its artifact.

use crate::backend::{BackendFailure, BackendState};
use crate::error::{Error, Result};
use crate::retry::{IsRetryable, RetryBudget, backoff_delay};
use std::path::PathBuf;
use tracing::{debug, info};

use super::context::{Session, TaskBudget, TaskContext};

/// Poll until the job is done
///
/// Halts while the run is natively paused. Transient job errors resubmit the
/// job and transient poll errors are retried, both against the task budget.
pub(super) async fn watch(ctx: &TaskContext, session: &mut Session) -> Result<PathBuf> {
    let token = &ctx.control.token;
    let mut paused = ctx.control.paused();
    let budget = ctx.budget();

    loop {
        while *paused.borrow_and_update() {
            tokio::select! {
                _ = token.cancelled() => return Err(Error::Cancelled),
                changed = paused.changed() => {
                    if changed.is_err() {
                        return Err(Error::Cancelled);
                    }
                }
            }
        }

        tokio::select! {
            _ = token.cancelled() => return Err(Error::Cancelled),
            _ = tokio::time::sleep(ctx.poll_interval()) => {}
        }
        if *paused.borrow() {
            continue;
        }

        let Some(handle) = session.handle.clone() else {
            return Err(Error::backend(ctx.adapter.name(), "no backend job to poll", false));
        };

        let status = match ctx.adapter.poll(&handle).await {
            Ok(status) => status,
            Err(e) => {
                backoff(ctx, &budget, e).await?;
                continue;
            }
        };

        match status.state {
            BackendState::Active | BackendState::Paused => {
                ctx.engine
                    .registry
                    .update_progress(ctx.id, ctx.run(), status.progress.with_estimated_eta())
                    .await?;
            }
            BackendState::Done => {
                ctx.engine
                    .registry
                    .update_progress(ctx.id, ctx.run(), status.progress)
                    .await?;
                let artifact = status.artifact_path.ok_or_else(|| {
                    Error::backend(ctx.adapter.name(), "finished without an artifact", false)
                })?;
                info!(task_id = ctx.id.0, ?artifact, "download finished");
                return Ok(artifact);
            }
            BackendState::Errored => {
                let failure = status.error.unwrap_or(BackendFailure {
                    message: "job errored".to_string(),
                    transient: false,
                });
                let err = Error::backend(ctx.adapter.name(), failure.message, failure.transient);
                backoff(ctx, &budget, err).await?;

                ctx.cancel_job(&handle).await;
                session.handle = None;
                super::submit(ctx, session).await?;
                // The new job starts uncapped
                ctx.engine.bandwidth.forget(ctx.id).await;
                ctx.engine.rebalance_bandwidth().await;
            }
            BackendState::Missing => {
                return Err(Error::backend(
                    ctx.adapter.name(),
                    "job disappeared from the backend",
                    false,
                ));
            }
        }
    }
}

/// Spend one retry on `err` and sleep, or hand the error back
async fn backoff(ctx: &TaskContext, budget: &TaskBudget, err: Error) -> Result<()> {
    if !err.is_retryable() {
        return Err(err);
    }
    let Some(attempt) = budget.try_consume(&err).await else {
        debug!(task_id = ctx.id.0, error = %err, "retry budget exhausted");
        return Err(err);
    };
    let delay = backoff_delay(&ctx.engine.config.retry, attempt);
    budget.retry_scheduled(attempt, delay, &err).await;

    tokio::select! {
        _ = ctx.control.token.cancelled() => Err(Error::Cancelled),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}
