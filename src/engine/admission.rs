//! Admission loop: hands free slots to queued tasks and spawns their workers.

use crate::registry::Admitted;

use super::TransferEngine;
use super::task_runner::{TaskContext, run_task};

impl TransferEngine {
    /// Start the admission loop task
    ///
    /// The loop wakes on every submission, completion, cancellation, pause,
    /// resume and priority change, plus a slow safety tick, and admits queued
    /// tasks in `(priority, created_at, id)` order while slots are free.
    pub(crate) fn start_admission_loop(&self) {
        let engine = self.clone();
        let tick = self.config.engine.admission_tick;

        self.workers.spawn(async move {
            loop {
                engine.admit_pending().await;
                tokio::select! {
                    _ = engine.shutdown_token.cancelled() => break,
                    _ = engine.wake.notified() => {}
                    _ = tokio::time::sleep(tick) => {}
                }
            }
            tracing::debug!("admission loop stopped");
        });
    }

    /// Run one admission pass
    pub(crate) async fn admit_pending(&self) {
        let outcome = self.registry.admit(&self.limits()).await;

        for requeued in &outcome.preempted {
            self.bandwidth.forget(requeued.snapshot.id).await;
            self.record(requeued).await;
        }

        let any_admitted = !outcome.admitted.is_empty();
        for admitted in outcome.admitted {
            self.checkpoint(&admitted.snapshot).await;
            self.spawn_worker(admitted);
        }
        if any_admitted || !outcome.preempted.is_empty() {
            self.rebalance_bandwidth().await;
        }
    }

    fn spawn_worker(&self, admitted: Admitted) {
        let Admitted { snapshot, control } = admitted;
        let id = snapshot.id;
        let adapter = match self.backends.require(snapshot.backend) {
            Ok(adapter) => adapter,
            Err(e) => {
                // Backends are checked at submission; only a restored task can get here
                let engine = self.clone();
                self.workers.spawn(async move {
                    engine.fail_unstarted(id, control.run, e).await;
                });
                return;
            }
        };

        let ctx = TaskContext {
            engine: self.clone(),
            id,
            snapshot,
            control,
            adapter,
        };
        tracing::debug!(task_id = id.0, run = ctx.control.run, "spawning task worker");
        self.workers.spawn(run_task(ctx));
    }

    /// Fail a task whose worker could not be started
    async fn fail_unstarted(&self, id: crate::types::TaskId, run: u64, error: crate::Error) {
        let task_error = crate::error::TaskError::from(&error);
        match self
            .registry
            .transition(id, Some(run), "fail", crate::types::TaskState::Failed, |t| {
                t.last_error = Some(task_error);
            })
            .await
        {
            Ok(transitioned) => {
                tracing::error!(task_id = id.0, error = %error, "task failed before start");
                self.record(&transitioned).await;
            }
            Err(e) => tracing::debug!(task_id = id.0, error = %e, "task already left its run"),
        }
    }
}
