//! Task registry
//!
//! Owns every live task, the admission heap and the slot counters behind a
//! single mutex. All state changes go through [`TaskRegistry::transition`],
//! which validates the state machine, keeps slot accounting consistent and
//! emits `StateChanged`. Terminal tasks leave the registry in the same
//! critical section that finishes them, so their history entry is produced
//! exactly once. Nothing here performs backend I/O.

mod queue;
mod task;

pub(crate) use task::{PausedBy, RunControl, StopReason, Task};

use crate::backend::BackendHandle;
use crate::config::PreemptionPolicy;
use crate::error::{Error, Result};
use crate::types::{
    BackendKind, Event, HistoryEntry, Priority, Progress, QueueStats, TaskId, TaskSnapshot,
    TaskState,
};
use chrono::Utc;
use queue::{QueuedTask, TaskQueue};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use tokio::sync::{Mutex, broadcast};
use tracing::{debug, info};

/// Cleanup owed by a run that a control operation moved to `to`
fn stop_reason_for(to: TaskState) -> StopReason {
    match to {
        TaskState::Queued => StopReason::Requeued,
        TaskState::Paused => StopReason::Paused,
        _ => StopReason::Cancelled,
    }
}

/// Slot limits applied at admission
#[derive(Clone, Debug)]
pub(crate) struct Limits {
    pub(crate) global: usize,
    pub(crate) per_backend: HashMap<BackendKind, usize>,
    pub(crate) preemption: PreemptionPolicy,
}

/// A task that just received a slot
#[derive(Debug)]
pub(crate) struct Admitted {
    pub(crate) snapshot: TaskSnapshot,
    pub(crate) control: RunControl,
}

/// Result of a state transition
#[derive(Debug)]
pub(crate) struct Transitioned {
    pub(crate) old_state: TaskState,
    pub(crate) snapshot: TaskSnapshot,
    /// Set when the task reached a terminal state and left the registry
    pub(crate) finished: Option<HistoryEntry>,
    /// Run detached by the transition
    ///
    /// Already stopped when the transition came from a control operation.
    pub(crate) detached: Option<RunControl>,
}

/// Outcome of one admission pass
#[derive(Debug, Default)]
pub(crate) struct AdmitOutcome {
    pub(crate) admitted: Vec<Admitted>,
    pub(crate) preempted: Vec<Transitioned>,
}

/// Why admission is frozen
#[derive(Clone, Copy, Debug, Default)]
struct Freeze {
    paused_all: bool,
    pressure: bool,
    shutting_down: bool,
}

impl Freeze {
    fn any(&self) -> bool {
        self.paused_all || self.pressure || self.shutting_down
    }
}

#[derive(Default)]
struct RegistryInner {
    tasks: HashMap<TaskId, Task>,
    queue: TaskQueue,
    active: usize,
    active_by_backend: HashMap<BackendKind, usize>,
    freeze: Freeze,
    next_run: u64,
    revision: u64,
}

impl RegistryInner {
    fn bump(&mut self, id: TaskId) {
        self.revision += 1;
        let revision = self.revision;
        if let Some(task) = self.tasks.get_mut(&id) {
            task.revision = revision;
        }
    }

    fn backend_active(&self, backend: BackendKind) -> usize {
        self.active_by_backend.get(&backend).copied().unwrap_or(0)
    }

    fn backend_has_room(&self, backend: BackendKind, limits: &Limits, freed: usize) -> bool {
        limits
            .per_backend
            .get(&backend)
            .is_none_or(|limit| self.backend_active(backend).saturating_sub(freed) < *limit)
    }

    fn take_slot(&mut self, backend: BackendKind) {
        self.active += 1;
        *self.active_by_backend.entry(backend).or_default() += 1;
    }

    fn release_slot(&mut self, backend: BackendKind) {
        self.active = self.active.saturating_sub(1);
        if let Some(count) = self.active_by_backend.get_mut(&backend) {
            *count = count.saturating_sub(1);
        }
    }

    fn enqueue(&mut self, id: TaskId) {
        if let Some(task) = self.tasks.get(&id) {
            self.queue.push(QueuedTask {
                id,
                priority: task.priority,
                created_at: task.created_at,
            });
        }
    }

    fn transition(
        &mut self,
        events: &broadcast::Sender<Event>,
        id: TaskId,
        run: Option<u64>,
        operation: &str,
        to: TaskState,
        f: impl FnOnce(&mut Task),
    ) -> Result<Transitioned> {
        let Some(task) = self.tasks.get_mut(&id) else {
            return Err(if run.is_some() {
                Error::Cancelled
            } else {
                Error::NotFound(id)
            });
        };
        if let Some(run) = run
            && !task.owned_by(run)
        {
            return Err(Error::Cancelled);
        }
        let old_state = task.state;
        if !old_state.can_transition_to(to) {
            return Err(Error::InvalidState {
                id,
                operation: operation.to_string(),
                current_state: old_state,
            });
        }
        let holds = matches!(
            to,
            TaskState::Downloading | TaskState::Processing | TaskState::Uploading
        );
        if holds && !task.slot_held {
            return Err(Error::InvalidState {
                id,
                operation: operation.to_string(),
                current_state: old_state,
            });
        }

        let was_held = task.slot_held;
        f(task);
        task.state = to;
        if to.is_terminal() || to == TaskState::Queued {
            task.slot_held = false;
        }
        // A run ends with its slot
        let detached = if task.slot_held {
            None
        } else {
            task.control.take()
        };
        // A control operation stops the run before the lock is released
        if run.is_none()
            && let Some(control) = &detached
        {
            control.stop(stop_reason_for(to));
        }
        if to == TaskState::Queued {
            task.started_at = None;
        }
        if to != TaskState::Paused {
            task.paused_by = None;
        }
        let backend = task.backend;
        let released = was_held && !task.slot_held;
        let progress = task.progress;

        if released {
            self.release_slot(backend);
        }
        if old_state == TaskState::Queued {
            self.queue.remove(id);
        }
        if to == TaskState::Queued {
            self.enqueue(id);
        }
        self.bump(id);

        let _ = events.send(Event::StateChanged {
            id,
            old_state: Some(old_state),
            new_state: to,
            progress,
            timestamp: Utc::now(),
        });

        let (snapshot, finished) = if to.is_terminal() {
            let task = self.tasks.remove(&id);
            let snapshot = task.as_ref().map(Task::snapshot);
            (snapshot, task.map(|t| t.history_entry()))
        } else {
            (self.tasks.get(&id).map(Task::snapshot), None)
        };
        let snapshot = snapshot.ok_or(Error::NotFound(id))?;

        debug!(task_id = id.0, from = %old_state, to = %to, released, "task transitioned");
        Ok(Transitioned {
            old_state,
            snapshot,
            finished,
            detached,
        })
    }

    /// Least urgent downloading task that `head` may displace
    fn preemption_victim(&self, head: &QueuedTask, head_backend: BackendKind, limits: &Limits) -> Option<TaskId> {
        let victim = self
            .tasks
            .values()
            .filter(|t| t.state == TaskState::Downloading && t.slot_held)
            .max_by(|a, b| {
                a.priority
                    .cmp(&b.priority)
                    .then_with(|| a.created_at.cmp(&b.created_at))
                    .then_with(|| a.id.cmp(&b.id))
            })?;
        if victim.priority <= head.priority {
            return None;
        }
        let freed = usize::from(victim.backend == head_backend);
        self.backend_has_room(head_backend, limits, freed)
            .then_some(victim.id)
    }

    fn admit_one(&mut self, events: &broadcast::Sender<Event>, id: TaskId) -> Option<Admitted> {
        self.next_run += 1;
        let control = RunControl::new(self.next_run);
        let task = self.tasks.get_mut(&id)?;
        task.state = TaskState::Downloading;
        task.slot_held = true;
        task.started_at = Some(Utc::now());
        task.control = Some(control.clone());
        let backend = task.backend;
        let progress = task.progress;
        self.take_slot(backend);
        self.bump(id);

        let _ = events.send(Event::StateChanged {
            id,
            old_state: Some(TaskState::Queued),
            new_state: TaskState::Downloading,
            progress,
            timestamp: Utc::now(),
        });
        let snapshot = self.tasks.get(&id)?.snapshot();
        Some(Admitted { snapshot, control })
    }
}

/// Single owner of live task state
pub(crate) struct TaskRegistry {
    inner: Mutex<RegistryInner>,
    events: broadcast::Sender<Event>,
    next_id: AtomicI64,
}

impl TaskRegistry {
    pub(crate) fn new(events: broadcast::Sender<Event>) -> Self {
        Self {
            inner: Mutex::new(RegistryInner::default()),
            events,
            next_id: AtomicI64::new(1),
        }
    }

    /// Fresh task id
    pub(crate) fn allocate_id(&self) -> TaskId {
        TaskId(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    /// Make sure future ids are greater than `max_used`
    pub(crate) fn seed_ids(&self, max_used: i64) {
        self.next_id.fetch_max(max_used.saturating_add(1), Ordering::SeqCst);
    }

    /// Make sure future revisions are greater than `max_seen`
    pub(crate) async fn seed_revision(&self, max_seen: u64) {
        let mut inner = self.inner.lock().await;
        inner.revision = inner.revision.max(max_seen);
    }

    /// Add a new or restored task
    ///
    /// Queued tasks enter the admission heap; anything else is kept paused.
    pub(crate) async fn insert(&self, mut task: Task) -> TaskSnapshot {
        let mut inner = self.inner.lock().await;
        let id = task.id;
        if task.state != TaskState::Queued {
            task.state = TaskState::Paused;
            task.paused_by.get_or_insert(PausedBy::User);
        }
        task.slot_held = false;
        task.control = None;
        inner.revision += 1;
        task.revision = inner.revision;
        let snapshot = task.snapshot();
        inner.tasks.insert(id, task);
        if snapshot.state == TaskState::Queued {
            inner.enqueue(id);
        }
        let _ = self.events.send(Event::StateChanged {
            id,
            old_state: None,
            new_state: snapshot.state,
            progress: snapshot.progress,
            timestamp: Utc::now(),
        });
        snapshot
    }

    /// Validated state change
    ///
    /// `run` scopes the call to a worker's run; a stale run gets
    /// [`Error::Cancelled`]. `f` runs under the lock before the state is set.
    pub(crate) async fn transition(
        &self,
        id: TaskId,
        run: Option<u64>,
        operation: &str,
        to: TaskState,
        f: impl FnOnce(&mut Task),
    ) -> Result<Transitioned> {
        let mut inner = self.inner.lock().await;
        inner.transition(&self.events, id, run, operation, to, f)
    }

    /// Mutate a task owned by `run` without changing its state
    pub(crate) async fn update(
        &self,
        id: TaskId,
        run: u64,
        f: impl FnOnce(&mut Task),
    ) -> Result<TaskSnapshot> {
        let mut inner = self.inner.lock().await;
        let task = inner
            .tasks
            .get_mut(&id)
            .filter(|t| t.owned_by(run))
            .ok_or(Error::Cancelled)?;
        f(task);
        inner.bump(id);
        inner
            .tasks
            .get(&id)
            .map(Task::snapshot)
            .ok_or(Error::NotFound(id))
    }

    /// Record progress reported by a backend and publish it
    pub(crate) async fn update_progress(&self, id: TaskId, run: u64, progress: Progress) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let task = inner
            .tasks
            .get_mut(&id)
            .filter(|t| t.owned_by(run))
            .ok_or(Error::Cancelled)?;
        task.progress = progress;
        let state = task.state;
        let _ = self.events.send(Event::Progress {
            id,
            state,
            progress,
        });
        Ok(())
    }

    /// Publish the task's current progress and state
    pub(crate) async fn publish_progress(&self, id: TaskId, run: u64) -> Result<()> {
        let inner = self.inner.lock().await;
        let task = inner
            .tasks
            .get(&id)
            .filter(|t| t.owned_by(run))
            .ok_or(Error::Cancelled)?;
        let _ = self.events.send(Event::Progress {
            id,
            state: task.state,
            progress: task.progress,
        });
        Ok(())
    }

    /// Take one retry from the task's budget
    ///
    /// Returns `(attempt, max_retries)`, or None when the budget is spent or
    /// the run is stale.
    pub(crate) async fn consume_retry(&self, id: TaskId, run: u64) -> Option<(u32, u32)> {
        let mut inner = self.inner.lock().await;
        let task = inner.tasks.get_mut(&id).filter(|t| t.owned_by(run))?;
        if task.retry_count >= task.max_retries {
            return None;
        }
        task.retry_count += 1;
        let granted = (task.retry_count, task.max_retries);
        inner.bump(id);
        Some(granted)
    }

    /// Hand free slots to queued tasks
    ///
    /// Pops in `(priority, created_at, id)` order. Entries blocked only by
    /// their backend's limit are skipped and kept.
    pub(crate) async fn admit(&self, limits: &Limits) -> AdmitOutcome {
        let mut inner = self.inner.lock().await;
        let mut outcome = AdmitOutcome::default();
        if inner.freeze.any() {
            return outcome;
        }

        let mut blocked = Vec::new();
        while let Some(head) = inner.queue.peek().cloned() {
            let backend = match inner.tasks.get(&head.id) {
                Some(task) if task.state == TaskState::Queued && task.priority == head.priority => {
                    task.backend
                }
                // Stale entry
                _ => {
                    inner.queue.pop();
                    continue;
                }
            };

            if !inner.backend_has_room(backend, limits, 0) {
                if let Some(entry) = inner.queue.pop() {
                    blocked.push(entry);
                }
                continue;
            }

            if inner.active >= limits.global {
                if limits.preemption == PreemptionPolicy::RequeueLowest
                    && let Some(victim) = inner.preemption_victim(&head, backend, limits)
                {
                    match inner.transition(&self.events, victim, None, "requeue", TaskState::Queued, |t| {
                        t.backend_handle = None;
                        t.progress = Progress::default();
                    }) {
                        Ok(requeued) => {
                            info!(
                                task_id = victim.0,
                                by = head.id.0,
                                "task requeued for a more urgent one"
                            );
                            outcome.preempted.push(requeued);
                            continue;
                        }
                        Err(e) => debug!(task_id = victim.0, error = %e, "preemption skipped"),
                    }
                }
                break;
            }

            inner.queue.pop();
            if let Some(admitted) = inner.admit_one(&self.events, head.id) {
                info!(task_id = head.id.0, backend = %backend, priority = head.priority.0, "task admitted");
                outcome.admitted.push(admitted);
            }
        }

        for entry in blocked {
            inner.queue.push(entry);
        }
        outcome
    }

    /// Change a task's priority
    ///
    /// Queued tasks are re-heaped; active tasks keep the new value for their
    /// next admission.
    pub(crate) async fn set_priority(&self, id: TaskId, priority: Priority) -> Result<TaskSnapshot> {
        let mut inner = self.inner.lock().await;
        let task = inner.tasks.get_mut(&id).ok_or(Error::NotFound(id))?;
        if !matches!(
            task.state,
            TaskState::Queued | TaskState::Downloading | TaskState::Paused
        ) {
            return Err(Error::InvalidState {
                id,
                operation: "reprioritize".to_string(),
                current_state: task.state,
            });
        }
        task.priority = priority;
        if task.state == TaskState::Queued {
            inner.queue.remove(id);
            inner.enqueue(id);
        }
        inner.bump(id);
        inner
            .tasks
            .get(&id)
            .map(Task::snapshot)
            .ok_or(Error::NotFound(id))
    }

    pub(crate) async fn get(&self, id: TaskId) -> Option<TaskSnapshot> {
        self.inner.lock().await.tasks.get(&id).map(Task::snapshot)
    }

    /// Read fields of a live task
    pub(crate) async fn inspect<R>(&self, id: TaskId, f: impl FnOnce(&Task) -> R) -> Option<R> {
        self.inner.lock().await.tasks.get(&id).map(f)
    }

    /// Live tasks, most urgent first
    pub(crate) async fn list(&self) -> Vec<TaskSnapshot> {
        let inner = self.inner.lock().await;
        let mut tasks: Vec<_> = inner.tasks.values().map(Task::snapshot).collect();
        tasks.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then_with(|| a.created_at.cmp(&b.created_at))
                .then_with(|| a.id.cmp(&b.id))
        });
        tasks
    }

    /// Ids of tasks currently in `state`
    pub(crate) async fn ids_in(&self, state: TaskState) -> Vec<TaskId> {
        let inner = self.inner.lock().await;
        let mut ids: Vec<_> = inner
            .tasks
            .values()
            .filter(|t| t.state == state)
            .map(|t| t.id)
            .collect();
        ids.sort();
        ids
    }

    /// Downloading tasks with a registered backend job, plus `resuming`
    pub(crate) async fn downloading_jobs(
        &self,
        resuming: Option<TaskId>,
    ) -> Vec<(TaskId, BackendKind, u64, BackendHandle)> {
        let inner = self.inner.lock().await;
        let mut jobs: Vec<_> = inner
            .tasks
            .values()
            .filter(|t| t.state == TaskState::Downloading || Some(t.id) == resuming)
            .filter_map(|t| {
                t.backend_handle
                    .clone()
                    .map(|h| (t.id, t.backend, t.bandwidth_cap_bps, h))
            })
            .collect();
        jobs.sort_by_key(|(id, ..)| *id);
        jobs
    }

    pub(crate) async fn stats(&self, global_limit: usize) -> QueueStats {
        let inner = self.inner.lock().await;
        let mut stats = QueueStats {
            active_slots: inner.active,
            global_limit,
            paused_all: inner.freeze.paused_all || inner.freeze.pressure,
            accepting_new: !inner.freeze.shutting_down,
            ..QueueStats::default()
        };
        for task in inner.tasks.values() {
            match task.state {
                TaskState::Queued => stats.queued += 1,
                TaskState::Downloading => stats.downloading += 1,
                TaskState::Paused => stats.paused += 1,
                TaskState::Processing => stats.processing += 1,
                TaskState::Uploading => stats.uploading += 1,
                _ => {}
            }
        }
        stats
    }

    /// Freeze or unfreeze admission for `pause_all`; returns whether it changed
    pub(crate) async fn set_paused_all(&self, paused: bool) -> bool {
        let mut inner = self.inner.lock().await;
        let changed = inner.freeze.paused_all != paused;
        inner.freeze.paused_all = paused;
        changed
    }

    /// Freeze or unfreeze admission for resource pressure; returns whether it changed
    pub(crate) async fn set_pressure(&self, pressure: bool) -> bool {
        let mut inner = self.inner.lock().await;
        let changed = inner.freeze.pressure != pressure;
        inner.freeze.pressure = pressure;
        changed
    }

    pub(crate) async fn is_frozen(&self) -> bool {
        self.inner.lock().await.freeze.any()
    }

    /// Stop admitting and return every live run, stopped with `reason`
    pub(crate) async fn stop_all(&self, reason: StopReason) -> Vec<RunControl> {
        let mut inner = self.inner.lock().await;
        inner.freeze.shutting_down = true;
        let controls: Vec<_> = inner
            .tasks
            .values()
            .filter_map(|t| t.control.clone())
            .collect();
        for control in &controls {
            control.stop(reason);
        }
        controls
    }

    pub(crate) async fn is_shutting_down(&self) -> bool {
        self.inner.lock().await.freeze.shutting_down
    }

    /// Slots currently held, in total and per backend
    #[cfg(test)]
    pub(crate) async fn slots(&self) -> (usize, HashMap<BackendKind, usize>) {
        let inner = self.inner.lock().await;
        (inner.active, inner.active_by_backend.clone())
    }
}
