//! Bandwidth policy
//!
//! The global cap is enforced two ways. In-process transfers draw from the
//! shared [`TokenBucket`]. Backends that can throttle a single job receive an
//! allotment of `min(task_cap, global / n)` where `n` is the number of
//! downloading tasks on cap-capable backends; allotments are recomputed
//! whenever that set or the global cap changes. Backends that cannot throttle
//! are left alone, so the global cap is a soft ceiling for them.

mod bucket;

pub use bucket::TokenBucket;

use crate::backend::{BackendAdapter, BackendHandle};
use crate::error::Error;
use crate::types::TaskId;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// A downloading task on a cap-capable backend
#[derive(Clone)]
pub struct ShareCandidate {
    /// Task ID
    pub id: TaskId,
    /// Task's own cap (0 = unlimited)
    pub task_cap: u64,
    /// Adapter running the task
    pub adapter: Arc<dyn BackendAdapter>,
    /// The task's backend job
    pub handle: BackendHandle,
}

/// Per-task allotments for a set of tasks sharing the global cap
///
/// Without a global cap each task keeps its own cap. With one, every task gets
/// an equal share, lowered to its own cap when that is smaller; shares are
/// never 0 since 0 means unlimited.
pub fn compute_allotments(global_bps: Option<u64>, tasks: &[(TaskId, u64)]) -> Vec<(TaskId, u64)> {
    let Some(global) = global_bps.filter(|g| *g > 0) else {
        return tasks.to_vec();
    };
    if tasks.is_empty() {
        return Vec::new();
    }
    let share = (global / tasks.len() as u64).max(1);
    tasks
        .iter()
        .map(|&(id, cap)| (id, if cap > 0 { cap.min(share) } else { share }))
        .collect()
}

/// Treats 0 (unlimited) as larger than any cap
fn effective(bps: u64) -> u64 {
    if bps == 0 { u64::MAX } else { bps }
}

/// Global bucket plus the per-task allotments currently applied
#[derive(Clone)]
pub struct BandwidthLimiter {
    global: TokenBucket,
    applied: Arc<Mutex<HashMap<TaskId, u64>>>,
}

impl BandwidthLimiter {
    /// Limiter with the given global cap (None = unlimited)
    pub fn new(global_bps: Option<u64>) -> Self {
        Self {
            global: TokenBucket::new(global_bps),
            applied: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// The shared bucket for in-process transfers
    pub fn global(&self) -> TokenBucket {
        self.global.clone()
    }

    /// Current global cap
    pub fn limit(&self) -> Option<u64> {
        self.global.rate()
    }

    /// Change the global cap; call [`rebalance`](Self::rebalance) afterwards
    pub fn set_limit(&self, limit_bps: Option<u64>) {
        self.global.set_rate(limit_bps.filter(|l| *l > 0));
    }

    /// Allotments currently applied, by task
    pub async fn applied(&self) -> HashMap<TaskId, u64> {
        self.applied.lock().await.clone()
    }

    /// Drop bookkeeping for a task that stopped downloading
    pub async fn forget(&self, id: TaskId) {
        self.applied.lock().await.remove(&id);
    }

    /// Recompute and apply allotments for `candidates`
    ///
    /// Decreases are applied before increases so the applied sum never
    /// exceeds the global cap in between. Returns the allotments that changed.
    pub async fn rebalance(&self, candidates: Vec<ShareCandidate>) -> Vec<(TaskId, u64)> {
        // Held across the adapter calls so concurrent rebalances apply in order
        let mut applied = self.applied.lock().await;

        let present: HashSet<TaskId> = candidates.iter().map(|c| c.id).collect();
        applied.retain(|id, _| present.contains(id));

        let shares: Vec<(TaskId, u64)> = candidates.iter().map(|c| (c.id, c.task_cap)).collect();
        let targets: HashMap<TaskId, u64> =
            compute_allotments(self.limit(), &shares).into_iter().collect();

        let mut decreases = Vec::new();
        let mut increases = Vec::new();
        for candidate in &candidates {
            let target = targets.get(&candidate.id).copied().unwrap_or(0);
            // A job nobody capped yet runs unlimited
            let current = applied.get(&candidate.id).copied().unwrap_or(0);
            match effective(target).cmp(&effective(current)) {
                std::cmp::Ordering::Less => decreases.push((candidate, target)),
                std::cmp::Ordering::Greater => increases.push((candidate, target)),
                std::cmp::Ordering::Equal => {}
            }
        }

        let mut changed = Vec::new();
        for (candidate, bps) in decreases.into_iter().chain(increases) {
            match candidate
                .adapter
                .apply_bandwidth_cap(&candidate.handle, bps)
                .await
            {
                Ok(()) => {
                    debug!(task_id = candidate.id.0, bps, "bandwidth allotment applied");
                    applied.insert(candidate.id, bps);
                    changed.push((candidate.id, bps));
                }
                Err(Error::Unsupported { .. }) => {
                    debug!(task_id = candidate.id.0, "backend cannot cap this job");
                }
                Err(e) => {
                    warn!(task_id = candidate.id.0, bps, error = %e, "failed to apply bandwidth allotment");
                }
            }
        }
        changed
    }
}
