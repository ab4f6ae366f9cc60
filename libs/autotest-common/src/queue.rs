//! Queue runtime seam
//!
//! The dispatch layer only needs a handful of operations from whatever holds
//! pending jobs. `RedisQueue` (see `crate::redis`) is the production backend,
//! `MemoryQueue` keeps everything in process.

use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use crate::error::{AutotestError, Result};
use crate::types::{EnqueuedJob, JobState, NewJob};

pub trait QueueRuntime {
    /// Store `job` as pending at the tail of its queue.
    ///
    /// Fails with `DuplicateJob` when a job with the same id is already known.
    fn enqueue(&self, job: NewJob) -> Result<()>;

    fn fetch(&self, id: &str) -> Result<Option<EnqueuedJob>>;

    /// Move a pending job to cancelled and drop it from its queue.
    ///
    /// Returns `false` when the job was no longer pending, e.g. a worker
    /// picked it up in the meantime.
    fn cancel(&self, job: &EnqueuedJob) -> Result<bool>;

    fn count(&self, queue: &str) -> Result<u64>;

    /// Mean seconds between pops during the current burst.
    fn average_pop_interval(&self, queue: &str) -> Result<Option<f64>>;
}

/// Mean gap between consecutive timestamps, in either order.
pub fn mean_interval(timestamps: &[f64]) -> Option<f64> {
    if timestamps.len() < 2 {
        return None;
    }
    let gaps: f64 = timestamps.windows(2).map(|w| (w[1] - w[0]).abs()).sum();
    Some(gaps / (timestamps.len() - 1) as f64)
}

#[derive(Debug, Default)]
struct MemoryState {
    jobs: HashMap<String, EnqueuedJob>,
    queues: HashMap<String, VecDeque<String>>,
    pops: HashMap<String, Vec<f64>>,
}

/// In-process queue runtime
#[derive(Debug, Default)]
pub struct MemoryQueue {
    state: Mutex<MemoryState>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        // A panic while holding the lock leaves plain data behind, still usable
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Take the oldest pending job from `queue` and mark it running.
    pub fn pop(&self, queue: &str) -> Option<EnqueuedJob> {
        let mut state = self.lock();
        let id = state.queues.get_mut(queue)?.pop_front()?;
        let drained = state.queues.get(queue).map_or(true, VecDeque::is_empty);
        let now = Utc::now().timestamp_millis() as f64 / 1000.0;
        if drained {
            state.pops.remove(queue);
        } else {
            state.pops.entry(queue.to_string()).or_default().push(now);
        }
        let job = state.jobs.get_mut(&id)?;
        job.state = JobState::Running;
        Some(job.clone())
    }

    /// Record a terminal state for a job a caller popped.
    pub fn complete(&self, id: &str, state: JobState) -> bool {
        match self.lock().jobs.get_mut(id) {
            Some(job) => {
                job.state = state;
                true
            }
            None => false,
        }
    }

    /// Forget a job entirely, as an expired record would be.
    pub fn reap(&self, id: &str) -> Option<EnqueuedJob> {
        self.lock().jobs.remove(id)
    }

    pub fn record_pops(&self, queue: &str, timestamps: &[f64]) {
        self.lock()
            .pops
            .insert(queue.to_string(), timestamps.to_vec());
    }
}

impl QueueRuntime for MemoryQueue {
    fn enqueue(&self, job: NewJob) -> Result<()> {
        let mut state = self.lock();
        if state.jobs.contains_key(&job.id) {
            return Err(AutotestError::DuplicateJob(job.id));
        }
        state
            .queues
            .entry(job.queue.clone())
            .or_default()
            .push_back(job.id.clone());
        state
            .jobs
            .insert(job.id.clone(), EnqueuedJob::from_new(job, Utc::now()));
        Ok(())
    }

    fn fetch(&self, id: &str) -> Result<Option<EnqueuedJob>> {
        Ok(self.lock().jobs.get(id).cloned())
    }

    fn cancel(&self, job: &EnqueuedJob) -> Result<bool> {
        let mut state = self.lock();
        match state.jobs.get_mut(&job.id) {
            Some(stored) if stored.state == JobState::Pending => {
                stored.state = JobState::Cancelled;
            }
            _ => return Ok(false),
        }
        if let Some(queue) = state.queues.get_mut(&job.queue) {
            queue.retain(|id| id != &job.id);
        }
        Ok(true)
    }

    fn count(&self, queue: &str) -> Result<u64> {
        Ok(self.lock().queues.get(queue).map_or(0, |q| q.len() as u64))
    }

    fn average_pop_interval(&self, queue: &str) -> Result<Option<f64>> {
        Ok(self
            .lock()
            .pops
            .get(queue)
            .and_then(|timestamps| mean_interval(timestamps)))
    }
}
