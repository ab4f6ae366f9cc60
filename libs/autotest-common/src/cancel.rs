//! Cancellation Manager
//!
//! Cancels queued-but-not-started runs and reclaims their working
//! directories. Running jobs are left alone and missing jobs are not errors,
//! so repeating a cancellation is always safe. Every id in a batch is
//! attempted; one miss does not stop the rest.

use serde::Serialize;
use tracing::{info, warn};

use crate::error::Result;
use crate::identity::format_id;
use crate::queue::QueueRuntime;
use crate::types::JobState;
use crate::workdir::remove_dir_idempotent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "state", rename_all = "snake_case")]
pub enum CancelOutcome {
    /// Was pending, is now cancelled
    Cancelled,
    /// Unknown id, or a record that already expired
    NotFound,
    /// Already picked up or done; left as is
    NotPending(JobState),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CancelReport {
    pub run_id: u64,
    pub job_id: String,
    #[serde(flatten)]
    pub outcome: CancelOutcome,
}

pub fn cancel_runs<Q: QueueRuntime>(
    queue: &Q,
    origin: &str,
    run_ids: &[u64],
) -> Result<Vec<CancelReport>> {
    run_ids
        .iter()
        .map(|&run_id| {
            let job_id = format_id(origin, run_id);
            let outcome = cancel_one(queue, &job_id)?;
            Ok(CancelReport {
                run_id,
                job_id,
                outcome,
            })
        })
        .collect()
}

fn cancel_one<Q: QueueRuntime>(queue: &Q, job_id: &str) -> Result<CancelOutcome> {
    let Some(job) = queue.fetch(job_id)? else {
        return Ok(CancelOutcome::NotFound);
    };
    if job.state != JobState::Pending {
        return Ok(CancelOutcome::NotPending(job.state));
    }

    if !queue.cancel(&job)? {
        // Lost the race against a worker (or another canceller)
        let state = queue.fetch(job_id)?.map(|j| j.state);
        return Ok(match state {
            Some(state) => CancelOutcome::NotPending(state),
            None => CancelOutcome::NotFound,
        });
    }

    if let Some(path) = job.files_path() {
        if let Err(e) = remove_dir_idempotent(&path) {
            warn!(job_id, path = %path.display(), error = %e, "Failed to remove working directory");
        }
    }
    info!(job_id, queue = %job.queue, "Cancelled job");
    Ok(CancelOutcome::Cancelled)
}
