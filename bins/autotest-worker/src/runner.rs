/// Job runner
///
/// Takes one popped job id through start → execute → finish. The start
/// transition is what hands the job's working directory over to this worker;
/// from then on the worker, not the dispatcher, removes it.

use anyhow::Result;
use autotest_common::redis;
use autotest_common::storage::FsScriptStore;
use autotest_common::types::{EnqueuedJob, JobKind, JobState, RunRequest, SpecsUpdate};
use autotest_common::workdir::remove_dir_idempotent;
use chrono::Utc;
use serde_json::{json, Value};
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::engine::ExecutionEngine;
use crate::metrics;

/// Run a job this worker popped from `queue`, recording its terminal state.
pub async fn process_job<E: ExecutionEngine>(
    conn: &mut ::redis::aio::ConnectionManager,
    engine: &E,
    store: &FsScriptStore,
    queue: &str,
    id: &str,
) -> Result<()> {
    if !redis::start_job(conn, id).await? {
        info!(job_id = id, queue, "Skipping job that is no longer pending");
        metrics::record_job_skipped(queue);
        return Ok(());
    }
    let Some(job) = redis::load_job(conn, id).await? else {
        warn!(job_id = id, "Started job vanished before it could be loaded");
        return Ok(());
    };

    metrics::record_job_started(queue, queue_wait_secs(&job));
    info!(
        job_id = id,
        queue,
        kind = job.kind.as_str(),
        timeout_secs = ?job.timeout_secs,
        "Running job"
    );

    let started = Instant::now();
    let (state, result) = execute(engine, store, &job).await;
    let elapsed = started.elapsed().as_secs_f64();

    redis::finish_job(conn, id, state, &result).await?;
    metrics::record_job_completed(queue, state.as_str(), elapsed);
    info!(job_id = id, state = %state, elapsed_secs = elapsed, "Job done");
    Ok(())
}

/// Seconds between the dispatcher's enqueue stamp and now.
fn queue_wait_secs(job: &EnqueuedJob) -> Option<f64> {
    let request: RunRequest = serde_json::from_value(job.payload.clone()).ok()?;
    let enqueued = request.enqueue_time?;
    Some((Utc::now() - enqueued).num_milliseconds().max(0) as f64 / 1000.0)
}

/// Execute a running job. Never fails: problems become a `failed` result.
pub async fn execute<E: ExecutionEngine>(
    engine: &E,
    store: &FsScriptStore,
    job: &EnqueuedJob,
) -> (JobState, Value) {
    match job.kind {
        JobKind::TestRun => run_tests(engine, job).await,
        JobKind::UpdateSpecs => install_specs(store, job),
    }
}

async fn run_tests<E: ExecutionEngine>(engine: &E, job: &EnqueuedJob) -> (JobState, Value) {
    let workdir = job.files_path();
    let run = engine.run(&job.payload, workdir.as_deref());
    let outcome = match job.timeout_secs {
        Some(secs) => tokio::time::timeout(Duration::from_secs(secs), run)
            .await
            .ok(),
        None => Some(run.await),
    };

    if let Some(dir) = &workdir {
        if let Err(e) = remove_dir_idempotent(dir) {
            warn!(job_id = %job.id, path = %dir.display(), error = %e, "Failed to remove working directory");
        }
    }

    match outcome {
        None => (
            JobState::Failed,
            json!({"status": "timeout", "timeout_secs": job.timeout_secs}),
        ),
        Some(Err(e)) => (
            JobState::Failed,
            json!({"status": "error", "error": format!("{:#}", e)}),
        ),
        Some(Ok(output)) => {
            let (state, status) = if output.success() {
                (JobState::Finished, "ok")
            } else {
                (JobState::Failed, "tester_error")
            };
            (
                state,
                json!({
                    "status": status,
                    "exit_code": output.exit_code,
                    "stdout": output.stdout,
                    "stderr": output.stderr,
                }),
            )
        }
    }
}

fn install_specs(store: &FsScriptStore, job: &EnqueuedJob) -> (JobState, Value) {
    let installed = SpecsUpdate::from_value(job.payload.clone()).and_then(|update| {
        store.install_specs(
            &update.origin,
            update.assignment_id,
            &update.specs,
            update.files_path.as_deref(),
        )
    });
    match installed {
        Ok(dir) => (
            JobState::Finished,
            json!({"status": "ok", "dir": dir}),
        ),
        Err(e) => {
            if let Some(upload) = job.files_path() {
                if let Err(e) = remove_dir_idempotent(&upload) {
                    warn!(job_id = %job.id, path = %upload.display(), error = %e, "Failed to remove uploaded scripts");
                }
            }
            (
                JobState::Failed,
                json!({"status": "error", "error": e.to_string()}),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineOutput;
    use autotest_common::storage::TestScriptStore;
    use std::path::Path;

    struct EchoEngine;

    impl ExecutionEngine for EchoEngine {
        async fn run(&self, payload: &Value, _workdir: Option<&Path>) -> Result<EngineOutput> {
            Ok(EngineOutput {
                exit_code: Some(0),
                stdout: payload["run_id"].to_string(),
                stderr: String::new(),
            })
        }
    }

    struct SlowEngine;

    impl ExecutionEngine for SlowEngine {
        async fn run(&self, _payload: &Value, _workdir: Option<&Path>) -> Result<EngineOutput> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            anyhow::bail!("unreachable")
        }
    }

    fn running_job(kind: JobKind, payload: Value, timeout_secs: Option<u64>) -> EnqueuedJob {
        EnqueuedJob {
            id: "o_1".to_string(),
            queue: "student".to_string(),
            kind,
            payload,
            timeout_secs,
            state: JobState::Running,
            enqueued_at: Utc::now(),
            result: None,
        }
    }

    #[tokio::test]
    async fn test_successful_run_cleans_workdir() {
        let root = tempfile::tempdir().unwrap();
        let workdir = root.path().join("run");
        std::fs::create_dir_all(&workdir).unwrap();
        let store = FsScriptStore::new(root.path().join("scripts"));
        let job = running_job(
            JobKind::TestRun,
            json!({"run_id": 1, "files_path": workdir}),
            Some(30),
        );

        let (state, result) = execute(&EchoEngine, &store, &job).await;
        assert_eq!(state, JobState::Finished);
        assert_eq!(result["status"], json!("ok"));
        assert_eq!(result["stdout"], json!("1"));
        assert!(!workdir.exists());
    }

    #[tokio::test]
    async fn test_timeout_marks_job_failed() {
        let root = tempfile::tempdir().unwrap();
        let store = FsScriptStore::new(root.path());
        let job = running_job(JobKind::TestRun, json!({"run_id": 1}), Some(1));

        let (state, result) = execute(&SlowEngine, &store, &job).await;
        assert_eq!(state, JobState::Failed);
        assert_eq!(result["status"], json!("timeout"));
        assert_eq!(result["timeout_secs"], json!(1));
    }

    #[tokio::test]
    async fn test_update_specs_job_installs_document() {
        let root = tempfile::tempdir().unwrap();
        let store = FsScriptStore::new(root.path());
        let job = running_job(
            JobKind::UpdateSpecs,
            json!({
                "origin": "o",
                "assignment_id": 3,
                "specs": {"testers": [{"test_data": [{"category": ["a"], "timeout": 4}]}]}
            }),
            None,
        );

        let (state, _) = execute(&EchoEngine, &store, &job).await;
        assert_eq!(state, JobState::Finished);
        let specs = store.load_specs("o", 3).unwrap();
        assert_eq!(specs.testers[0].test_data[0].timeout, Some(4));
    }

    #[tokio::test]
    async fn test_malformed_update_specs_job_fails() {
        let root = tempfile::tempdir().unwrap();
        let store = FsScriptStore::new(root.path());
        let job = running_job(JobKind::UpdateSpecs, json!({"origin": "o"}), None);
        let (state, result) = execute(&EchoEngine, &store, &job).await;
        assert_eq!(state, JobState::Failed);
        assert_eq!(result["status"], json!("error"));
    }

    #[tokio::test]
    async fn test_failed_install_removes_upload() {
        let root = tempfile::tempdir().unwrap();
        let store = FsScriptStore::new(root.path().join("scripts"));
        let upload = root.path().join("upload");
        std::fs::create_dir_all(&upload).unwrap();
        std::fs::write(upload.join("test.py"), "").unwrap();
        // a file where the origin directory should go makes the install fail
        std::fs::create_dir_all(root.path().join("scripts")).unwrap();
        std::fs::write(root.path().join("scripts").join("o"), "").unwrap();

        let job = running_job(
            JobKind::UpdateSpecs,
            json!({
                "origin": "o",
                "assignment_id": 3,
                "specs": {"testers": []},
                "files_path": upload
            }),
            None,
        );
        let (state, result) = execute(&EchoEngine, &store, &job).await;
        assert_eq!(state, JobState::Failed);
        assert_eq!(result["status"], json!("error"));
        assert!(!upload.exists());
    }

    #[test]
    fn test_queue_wait_from_payload() {
        let mut job = running_job(JobKind::TestRun, json!({}), Some(1));
        assert_eq!(queue_wait_secs(&job), None);

        job.payload = json!({
            "origin": "o",
            "run_id": 1,
            "user_type": "admin",
            "assignment_id": 1,
            "test_categories": ["a"],
            "enqueue_time": (Utc::now() - chrono::Duration::seconds(10)).to_rfc3339()
        });
        let wait = queue_wait_secs(&job).unwrap();
        assert!((9.0..=60.0).contains(&wait), "{wait}");
    }
}
