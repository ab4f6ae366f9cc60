use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;

use crate::error::{AutotestError, Result};

/// Who asked for the run. Drives queue routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserType {
    Admin,
    Student,
}

impl fmt::Display for UserType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UserType::Admin => write!(f, "admin"),
            UserType::Student => write!(f, "student"),
        }
    }
}

/// Test run request (argument bundle of the `run` operation)
///
/// Fields not named here are kept in `extra` and forwarded verbatim to the
/// execution engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRequest {
    pub origin: String,
    pub run_id: u64,
    pub user_type: UserType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<u64>,
    pub assignment_id: u64,
    pub test_categories: BTreeSet<String>,
    /// Scratch directory holding the submission files. Owned by the job.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub files_path: Option<PathBuf>,
    /// Set by the dispatcher when the job is enqueued.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enqueue_time: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl RunRequest {
    /// Structural check of a raw argument bundle.
    pub fn from_value(raw: Value) -> Result<Self> {
        let request: RunRequest = serde_json::from_value(raw)
            .map_err(|e| AutotestError::JobArgument(e.to_string()))?;
        if request.origin.is_empty() {
            return Err(AutotestError::JobArgument("origin must not be empty".to_string()));
        }
        if request.test_categories.is_empty() {
            return Err(AutotestError::JobArgument(
                "test_categories must name at least one category".to_string(),
            ));
        }
        Ok(request)
    }
}

/// Argument bundle of the `specs` operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SpecsUpdate {
    pub origin: String,
    pub assignment_id: u64,
    pub specs: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub files_path: Option<PathBuf>,
}

impl SpecsUpdate {
    pub fn from_value(raw: Value) -> Result<Self> {
        let update: SpecsUpdate = serde_json::from_value(raw)
            .map_err(|e| AutotestError::JobArgument(e.to_string()))?;
        if update.origin.is_empty() {
            return Err(AutotestError::JobArgument("origin must not be empty".to_string()));
        }
        Ok(update)
    }
}

/// Argument bundle of the `cancel` operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelRequest {
    pub origin: String,
    pub run_ids: Vec<u64>,
}

/// Declared per-test timeout when a test-data entry omits one (seconds).
pub const DEFAULT_TEST_TIMEOUT_SECS: u64 = 30;

/// Stored test specification for one assignment (read-only here)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TestSpecs {
    #[serde(default)]
    pub testers: Vec<TesterSpec>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TesterSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tester_type: Option<String>,
    #[serde(default)]
    pub test_data: Vec<TestData>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TestData {
    #[serde(default)]
    pub category: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl TestData {
    pub fn timeout_secs(&self) -> u64 {
        self.timeout.unwrap_or(DEFAULT_TEST_TIMEOUT_SECS)
    }
}

/// What a queued job asks the worker to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    TestRun,
    UpdateSpecs,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::TestRun => "test_run",
            JobKind::UpdateSpecs => "update_specs",
        }
    }

    pub fn parse(s: &str) -> Option<JobKind> {
        match s {
            "test_run" => Some(JobKind::TestRun),
            "update_specs" => Some(JobKind::UpdateSpecs),
            _ => None,
        }
    }
}

/// Job lifecycle
///
/// Pending jobs belong to the dispatch layer, everything after
/// `Running` belongs to the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Running,
    Finished,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Running => "running",
            JobState::Finished => "finished",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<JobState> {
        match s {
            "pending" => Some(JobState::Pending),
            "running" => Some(JobState::Running),
            "finished" => Some(JobState::Finished),
            "failed" => Some(JobState::Failed),
            "cancelled" => Some(JobState::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Finished | JobState::Failed | JobState::Cancelled)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A job about to be handed to the queue runtime.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub id: String,
    pub queue: String,
    pub kind: JobKind,
    pub payload: Value,
    pub timeout_secs: Option<u64>,
}

/// A job as stored by the queue runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnqueuedJob {
    pub id: String,
    pub queue: String,
    pub kind: JobKind,
    pub payload: Value,
    pub timeout_secs: Option<u64>,
    pub state: JobState,
    pub enqueued_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
}

impl EnqueuedJob {
    pub fn from_new(job: NewJob, enqueued_at: DateTime<Utc>) -> Self {
        Self {
            id: job.id,
            queue: job.queue,
            kind: job.kind,
            payload: job.payload,
            timeout_secs: job.timeout_secs,
            state: JobState::Pending,
            enqueued_at,
            result: None,
        }
    }

    /// Working directory reserved by the job, if its payload names one.
    pub fn files_path(&self) -> Option<PathBuf> {
        files_path_of(&self.payload)
    }
}

/// Pull `files_path` out of an argument bundle without validating the rest.
pub fn files_path_of(raw: &Value) -> Option<PathBuf> {
    raw.get("files_path")
        .and_then(Value::as_str)
        .filter(|p| !p.is_empty())
        .map(PathBuf::from)
}

/// Queue depth snapshot reported to callers after routing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueInfo {
    pub count: u64,
    pub pop_interval: Option<f64>,
    pub estimated_wait: Option<f64>,
}

impl QueueInfo {
    pub fn new(count: u64, pop_interval: Option<f64>) -> Self {
        Self {
            count,
            pop_interval,
            estimated_wait: pop_interval.map(|interval| count as f64 * interval),
        }
    }
}
