//! Dispatcher
//!
//! Single entry point for starting jobs. Every submission is checked,
//! routed and given a timeout before anything reaches the queue runtime; a
//! rejected submission never leaves its working directory behind.

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use std::path::Path;
use tracing::{info, warn};
use uuid::Uuid;

use crate::cancel::{cancel_runs, CancelReport};
use crate::config::Settings;
use crate::error::{AutotestError, Result};
use crate::identity::format_id;
use crate::queue::QueueRuntime;
use crate::registry::QueueRegistry;
use crate::storage::TestScriptStore;
use crate::timeout::TimeoutPolicy;
use crate::types::{files_path_of, JobKind, NewJob, QueueInfo, RunRequest, SpecsUpdate};
use crate::validate::SpecValidator;
use crate::workdir::WorkDirGuard;

/// Immutable dispatch configuration, built once per process
pub struct DispatchConfig {
    pub registry: QueueRegistry,
    pub policy: TimeoutPolicy,
    pub validator: SpecValidator,
    pub service_queue: String,
}

impl DispatchConfig {
    pub fn from_settings(settings: &Settings, timeout_multiplier: f64) -> Result<Self> {
        let registry = QueueRegistry::new(settings.queues.clone())?;
        if registry.queue_names().any(|name| name == settings.service_queue) {
            return Err(AutotestError::Config(format!(
                "service queue '{}' is also a test queue",
                settings.service_queue
            )));
        }
        Ok(Self {
            registry,
            policy: TimeoutPolicy::new(timeout_multiplier)?,
            validator: SpecValidator::new(settings.specs_schema()?)?,
            service_queue: settings.service_queue.clone(),
        })
    }
}

/// Outcome of a successful `submit`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Submission {
    pub job_id: String,
    pub queue: String,
    pub timeout_secs: u64,
    pub queue_info: Option<QueueInfo>,
}

pub struct Dispatcher<Q, S> {
    config: DispatchConfig,
    queue: Q,
    store: S,
}

impl<Q: QueueRuntime, S: TestScriptStore> Dispatcher<Q, S> {
    pub fn new(config: DispatchConfig, queue: Q, store: S) -> Self {
        Self {
            config,
            queue,
            store,
        }
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    pub fn queue(&self) -> &Q {
        &self.queue
    }

    /// Submit a test run described by a raw argument bundle.
    ///
    /// On any error the request's `files_path` is removed before returning.
    pub fn submit(&self, args: Value) -> Result<Submission> {
        let workdir = WorkDirGuard::new(files_path_of(&args));
        match self.enqueue_run(args) {
            Ok(submission) => {
                // The job owns the directory now
                workdir.disarm();
                Ok(submission)
            }
            Err(AutotestError::DuplicateJob(job_id)) => {
                if self.claimed_by_existing(&job_id, workdir.path()) {
                    workdir.disarm();
                }
                Err(AutotestError::DuplicateJob(job_id))
            }
            Err(e) => Err(e),
        }
    }

    /// Whether the job already stored under `job_id` uses `path`. A retried
    /// submission names the same directory as the job it duplicates.
    fn claimed_by_existing(&self, job_id: &str, path: Option<&Path>) -> bool {
        let Some(path) = path else {
            return false;
        };
        match self.queue.fetch(job_id) {
            Ok(Some(existing)) => existing.files_path().as_deref() == Some(path),
            Ok(None) => false,
            Err(e) => {
                // Unknown owner; leave the directory alone
                warn!(job_id, error = %e, "Could not inspect duplicate job");
                true
            }
        }
    }

    fn enqueue_run(&self, args: Value) -> Result<Submission> {
        let mut request = RunRequest::from_value(args)?;

        if self
            .store
            .find_test_scripts(&request.origin, request.assignment_id)?
            .is_none()
        {
            return Err(AutotestError::TestScriptFiles);
        }
        let specs = self.store.load_specs(&request.origin, request.assignment_id)?;

        let queue = self.config.registry.select(&request)?.to_string();
        let queue_info = self.queue_info(&queue);

        let timeout_secs = self
            .config
            .policy
            .compute(&specs, &request.test_categories)?;

        let job_id = format_id(&request.origin, request.run_id);
        request.enqueue_time = Some(Utc::now());
        self.queue.enqueue(NewJob {
            id: job_id.clone(),
            queue: queue.clone(),
            kind: JobKind::TestRun,
            payload: serde_json::to_value(&request)?,
            timeout_secs: Some(timeout_secs),
        })?;

        info!(
            job_id = %job_id,
            queue = %queue,
            timeout_secs,
            categories = ?request.test_categories,
            "Enqueued test run"
        );

        Ok(Submission {
            job_id,
            queue,
            timeout_secs,
            queue_info,
        })
    }

    /// Queue an update of an assignment's stored test specification.
    ///
    /// Returns the id of the service job.
    pub fn update_specs(&self, args: Value) -> Result<String> {
        let files = WorkDirGuard::new(files_path_of(&args));
        let job_id = self.enqueue_specs_update(args)?;
        files.disarm();
        Ok(job_id)
    }

    fn enqueue_specs_update(&self, args: Value) -> Result<String> {
        let update = SpecsUpdate::from_value(args)?;
        self.config.validator.check(&update.specs)?;

        let job_id = format!("specs_{}", Uuid::new_v4());
        self.queue.enqueue(NewJob {
            id: job_id.clone(),
            queue: self.config.service_queue.clone(),
            kind: JobKind::UpdateSpecs,
            payload: serde_json::to_value(&update)?,
            timeout_secs: None,
        })?;

        info!(
            job_id = %job_id,
            origin = %update.origin,
            assignment_id = update.assignment_id,
            "Enqueued test specification update"
        );
        Ok(job_id)
    }

    /// Cancel pending runs of `origin`. See `crate::cancel`.
    pub fn cancel(&self, origin: &str, run_ids: &[u64]) -> Result<Vec<CancelReport>> {
        cancel_runs(&self.queue, origin, run_ids)
    }

    /// Depth and wait estimate for `queue`. Advisory: failures are logged
    /// and reported as `None`.
    pub fn queue_info(&self, queue: &str) -> Option<QueueInfo> {
        let count = match self.queue.count(queue) {
            Ok(count) => count,
            Err(e) => {
                warn!(queue, error = %e, "Could not read queue depth");
                return None;
            }
        };
        let pop_interval = self.queue.average_pop_interval(queue).unwrap_or_else(|e| {
            warn!(queue, error = %e, "Could not read pop interval");
            None
        });
        let info = QueueInfo::new(count, pop_interval);
        info!(
            queue,
            count = info.count,
            estimated_wait = ?info.estimated_wait,
            "Queue status"
        );
        Some(info)
    }
}
