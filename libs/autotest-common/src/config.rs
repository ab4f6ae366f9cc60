use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::error::{AutotestError, Result};
use crate::registry::{default_descriptors, QueueDescriptor};
use crate::timeout::DEFAULT_TIMEOUT_MULTIPLIER;
use crate::validate::DEFAULT_SPECS_SCHEMA;

/// Process configuration
/// Provides defaults with environment variable overrides
#[derive(Debug, Clone)]
pub struct Config {
    pub redis_url: String,
    pub scripts_dir: PathBuf,
    pub settings_path: PathBuf,
    pub timeout_multiplier: f64,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_vars(|name| env::var(name).ok())
    }

    /// Build from a variable lookup; unset variables take their defaults.
    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let timeout_multiplier = match var("AUTOTEST_TIMEOUT_MULTIPLIER") {
            Some(raw) => raw.trim().parse().map_err(|_| {
                AutotestError::Config(format!(
                    "AUTOTEST_TIMEOUT_MULTIPLIER must be a number, got '{}'",
                    raw
                ))
            })?,
            None => DEFAULT_TIMEOUT_MULTIPLIER,
        };
        Ok(Self {
            redis_url: var("REDIS_URL").unwrap_or_else(|| "redis://127.0.0.1:6379".to_string()),
            scripts_dir: var("AUTOTEST_SCRIPTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("scripts")),
            settings_path: var("AUTOTEST_SETTINGS")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("config/autotest.json")),
            timeout_multiplier,
        })
    }
}

/// Worker processes sharing one set of queues
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerGroup {
    pub numprocs: u32,
    pub queues: Vec<String>,
}

/// Deployment settings loaded from `Config::settings_path`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "default_descriptors")]
    pub queues: Vec<QueueDescriptor>,
    #[serde(default = "default_service_queue")]
    pub service_queue: String,
    #[serde(default = "default_workers")]
    pub workers: Vec<WorkerGroup>,
    /// Custom test specification schema; the bundled one is used otherwise
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_path: Option<PathBuf>,
}

fn default_service_queue() -> String {
    "service".to_string()
}

fn default_workers() -> Vec<WorkerGroup> {
    vec![
        WorkerGroup {
            numprocs: 2,
            queues: vec!["batch".to_string(), "single".to_string(), "student".to_string()],
        },
        WorkerGroup {
            numprocs: 1,
            queues: vec![default_service_queue()],
        },
    ]
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            queues: default_descriptors(),
            service_queue: default_service_queue(),
            workers: default_workers(),
            schema_path: None,
        }
    }
}

impl Settings {
    /// Read settings from `path`; a missing file means built-in defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(e.into()),
        };
        let settings: Settings = serde_json::from_str(&content).map_err(|e| {
            AutotestError::Config(format!("failed to parse {}: {}", path.display(), e))
        })?;
        if settings.service_queue.is_empty() {
            return Err(AutotestError::Config("service_queue must not be empty".to_string()));
        }
        Ok(settings)
    }

    pub fn specs_schema(&self) -> Result<Value> {
        match &self.schema_path {
            Some(path) => {
                let content = fs::read_to_string(path)?;
                Ok(serde_json::from_str(&content)?)
            }
            None => Ok(serde_json::from_str(DEFAULT_SPECS_SCHEMA)?),
        }
    }

    /// Every queue a worker could be asked to serve.
    pub fn all_queues(&self) -> Vec<String> {
        self.queues
            .iter()
            .map(|q| q.name.clone())
            .chain(std::iter::once(self.service_queue.clone()))
            .collect()
    }
}
