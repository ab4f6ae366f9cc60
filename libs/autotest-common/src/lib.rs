pub mod cancel;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod identity;
pub mod queue;
pub mod redis;
pub mod registry;
pub mod storage;
pub mod timeout;
pub mod types;
pub mod validate;
pub mod workdir;

// Re-export commonly used types for convenience
pub use cancel::{CancelOutcome, CancelReport};
pub use config::{Config, Settings};
pub use dispatcher::{DispatchConfig, Dispatcher, Submission};
pub use error::{AutotestError, Result};
pub use identity::format_id;
pub use queue::{MemoryQueue, QueueRuntime};
pub use storage::{FsScriptStore, TestScriptStore};
pub use types::{EnqueuedJob, JobKind, JobState, QueueInfo, RunRequest, TestSpecs};
