use thiserror::Error;

/// Caller-facing failures of the dispatch layer.
///
/// The first group is detected before any enqueue side effect and is never
/// retried by this layer.
#[derive(Error, Debug)]
pub enum AutotestError {
    #[error("invalid job arguments: {0}")]
    JobArgument(String),

    #[error("cannot enqueue job: unable to determine correct queue type")]
    InvalidQueue,

    #[error("cannot find test script files: please upload some before running tests")]
    TestScriptFiles,

    #[error("no timed tests match categories {0:?}: cannot compute a job timeout")]
    TestParameter(Vec<String>),

    #[error("invalid test specification: {0}")]
    InvalidSpec(String),

    #[error("job {0} already exists")]
    DuplicateJob(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("corrupt job record {id}: {reason}")]
    CorruptJob { id: String, reason: String },

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, AutotestError>;
