//! Redis queue runtime shared by the enqueuer and the workers: key names,
//! job encoding and the atomic state transitions.

use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::{Commands, Script};
use serde_json::Value;
use std::collections::HashMap;

use crate::error::{AutotestError, Result};
use crate::queue::{mean_interval, QueueRuntime};
use crate::types::{EnqueuedJob, JobKind, JobState, NewJob};

pub const QUEUE_PREFIX: &str = "autotest:queue";
pub const JOB_PREFIX: &str = "autotest:job";
pub const POPS_PREFIX: &str = "autotest:pops";

/// Terminal job records are kept this long for inspection
pub const TERMINAL_JOB_TTL_SECS: u64 = 24 * 60 * 60;

/// Pop timestamps kept per queue for the wait estimate
pub const POP_HISTORY_LEN: isize = 50;

pub fn queue_key(queue: &str) -> String {
    format!("{}:{}", QUEUE_PREFIX, queue)
}

pub fn job_key(id: &str) -> String {
    format!("{}:{}", JOB_PREFIX, id)
}

pub fn pops_key(queue: &str) -> String {
    format!("{}:{}", POPS_PREFIX, queue)
}

// KEYS: job hash, queue list. ARGV: id, queue, kind, payload, timeout, enqueued_at
const ENQUEUE_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 1 then
    return 0
end
redis.call('HSET', KEYS[1],
    'queue', ARGV[2], 'kind', ARGV[3], 'payload', ARGV[4],
    'timeout', ARGV[5], 'state', 'pending', 'enqueued_at', ARGV[6])
redis.call('LPUSH', KEYS[2], ARGV[1])
return 1
"#;

// KEYS: job hash, queue list. ARGV: id, ttl
const CANCEL_SCRIPT: &str = r#"
if redis.call('HGET', KEYS[1], 'state') ~= 'pending' then
    return 0
end
redis.call('HSET', KEYS[1], 'state', 'cancelled')
redis.call('LREM', KEYS[2], 0, ARGV[1])
redis.call('EXPIRE', KEYS[1], ARGV[2])
return 1
"#;

// KEYS: job hash
const START_SCRIPT: &str = r#"
if redis.call('HGET', KEYS[1], 'state') ~= 'pending' then
    return 0
end
redis.call('HSET', KEYS[1], 'state', 'running')
return 1
"#;

fn now_secs() -> f64 {
    Utc::now().timestamp_millis() as f64 / 1000.0
}

/// Decode a job hash. An empty hash means the job does not exist.
pub fn job_from_fields(id: &str, mut fields: HashMap<String, String>) -> Result<Option<EnqueuedJob>> {
    if fields.is_empty() {
        return Ok(None);
    }
    let corrupt = |reason: String| AutotestError::CorruptJob {
        id: id.to_string(),
        reason,
    };
    let mut take = |name: &str| {
        fields
            .remove(name)
            .ok_or_else(|| corrupt(format!("missing field '{}'", name)))
    };

    let queue = take("queue")?;
    let kind = take("kind")?;
    let kind = JobKind::parse(&kind).ok_or_else(|| corrupt(format!("unknown kind '{}'", kind)))?;
    let payload: Value = serde_json::from_str(&take("payload")?)?;
    let timeout = take("timeout")?;
    let timeout_secs = if timeout.is_empty() {
        None
    } else {
        Some(
            timeout
                .parse()
                .map_err(|_| corrupt(format!("bad timeout '{}'", timeout)))?,
        )
    };
    let state = take("state")?;
    let state = JobState::parse(&state).ok_or_else(|| corrupt(format!("unknown state '{}'", state)))?;
    let enqueued_at = take("enqueued_at")?;
    let enqueued_at = DateTime::parse_from_rfc3339(&enqueued_at)
        .map_err(|e| corrupt(format!("bad enqueued_at: {}", e)))?
        .with_timezone(&Utc);
    let result = match fields.remove("result") {
        Some(raw) => Some(serde_json::from_str(&raw)?),
        None => None,
    };

    Ok(Some(EnqueuedJob {
        id: id.to_string(),
        queue,
        kind,
        payload,
        timeout_secs,
        state,
        enqueued_at,
        result,
    }))
}

/// Blocking queue runtime used by the enqueuer
///
/// Opens a connection per operation; each CLI invocation performs only a
/// few of them.
#[derive(Debug, Clone)]
pub struct RedisQueue {
    client: redis::Client,
}

impl RedisQueue {
    pub fn open(redis_url: &str) -> Result<Self> {
        Ok(Self {
            client: redis::Client::open(redis_url)?,
        })
    }

    fn connection(&self) -> Result<redis::Connection> {
        Ok(self.client.get_connection()?)
    }
}

impl QueueRuntime for RedisQueue {
    fn enqueue(&self, job: NewJob) -> Result<()> {
        let mut con = self.connection()?;
        let created: i32 = Script::new(ENQUEUE_SCRIPT)
            .key(job_key(&job.id))
            .key(queue_key(&job.queue))
            .arg(&job.id)
            .arg(&job.queue)
            .arg(job.kind.as_str())
            .arg(serde_json::to_string(&job.payload)?)
            .arg(job.timeout_secs.map(|t| t.to_string()).unwrap_or_default())
            .arg(Utc::now().to_rfc3339())
            .invoke(&mut con)?;
        if created == 0 {
            return Err(AutotestError::DuplicateJob(job.id));
        }
        Ok(())
    }

    fn fetch(&self, id: &str) -> Result<Option<EnqueuedJob>> {
        let mut con = self.connection()?;
        let fields: HashMap<String, String> = con.hgetall(job_key(id))?;
        job_from_fields(id, fields)
    }

    fn cancel(&self, job: &EnqueuedJob) -> Result<bool> {
        let mut con = self.connection()?;
        let cancelled: i32 = Script::new(CANCEL_SCRIPT)
            .key(job_key(&job.id))
            .key(queue_key(&job.queue))
            .arg(&job.id)
            .arg(TERMINAL_JOB_TTL_SECS)
            .invoke(&mut con)?;
        Ok(cancelled == 1)
    }

    fn count(&self, queue: &str) -> Result<u64> {
        let mut con = self.connection()?;
        Ok(con.llen::<_, u64>(queue_key(queue))?)
    }

    fn average_pop_interval(&self, queue: &str) -> Result<Option<f64>> {
        let mut con = self.connection()?;
        let timestamps: Vec<f64> = con.lrange(pops_key(queue), 0, -1)?;
        Ok(mean_interval(&timestamps))
    }
}

/// Pop the next job id from any of `queues`, waiting up to `timeout_secs`.
///
/// Returns the queue name alongside the id.
pub async fn pop_job(
    conn: &mut ConnectionManager,
    queues: &[String],
    timeout_secs: f64,
) -> Result<Option<(String, String)>> {
    let keys: Vec<String> = queues.iter().map(|q| queue_key(q)).collect();
    let popped: Option<(String, String)> = redis::cmd("BRPOP")
        .arg(&keys)
        .arg(timeout_secs)
        .query_async(conn)
        .await?;
    Ok(popped.map(|(key, id)| {
        let queue = key
            .strip_prefix(QUEUE_PREFIX)
            .and_then(|rest| rest.strip_prefix(':'))
            .unwrap_or(&key)
            .to_string();
        (queue, id)
    }))
}

/// Note a pop for the wait estimate. A pop that drains the queue ends the burst.
pub async fn record_pop(conn: &mut ConnectionManager, queue: &str) -> Result<()> {
    let remaining: u64 = redis::cmd("LLEN")
        .arg(queue_key(queue))
        .query_async(conn)
        .await?;
    let key = pops_key(queue);
    if remaining == 0 {
        redis::cmd("DEL").arg(&key).query_async::<_, ()>(conn).await?;
    } else {
        redis::pipe()
            .atomic()
            .cmd("LPUSH")
            .arg(&key)
            .arg(now_secs())
            .ignore()
            .cmd("LTRIM")
            .arg(&key)
            .arg(0)
            .arg(POP_HISTORY_LEN - 1)
            .ignore()
            .query_async::<_, ()>(conn)
            .await?;
    }
    Ok(())
}

/// Hand a pending job to the worker. `false` means it was cancelled first.
pub async fn start_job(conn: &mut ConnectionManager, id: &str) -> Result<bool> {
    let started: i32 = Script::new(START_SCRIPT)
        .key(job_key(id))
        .invoke_async(conn)
        .await?;
    Ok(started == 1)
}

pub async fn load_job(conn: &mut ConnectionManager, id: &str) -> Result<Option<EnqueuedJob>> {
    let fields: HashMap<String, String> = redis::cmd("HGETALL")
        .arg(job_key(id))
        .query_async(conn)
        .await?;
    job_from_fields(id, fields)
}

/// Record the terminal state and result of a job the worker ran.
pub async fn finish_job(
    conn: &mut ConnectionManager,
    id: &str,
    state: JobState,
    result: &Value,
) -> Result<()> {
    let key = job_key(id);
    redis::pipe()
        .atomic()
        .cmd("HSET")
        .arg(&key)
        .arg("state")
        .arg(state.as_str())
        .arg("result")
        .arg(serde_json::to_string(result)?)
        .ignore()
        .cmd("EXPIRE")
        .arg(&key)
        .arg(TERMINAL_JOB_TTL_SECS)
        .ignore()
        .query_async::<_, ()>(conn)
        .await?;
    Ok(())
}
