mod engine;
mod metrics;
mod runner;
mod shutdown;

use anyhow::Context;
use autotest_common::redis;
use autotest_common::storage::FsScriptStore;
use autotest_common::{Config, Settings};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use engine::{CommandEngine, ExecutionEngine};

/// BRPOP timeout; bounds how long shutdown waits on an idle queue
const POP_TIMEOUT_SECS: f64 = 5.0;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    info!("Autotest worker booting...");

    let config = Config::from_env()?;
    let settings = Settings::load(&config.settings_path)?;

    let queues: Vec<String> = match std::env::var("AUTOTEST_QUEUES") {
        Ok(list) => list
            .split(',')
            .map(str::trim)
            .filter(|q| !q.is_empty())
            .map(str::to_string)
            .collect(),
        Err(_) => settings.all_queues(),
    };
    if queues.is_empty() {
        anyhow::bail!("AUTOTEST_QUEUES names no queues");
    }

    let tester = std::env::var("AUTOTEST_TESTER_CMD")
        .unwrap_or_else(|_| "autotest-tester".to_string());
    let engine = CommandEngine::from_command_line(&tester)
        .context("AUTOTEST_TESTER_CMD must name a tester command")?;
    let store = FsScriptStore::new(&config.scripts_dir);

    metrics::init_metrics()?;
    if let Ok(port) = std::env::var("METRICS_PORT") {
        let port: u16 = port.parse().context("METRICS_PORT must be a port number")?;
        tokio::spawn(metrics::serve(port));
    }

    let client = ::redis::Client::open(config.redis_url.as_str())?;
    let mut redis_conn = ::redis::aio::ConnectionManager::new(client).await?;

    info!("Connected to Redis: {}", config.redis_url);
    info!("Tester command: {}", tester);
    info!("Listening for jobs on queues: {:?}", queues);

    // Setup graceful shutdown
    let shutdown = shutdown::install_shutdown_handler()?;

    worker_loop(&mut redis_conn, &engine, &store, &queues, &shutdown).await;

    info!("Worker shutdown complete");
    Ok(())
}

/// Pop and run jobs until `shutdown` is cancelled.
///
/// Shutdown is only checked between pops, so a BRPOP that already removed
/// an id always hands it to `process_job`, and a running job is finished
/// before the loop exits.
async fn worker_loop<E: ExecutionEngine>(
    redis_conn: &mut ::redis::aio::ConnectionManager,
    engine: &E,
    store: &FsScriptStore,
    queues: &[String],
    shutdown: &CancellationToken,
) {
    while !shutdown.is_cancelled() {
        match redis::pop_job(redis_conn, queues, POP_TIMEOUT_SECS).await {
            Ok(Some((queue, id))) => {
                if let Err(e) = redis::record_pop(redis_conn, &queue).await {
                    warn!(queue = %queue, error = %e, "Failed to record pop");
                }
                if let Err(e) = runner::process_job(redis_conn, engine, store, &queue, &id).await {
                    error!(job_id = %id, error = %e, "Job processing failed");
                }
            }
            Ok(None) => {
                // Timeout - check for shutdown
                continue;
            }
            Err(e) => {
                error!("Redis error: {}", e);
                tokio::select! {
                    _ = tokio::time::sleep(tokio::time::Duration::from_secs(1)) => {}
                    _ = shutdown.cancelled() => {}
                }
            }
        }
    }
    info!("Shutdown requested, worker loop stopped");
}
