// Prometheus metrics for the autotest worker

use anyhow::{Context, Result};
use axum::{http::StatusCode, response::IntoResponse, routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    CounterVec, Encoder, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};
use tokio::net::TcpListener;
use tracing::{error, info};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    // Jobs handed to this worker (counter with queue label)
    pub static ref JOBS_STARTED: CounterVec = CounterVec::new(
        Opts::new("autotest_jobs_started_total", "Jobs taken off a queue and started"),
        &["queue"]
    )
    .expect("metric can be created");

    // Jobs that reached a terminal state
    pub static ref JOBS_COMPLETED: CounterVec = CounterVec::new(
        Opts::new("autotest_jobs_completed_total", "Jobs that reached a terminal state"),
        &["queue", "state"]
    )
    .expect("metric can be created");

    // Jobs popped after they had been cancelled
    pub static ref JOBS_SKIPPED: CounterVec = CounterVec::new(
        Opts::new("autotest_jobs_skipped_total", "Popped jobs that were no longer pending"),
        &["queue"]
    )
    .expect("metric can be created");

    pub static ref JOB_EXECUTION_TIME: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            "autotest_job_execution_seconds",
            "Wall time spent running a job"
        )
        .buckets(vec![1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0]),
        &["queue"]
    )
    .expect("metric can be created");

    // Time between enqueue and start
    pub static ref QUEUE_WAIT_TIME: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            "autotest_queue_wait_seconds",
            "Time a job spent pending before a worker started it"
        )
        .buckets(vec![0.5, 1.0, 5.0, 15.0, 60.0, 300.0, 900.0]),
        &["queue"]
    )
    .expect("metric can be created");
}

/// Initialize metrics registry
pub fn init_metrics() -> Result<()> {
    REGISTRY.register(Box::new(JOBS_STARTED.clone()))?;
    REGISTRY.register(Box::new(JOBS_COMPLETED.clone()))?;
    REGISTRY.register(Box::new(JOBS_SKIPPED.clone()))?;
    REGISTRY.register(Box::new(JOB_EXECUTION_TIME.clone()))?;
    REGISTRY.register(Box::new(QUEUE_WAIT_TIME.clone()))?;
    Ok(())
}

/// Render metrics in Prometheus text format
pub fn render_metrics() -> Result<String> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&REGISTRY.gather(), &mut buffer)?;
    String::from_utf8(buffer).context("metrics are not valid UTF-8")
}

pub fn record_job_started(queue: &str, wait_secs: Option<f64>) {
    JOBS_STARTED.with_label_values(&[queue]).inc();
    if let Some(wait) = wait_secs {
        QUEUE_WAIT_TIME.with_label_values(&[queue]).observe(wait);
    }
}

pub fn record_job_skipped(queue: &str) {
    JOBS_SKIPPED.with_label_values(&[queue]).inc();
}

pub fn record_job_completed(queue: &str, state: &str, execution_secs: f64) {
    JOBS_COMPLETED.with_label_values(&[queue, state]).inc();
    JOB_EXECUTION_TIME
        .with_label_values(&[queue])
        .observe(execution_secs);
}

async fn metrics_handler() -> impl IntoResponse {
    match render_metrics() {
        Ok(body) => (StatusCode::OK, body),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

/// Serve `/metrics` and `/health` until the process exits.
pub async fn serve(port: u16) {
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_check));

    let addr = format!("0.0.0.0:{}", port);
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind metrics server to {}: {}", addr, e);
            return;
        }
    };
    info!("Metrics server listening on {}", addr);
    if let Err(e) = axum::serve(listener, app).await {
        error!("Metrics server error: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recorded_metrics_are_rendered() {
        // Registration may already have happened in another test
        let _ = init_metrics();
        record_job_started("student", Some(2.0));
        record_job_completed("student", "finished", 3.5);
        record_job_skipped("batch");

        let text = render_metrics().unwrap();
        assert!(text.contains("autotest_jobs_started_total"));
        assert!(text.contains("autotest_jobs_completed_total{queue=\"student\",state=\"finished\"}"));
        assert!(text.contains("autotest_jobs_skipped_total{queue=\"batch\"}"));
        assert!(text.contains("autotest_queue_wait_seconds"));
    }
}
