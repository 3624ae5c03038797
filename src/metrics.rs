use axum::{http::StatusCode, response::IntoResponse, routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    CounterVec, Encoder, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};
use std::time::Duration;

/// Metric name prefix for all scheduler metrics
const PREFIX: &str = "scheduler";

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    pub static ref JOBS_ENQUEUED_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_jobs_enqueued_total"), "Total number of jobs enqueued"),
        &["queue", "job_type"]
    ).expect("Failed to create jobs_enqueued_total metric");

    pub static ref LEASE_CONFLICTS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_lease_conflicts_total"), "Lease attempts lost to another worker"),
        &["queue"]
    ).expect("Failed to create lease_conflicts_total metric");

    pub static ref LEASES_RECLAIMED_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_leases_reclaimed_total"), "Expired leases handed back by the sweeper"),
        &["server"]
    ).expect("Failed to create leases_reclaimed_total metric");

    pub static ref JOB_EXECUTIONS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_job_executions_total"), "Job executions by outcome"),
        &["queue", "job_type", "outcome"]
    ).expect("Failed to create job_executions_total metric");

    pub static ref JOB_EXECUTION_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            format!("{PREFIX}_job_execution_duration_seconds"),
            "Job execution duration in seconds"
        )
        .buckets(vec![0.01, 0.1, 0.5, 1.0, 5.0, 30.0, 60.0, 300.0, 1800.0]),
        &["job_type"]
    ).expect("Failed to create job_execution_duration_seconds metric");

    pub static ref JOBS_RUNNING: GaugeVec = GaugeVec::new(
        Opts::new(format!("{PREFIX}_jobs_running"), "Jobs currently executing"),
        &["queue"]
    ).expect("Failed to create jobs_running metric");
}

/// Initialize all metrics by registering them with the registry
pub fn init_metrics() {
    // Ignore errors if already registered (for tests)
    let _ = REGISTRY.register(Box::new(JOBS_ENQUEUED_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(LEASE_CONFLICTS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(LEASES_RECLAIMED_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(JOB_EXECUTIONS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(JOB_EXECUTION_DURATION_SECONDS.clone()));
    let _ = REGISTRY.register(Box::new(JOBS_RUNNING.clone()));

    tracing::info!("Metrics system initialized successfully");
}

/// Text exposition of every registered metric.
pub fn render() -> String {
    let mut buffer = Vec::new();
    if let Err(e) = TextEncoder::new().encode(&REGISTRY.gather(), &mut buffer) {
        tracing::error!("Failed to encode metrics: {}", e);
    }
    String::from_utf8(buffer).unwrap_or_default()
}

/// Handler for the /metrics endpoint
pub async fn metrics_handler() -> impl IntoResponse {
    let mut buffer = vec![];
    match TextEncoder::new().encode(&REGISTRY.gather(), &mut buffer) {
        Ok(()) => (
            StatusCode::OK,
            String::from_utf8(buffer).unwrap_or_default(),
        ),
        Err(e) => {
            tracing::error!("Failed to encode metrics: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to encode metrics: {}", e),
            )
        }
    }
}

pub fn metrics_router() -> Router {
    Router::new().route("/metrics", get(metrics_handler))
}

pub fn record_job_enqueued(queue: &str, job_type: &str) {
    JOBS_ENQUEUED_TOTAL
        .with_label_values(&[queue, job_type])
        .inc();
}

pub fn record_lease_conflict(queue: &str) {
    LEASE_CONFLICTS_TOTAL.with_label_values(&[queue]).inc();
}

pub fn record_leases_reclaimed(server: &str, count: usize) {
    LEASES_RECLAIMED_TOTAL
        .with_label_values(&[server])
        .inc_by(count as f64);
}

/// Record a finished execution. `outcome` is one of "success", "retry",
/// "failed", "released", "lease_lost", "error".
pub fn record_job_execution(queue: &str, job_type: &str, outcome: &str, duration: Duration) {
    JOB_EXECUTIONS_TOTAL
        .with_label_values(&[queue, job_type, outcome])
        .inc();
    JOB_EXECUTION_DURATION_SECONDS
        .with_label_values(&[job_type])
        .observe(duration.as_secs_f64());
}

pub fn set_job_running(queue: &str, running: bool) {
    let gauge = JOBS_RUNNING.with_label_values(&[queue]);
    if running {
        gauge.inc();
    } else {
        gauge.dec();
    }
}
