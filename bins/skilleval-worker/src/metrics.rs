// Prometheus metrics for the worker process

use lazy_static::lazy_static;
use prometheus::{
    register_histogram_vec, register_int_counter_vec, register_int_gauge, Encoder, HistogramVec,
    IntCounterVec, IntGauge, TextEncoder,
};

lazy_static! {
    pub static ref JOBS_PROCESSED: IntCounterVec = register_int_counter_vec!(
        "skilleval_worker_jobs_total",
        "Jobs finished by this worker, by terminal outcome",
        &["outcome"]
    )
    .unwrap();
    pub static ref TEST_RESULTS: IntCounterVec = register_int_counter_vec!(
        "skilleval_worker_test_results_total",
        "Recorded test case results, by status",
        &["status"]
    )
    .unwrap();
    pub static ref EXECUTION_SECONDS: HistogramVec = register_histogram_vec!(
        "skilleval_worker_execution_seconds",
        "Wall-clock time of single sandbox executions",
        &["backend"],
        vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0]
    )
    .unwrap();
    pub static ref SANDBOXES_ACTIVE: IntGauge = register_int_gauge!(
        "skilleval_worker_sandboxes_active",
        "Sandbox executions currently holding a pool permit"
    )
    .unwrap();
    pub static ref JOBS_REQUEUED: IntCounterVec = register_int_counter_vec!(
        "skilleval_worker_requeued_total",
        "Jobs moved back to pending after their lease expired",
        &["worker"]
    )
    .unwrap();
}

/// Render all registered metrics in the Prometheus text format
pub fn render() -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
        tracing::warn!(error = %e, "Failed to encode metrics");
    }
    String::from_utf8_lossy(&buffer).into_owned()
}
