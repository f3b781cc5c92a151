// Prometheus metrics for the submission API

use lazy_static::lazy_static;
use prometheus::{register_int_counter_vec, Encoder, IntCounterVec, TextEncoder};

lazy_static! {
    pub static ref SUBMISSIONS: IntCounterVec = register_int_counter_vec!(
        "skilleval_api_submissions_total",
        "Evaluation submissions, by outcome (queued, rejected, error)",
        &["outcome"]
    )
    .unwrap();
    pub static ref CANCELLATIONS: IntCounterVec = register_int_counter_vec!(
        "skilleval_api_cancellations_total",
        "Cancellation requests, by outcome",
        &["outcome"]
    )
    .unwrap();
}

pub fn render() -> String {
    let mut buffer = Vec::new();
    if let Err(e) = TextEncoder::new().encode(&prometheus::gather(), &mut buffer) {
        tracing::warn!(error = %e, "Failed to encode metrics");
    }
    String::from_utf8_lossy(&buffer).into_owned()
}
