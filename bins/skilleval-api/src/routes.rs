use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;

use crate::handlers;
use crate::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/evaluations", post(handlers::submit_evaluation))
        .route("/evaluations/:job_id", get(handlers::get_evaluation))
        .route("/evaluations/:job_id/cancel", post(handlers::cancel_evaluation))
        .route("/health", get(handlers::health_check))
        .route("/metrics", get(handlers::render_metrics))
}
