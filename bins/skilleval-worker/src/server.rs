// Health and metrics endpoints for the worker process

use crate::metrics;
use crate::sandbox::{Sandbox, SandboxPool};
use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use serde_json::json;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

#[derive(Clone)]
pub struct ServerState {
    pub worker_id: String,
    pub sandbox: Arc<dyn Sandbox>,
    pub pool: SandboxPool,
}

pub fn router(state: ServerState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(render_metrics))
        .with_state(Arc::new(state))
}

/// GET /health - 200 when the sandbox backend is usable, 503 otherwise
async fn health(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    let body = |status: &str, error: Option<String>| {
        json!({
            "status": status,
            "workerId": state.worker_id,
            "backend": state.sandbox.name(),
            "sandboxesAvailable": state.pool.available(),
            "error": error,
        })
    };
    match state.sandbox.health_check().await {
        Ok(()) => (StatusCode::OK, Json(body("ok", None))),
        Err(e) => (StatusCode::SERVICE_UNAVAILABLE, Json(body("degraded", Some(e.to_string())))),
    }
}

/// GET /metrics - Prometheus text format
async fn render_metrics() -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        metrics::render(),
    )
}

pub async fn serve(addr: &str, state: ServerState) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("Worker health server listening on {}", addr);
    axum::serve(listener, router(state)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeSandbox;
    use std::sync::atomic::Ordering;

    fn state(sandbox: Arc<FakeSandbox>) -> State<Arc<ServerState>> {
        State(Arc::new(ServerState {
            worker_id: "w-test".into(),
            sandbox,
            pool: SandboxPool::new(3),
        }))
    }

    #[tokio::test]
    async fn test_health_reflects_backend() {
        let sandbox = FakeSandbox::echo();
        let response = health(state(sandbox.clone())).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);

        sandbox.healthy.store(false, Ordering::SeqCst);
        let response = health(state(sandbox)).await.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let response = render_metrics().await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
