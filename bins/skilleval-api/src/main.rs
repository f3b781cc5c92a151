mod handlers;
mod metrics;
mod routes;

use anyhow::Context;
use axum::Router;
use skilleval_common::config::QueueConfig;
use skilleval_common::redis::RedisQueue;
use skilleval_common::JobQueue;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

pub struct AppState {
    pub queue: Arc<dyn JobQueue>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
        )
        .with_target(false)
        .init();

    info!("SkillEval API booting...");

    // Connect to Redis
    let queue_config = QueueConfig::from_env();
    let queue = RedisQueue::connect(&queue_config)
        .await
        .context("Failed to connect to Redis")?;
    queue.ping().await.context("Redis did not answer PING")?;

    info!("Connected to Redis: {}", queue_config.redis_url);

    let state = Arc::new(AppState {
        queue: Arc::new(queue),
    });

    // Build router
    let app = Router::new()
        .merge(routes::routes())
        .with_state(state);

    // Start server
    let addr = std::env::var("SKILLEVAL_API_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".to_string());
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    info!("HTTP server listening on {}", addr);
    info!("Ready to accept evaluations");

    axum::serve(listener, app).await.context("Server error")?;
    Ok(())
}
