mod config;
mod engine;
mod error;
mod evaluator;
mod metrics;
mod package;
mod pool;
mod process_engine;
mod sandbox;
mod server;
mod worker;

#[cfg(test)]
mod testing;

use config::WorkerConfig;
use pool::WorkerPool;
use sandbox::SandboxPool;
use skilleval_common::config::QueueConfig;
use skilleval_common::redis::RedisQueue;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};
use worker::JobContext;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
        )
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .init();

    info!("SkillEval Worker booting...");

    let config = WorkerConfig::load_default().map_err(|e| {
        error!("Failed to load worker configuration: {:#}", e);
        e
    })?;

    info!(
        worker_id = %config.worker_id,
        concurrency = config.concurrency,
        backend = ?config.sandbox.backend,
        image = %config.sandbox.image,
        memory_mb = config.sandbox.memory_limit_mb,
        cpu_limit = config.sandbox.cpu_limit,
        max_sandboxes = config.sandbox.max_concurrent,
        "Worker configured"
    );

    let sandbox = sandbox::create_sandbox(&config.sandbox)?;
    if let Err(e) = sandbox.health_check().await {
        // Jobs will retry and fail individually; keep the worker up
        warn!(error = %e, "Sandbox backend not healthy at startup");
    }

    // Connect to Redis
    let queue_config = QueueConfig::from_env();
    let queue = RedisQueue::connect(&queue_config).await?;
    queue.ping().await?;
    info!("Connected to Redis: {}", queue_config.redis_url);

    let pool = SandboxPool::new(config.sandbox.max_concurrent);
    let config = Arc::new(config);

    if let Some(addr) = config.metrics_addr.clone() {
        let state = server::ServerState {
            worker_id: config.worker_id.clone(),
            sandbox: sandbox.clone(),
            pool: pool.clone(),
        };
        tokio::spawn(async move {
            if let Err(e) = server::serve(&addr, state).await {
                error!(error = %e, "Health server failed");
            }
        });
    }

    let ctx = JobContext {
        queue: Arc::new(queue),
        sandbox,
        pool,
        config,
        lease_ttl: queue_config.lease_ttl(),
    };
    let workers = WorkerPool::start(ctx);

    // Graceful shutdown: first signal drains, in-flight jobs finish
    signal::ctrl_c().await?;
    warn!("Received shutdown signal, draining in-flight jobs (Ctrl+C again to abort)...");

    let drain = workers.shutdown(true);
    tokio::pin!(drain);
    tokio::select! {
        _ = &mut drain => {}
        _ = signal::ctrl_c() => {
            warn!("Second shutdown signal, abandoning in-flight jobs");
        }
    }

    info!("Worker shutdown complete");
    Ok(())
}
