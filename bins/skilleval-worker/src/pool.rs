/// Worker Pool - Process-Wide Lifecycle
///
/// Owns the job loops and the lease reaper for one worker process.
///
/// - `start` spawns `concurrency` job loops plus the reaper
/// - `shutdown(true)` stops claiming new jobs and waits for in-flight jobs
/// - `shutdown(false)` aborts in-flight jobs; their leases lapse and the
///   jobs are redelivered to another worker

use crate::metrics::{JOBS_PROCESSED, JOBS_REQUEUED};
use crate::worker::{process_job, JobContext};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn};

/// Back-off after a queue error before claiming again
const QUEUE_ERROR_BACKOFF: Duration = Duration::from_secs(1);

pub struct WorkerPool {
    shutdown_tx: watch::Sender<bool>,
    loops: Vec<JoinHandle<()>>,
    reaper: JoinHandle<()>,
}

impl WorkerPool {
    pub fn start(ctx: JobContext) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let loops = (0..ctx.config.concurrency)
            .map(|slot| tokio::spawn(job_loop(ctx.clone(), slot, shutdown_rx.clone())))
            .collect();
        let reaper = tokio::spawn(reaper_loop(ctx.clone(), shutdown_rx));

        info!(
            worker_id = %ctx.config.worker_id,
            concurrency = ctx.config.concurrency,
            max_sandboxes = ctx.pool.available(),
            backend = ctx.sandbox.name(),
            "Worker pool started"
        );

        Self {
            shutdown_tx,
            loops,
            reaper,
        }
    }

    /// Stop the pool. With `drain_in_flight`, running jobs are finished first.
    pub async fn shutdown(self, drain_in_flight: bool) {
        let _ = self.shutdown_tx.send(true);
        self.reaper.abort();

        if !drain_in_flight {
            for handle in &self.loops {
                handle.abort();
            }
        }

        let in_flight = self.loops.len();
        for handle in self.loops {
            match handle.await {
                Ok(()) => {}
                Err(e) if e.is_cancelled() => {}
                Err(e) => error!(error = %e, "Job loop ended abnormally"),
            }
        }
        info!(loops = in_flight, drained = drain_in_flight, "Worker pool stopped");
    }
}

/// Sleep for `duration` unless shutdown is signalled first.
/// Returns true when the loop should stop.
async fn idle(shutdown: &mut watch::Receiver<bool>, duration: Duration) -> bool {
    let changed = tokio::select! {
        _ = tokio::time::sleep(duration) => None,
        res = shutdown.changed() => Some(res),
    };
    match changed {
        None => false,
        // Pool dropped without shutdown
        Some(Err(_)) => true,
        Some(Ok(())) => *shutdown.borrow(),
    }
}

#[instrument(skip(ctx, shutdown), fields(worker_id = %ctx.config.worker_id))]
async fn job_loop(ctx: JobContext, slot: usize, mut shutdown: watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            break;
        }

        match ctx.queue.claim(&ctx.config.worker_id, ctx.lease_ttl).await {
            Ok(Some(claimed)) => {
                let job_id = claimed.job.id;
                info!(
                    job_id = %job_id,
                    skill_version_id = %claimed.job.skill_version_id,
                    test_cases = claimed.job.test_cases.len(),
                    attempts = claimed.job.attempts(),
                    lease = %claimed.lease.token,
                    "Received job"
                );

                match process_job(&ctx, claimed).await {
                    Ok(outcome) => {
                        JOBS_PROCESSED.with_label_values(&[outcome.as_str()]).inc();
                    }
                    Err(e) => {
                        // Left unacked: the lease lapses and the job is redelivered
                        error!(job_id = %job_id, error = %e, "Job processing aborted");
                        JOBS_PROCESSED.with_label_values(&["error"]).inc();
                    }
                }
            }
            Ok(None) => {
                if idle(&mut shutdown, ctx.config.poll_interval()).await {
                    break;
                }
            }
            Err(e) => {
                error!(error = %e, "Queue error");
                if idle(&mut shutdown, QUEUE_ERROR_BACKOFF).await {
                    break;
                }
            }
        }
    }
}

#[instrument(skip(ctx, shutdown), fields(worker_id = %ctx.config.worker_id))]
async fn reaper_loop(ctx: JobContext, mut shutdown: watch::Receiver<bool>) {
    loop {
        if idle(&mut shutdown, ctx.config.reaper_interval()).await {
            break;
        }

        match ctx.queue.requeue_stale().await {
            Ok(0) => {}
            Ok(moved) => {
                warn!(requeued = moved, "Requeued jobs with expired leases");
                JOBS_REQUEUED
                    .with_label_values(&[ctx.config.worker_id.as_str()])
                    .inc_by(moved as u64);
            }
            Err(e) => error!(error = %e, "Failed to requeue stale jobs"),
        }
    }
}
