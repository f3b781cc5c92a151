/// Job Processor - Per-Job Orchestration
///
/// **Responsibility:**
/// Take one claimed job from delivery to a persisted terminal state.
///
/// **Flow:**
/// 1. Poison check: too many deliveries → FAILED without running
/// 2. Prepare the skill package and check the sandbox backend (retried if transient)
///    - failure → FAILED with `error`, no results
/// 3. RUNNING; then for each test case in order:
///    - cancellation requested → SKIPPED for this and every remaining case
///    - run in its own task under a pool permit; errors and panics become ERROR
///    - evaluate, append, persist
/// 4. COMPLETED, persist, ack
///
/// Every store write carries the claim's lease and transient failures are
/// retried with exponential backoff. Once the lease is lost (another worker may
/// own the job now, or it already finished) processing stops without writing.

use crate::config::WorkerConfig;
use crate::error::{InfraError, SandboxError};
use crate::evaluator;
use crate::metrics::{EXECUTION_SECONDS, SANDBOXES_ACTIVE, TEST_RESULTS};
use crate::package::{self, SkillPackage};
use crate::sandbox::{execute_with_watchdog, ExecutionLimits, ExecutionOutput, Sandbox, SandboxPool};
use chrono::Utc;
use skilleval_common::queue::{ClaimedJob, JobQueue, Lease};
use skilleval_common::types::{EvalJob, EvalResult, JobId, JobStatus, ResultStatus, TestCase};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Everything a job loop needs, shared across loops
#[derive(Clone)]
pub struct JobContext {
    pub queue: Arc<dyn JobQueue>,
    pub sandbox: Arc<dyn Sandbox>,
    pub pool: SandboxPool,
    pub config: Arc<WorkerConfig>,
    pub lease_ttl: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    Failed,
    /// Lease lost; the job is left for whoever owns it now
    Abandoned,
}

impl JobOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            JobOutcome::Completed => "completed",
            JobOutcome::Failed => "failed",
            JobOutcome::Abandoned => "abandoned",
        }
    }
}

/// Aborts the wrapped task when dropped
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Counts a running sandbox execution for as long as it lives
struct ActiveSandbox;

impl ActiveSandbox {
    fn enter() -> Self {
        SANDBOXES_ACTIVE.inc();
        ActiveSandbox
    }
}

impl Drop for ActiveSandbox {
    fn drop(&mut self) {
        SANDBOXES_ACTIVE.dec();
    }
}

/// Keeps the job's lease alive while it is being processed
struct LeaseHeartbeat {
    _task: AbortOnDrop<()>,
    lost: Arc<AtomicBool>,
}

impl LeaseHeartbeat {
    fn spawn(queue: Arc<dyn JobQueue>, lease: Lease, ttl: Duration) -> Self {
        let lost = Arc::new(AtomicBool::new(false));
        let flag = lost.clone();
        let period = (ttl / 3).max(Duration::from_millis(10));

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match queue.renew_lease(&lease, ttl).await {
                    Ok(true) => {}
                    Ok(false) => {
                        warn!(job_id = %lease.job_id, lease = %lease.token, "Lease lost");
                        flag.store(true, Ordering::SeqCst);
                        break;
                    }
                    // Keep trying; the lease only lapses after a full TTL
                    Err(e) => warn!(job_id = %lease.job_id, error = %e, "Lease renewal failed"),
                }
            }
        });

        Self {
            _task: AbortOnDrop(task),
            lost,
        }
    }

    fn is_lost(&self) -> bool {
        self.lost.load(Ordering::SeqCst)
    }
}

/// Retry transient infrastructure failures with exponential backoff
pub async fn with_retries<T, F, Fut>(
    what: &str,
    max_retries: u32,
    backoff: Duration,
    mut op: F,
) -> Result<T, InfraError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, InfraError>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < max_retries => {
                let delay = backoff.saturating_mul(2u32.saturating_pow(attempt));
                warn!(
                    operation = what,
                    attempt = attempt + 1,
                    max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Transient failure, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

async fn persist(ctx: &JobContext, job: &EvalJob, lease: &Lease) -> Result<(), InfraError> {
    let queue = ctx.queue.as_ref();
    with_retries(
        "save job",
        ctx.config.max_infra_retries,
        ctx.config.retry_backoff(),
        move || async move { queue.save(job, lease).await.map_err(InfraError::from) },
    )
    .await
}

async fn ack(ctx: &JobContext, lease: &Lease) -> Result<(), InfraError> {
    let queue = ctx.queue.as_ref();
    let released = with_retries(
        "ack job",
        ctx.config.max_infra_retries,
        ctx.config.retry_backoff(),
        move || async move { queue.ack(lease).await.map_err(InfraError::from) },
    )
    .await?;
    if !released {
        // The record is terminal already; whoever holds the lease now acks it
        warn!(job_id = %lease.job_id, "Lease lost before ack");
    }
    Ok(())
}

async fn prepare_package(ctx: &JobContext, skill_path: &str) -> Result<SkillPackage, InfraError> {
    let sandbox = ctx.sandbox.as_ref();
    with_retries(
        "prepare package",
        ctx.config.max_infra_retries,
        ctx.config.retry_backoff(),
        move || async move {
            let package = package::prepare(skill_path).await?;
            sandbox.health_check().await?;
            Ok(package)
        },
    )
    .await
}

/// Move the job to FAILED, persist and ack
async fn fail_job(
    ctx: &JobContext,
    job: &mut EvalJob,
    lease: &Lease,
    reason: String,
) -> Result<JobOutcome, InfraError> {
    warn!(job_id = %job.id, reason = %reason, "Job failed");
    job.fail(reason, Utc::now())?;
    persist(ctx, job, lease).await?;
    ack(ctx, lease).await?;
    Ok(JobOutcome::Failed)
}

async fn cancel_requested(ctx: &JobContext, job_id: &JobId) -> bool {
    match ctx.queue.is_cancelled(job_id).await {
        Ok(cancelled) => cancelled,
        Err(e) => {
            // A flaky read must not cancel a job by accident
            warn!(job_id = %job_id, error = %e, "Failed to check cancellation status");
            false
        }
    }
}

/// Resolves once cancellation of `job_id` has been requested
async fn wait_for_cancel(queue: Arc<dyn JobQueue>, job_id: JobId, interval: Duration) {
    let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
    loop {
        ticker.tick().await;
        match queue.is_cancelled(&job_id).await {
            Ok(true) => return,
            Ok(false) => {}
            Err(e) => debug!(job_id = %job_id, error = %e, "Cancellation poll failed"),
        }
    }
}

/// Run one test case in its own task and turn whatever happens into a result
async fn run_test_case(
    ctx: &JobContext,
    job_id: JobId,
    package: &SkillPackage,
    test_case: &TestCase,
) -> EvalResult {
    let limits = ExecutionLimits::for_test(test_case, &ctx.config.sandbox);
    let grace = ctx.config.sandbox.watchdog_grace();
    let sandbox = ctx.sandbox.clone();
    let pool = ctx.pool.clone();
    let package = package.clone();
    let input = test_case.input.clone();

    let started = Instant::now();
    let mut task = AbortOnDrop(tokio::spawn(async move {
        let _permit = pool.acquire().await?;
        let _active = ActiveSandbox::enter();
        let timer = EXECUTION_SECONDS
            .with_label_values(&[sandbox.name()])
            .start_timer();
        let result = execute_with_watchdog(sandbox.as_ref(), &package, &input, &limits, grace).await;
        timer.observe_duration();
        result
    }));

    let cancelled = wait_for_cancel(ctx.queue.clone(), job_id, ctx.config.cancel_poll_interval());

    let finished: Option<Result<Result<ExecutionOutput, SandboxError>, tokio::task::JoinError>> = tokio::select! {
        joined = &mut task.0 => Some(joined),
        _ = cancelled => None,
    };

    let Some(joined) = finished else {
        task.0.abort();
        // Wait for the aborted execution to drop its sandbox and permit
        let _ = (&mut task.0).await;
        info!(job_id = %job_id, test_name = %test_case.name, "Cancelled during execution");
        return EvalResult::skipped(&test_case.name, "Evaluation cancelled during execution");
    };

    let elapsed_ms = started.elapsed().as_millis() as u64;
    match joined {
        Ok(Ok(output)) => evaluator::evaluate_test(test_case, &output),
        Ok(Err(e)) => {
            warn!(job_id = %job_id, test_name = %test_case.name, error = %e, "Sandbox execution failed");
            EvalResult::error(&test_case.name, String::new(), elapsed_ms, format!("Sandbox error: {}", e))
        }
        Err(join_err) if join_err.is_panic() => {
            error!(job_id = %job_id, test_name = %test_case.name, "Sandbox runner panicked");
            EvalResult::error(&test_case.name, String::new(), elapsed_ms, "Sandbox runner panicked")
        }
        Err(join_err) => EvalResult::error(
            &test_case.name,
            String::new(),
            elapsed_ms,
            format!("Sandbox task failed: {}", join_err),
        ),
    }
}

/// Process one claimed job to a terminal state
pub async fn process_job(ctx: &JobContext, claimed: ClaimedJob) -> Result<JobOutcome, InfraError> {
    let ClaimedJob { job, lease } = claimed;
    let job_id = job.id;
    let heartbeat = LeaseHeartbeat::spawn(ctx.queue.clone(), lease.clone(), ctx.lease_ttl);

    match run_job(ctx, job, &lease, &heartbeat).await {
        Err(e) if e.is_lease_lost() => {
            warn!(job_id = %job_id, error = %e, "Abandoning job, write refused for this lease");
            Ok(JobOutcome::Abandoned)
        }
        other => other,
    }
}

async fn run_job(
    ctx: &JobContext,
    mut job: EvalJob,
    lease: &Lease,
    heartbeat: &LeaseHeartbeat,
) -> Result<JobOutcome, InfraError> {
    let job_id = job.id;

    // Finished earlier but never acked
    if job.status().is_terminal() {
        info!(job_id = %job_id, status = %job.status(), "Job already terminal, acking");
        ack(ctx, lease).await?;
        return Ok(match job.status() {
            JobStatus::Completed => JobOutcome::Completed,
            _ => JobOutcome::Failed,
        });
    }

    if job.attempts() >= ctx.config.max_deliveries {
        let reason = format!(
            "exceeded maximum delivery attempts ({})",
            ctx.config.max_deliveries
        );
        return fail_job(ctx, &mut job, lease, reason).await;
    }

    let package = match prepare_package(ctx, &job.skill_path).await {
        Ok(package) => package,
        Err(e) => return fail_job(ctx, &mut job, lease, e.to_string()).await,
    };

    job.begin(Utc::now())?;
    persist(ctx, &job, lease).await?;
    info!(
        job_id = %job_id,
        skill_version_id = %job.skill_version_id,
        attempt = job.attempts(),
        test_cases = job.test_cases.len(),
        "Job started"
    );

    let test_cases = job.test_cases.clone();
    let mut cancelled = false;
    for test_case in &test_cases {
        if heartbeat.is_lost() {
            warn!(job_id = %job_id, "Abandoning job after lease loss");
            return Ok(JobOutcome::Abandoned);
        }

        if !cancelled && cancel_requested(ctx, &job_id).await {
            info!(job_id = %job_id, remaining = test_cases.len() - job.results().len(), "Cancellation requested, skipping remaining tests");
            cancelled = true;
        }

        let result = if cancelled {
            EvalResult::skipped(&test_case.name, "Evaluation cancelled")
        } else {
            run_test_case(ctx, job_id, &package, test_case).await
        };
        // Everything after a mid-run cancellation is skipped too
        if result.status == ResultStatus::Skipped {
            cancelled = true;
        }

        debug!(
            job_id = %job_id,
            test_name = %result.test_name,
            status = %result.status,
            duration_ms = result.duration_ms,
            "Test result"
        );
        TEST_RESULTS.with_label_values(&[result.status.as_str()]).inc();

        job.record(result)?;
        persist(ctx, &job, lease).await?;
    }

    if heartbeat.is_lost() {
        return Ok(JobOutcome::Abandoned);
    }

    job.complete(Utc::now())?;
    persist(ctx, &job, lease).await?;
    ack(ctx, lease).await?;

    info!(job_id = %job_id, results = job.results().len(), "Job completed");
    Ok(JobOutcome::Completed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ok, FakeSandbox, Step};
    use skilleval_common::fakes::MemoryQueue;
    use std::sync::atomic::AtomicUsize;

    struct Harness {
        queue: Arc<MemoryQueue>,
        ctx: JobContext,
        skill_dir: tempfile::TempDir,
    }

    fn harness(sandbox: Arc<FakeSandbox>) -> Harness {
        let skill_dir = tempfile::tempdir().unwrap();
        std::fs::write(skill_dir.path().join("run.sh"), "cat").unwrap();

        let mut config = WorkerConfig::default();
        config.retry_backoff_ms = 1;
        config.cancel_poll_interval_ms = 10;

        let queue = Arc::new(MemoryQueue::new());
        let ctx = JobContext {
            queue: queue.clone(),
            sandbox,
            pool: SandboxPool::new(2),
            config: Arc::new(config),
            lease_ttl: Duration::from_secs(30),
        };
        Harness { queue, ctx, skill_dir }
    }

    impl Harness {
        fn skill_path(&self) -> String {
            self.skill_dir.path().to_string_lossy().into_owned()
        }

        async fn submit(&self, cases: Vec<TestCase>) -> ClaimedJob {
            let job = EvalJob::new("sv-1", self.skill_path(), cases);
            self.queue.push(&job).await.unwrap();
            self.queue
                .claim(&self.ctx.config.worker_id, self.ctx.lease_ttl)
                .await
                .unwrap()
                .unwrap()
        }

        /// Let the current lease lapse and hand the job to another worker
        async fn reassign(&self, job_id: &JobId, worker_id: &str) -> ClaimedJob {
            self.queue.expire_lease(job_id);
            assert_eq!(self.queue.requeue_stale().await.unwrap(), 1);
            self.queue.claim(worker_id, self.ctx.lease_ttl).await.unwrap().unwrap()
        }

        async fn stored(&self, id: &JobId) -> EvalJob {
            self.queue.load(id).await.unwrap().unwrap()
        }
    }

    #[tokio::test]
    async fn test_matching_output_passes() {
        let h = harness(FakeSandbox::new(|_| Step::Output(ok("y"))));
        let claimed = h.submit(vec![TestCase::new("t1", "x").with_expected_output("y")]).await;
        let id = claimed.job.id;

        let outcome = process_job(&h.ctx, claimed).await.unwrap();

        assert_eq!(outcome, JobOutcome::Completed);
        let stored = h.stored(&id).await;
        assert_eq!(stored.status(), JobStatus::Completed);
        assert_eq!(stored.results().len(), 1);
        assert_eq!(stored.results()[0].test_name, "t1");
        assert_eq!(stored.results()[0].status, ResultStatus::Passed);
        assert!(stored.started_at().is_some());
        assert!(stored.completed_at().is_some());
        assert_eq!(h.queue.processing_len(), 0);
    }

    #[tokio::test]
    async fn test_mismatched_output_fails_but_job_completes() {
        let h = harness(FakeSandbox::new(|_| Step::Output(ok("z"))));
        let claimed = h.submit(vec![TestCase::new("t1", "x").with_expected_output("y")]).await;
        let id = claimed.job.id;

        assert_eq!(process_job(&h.ctx, claimed).await.unwrap(), JobOutcome::Completed);

        let stored = h.stored(&id).await;
        assert_eq!(stored.status(), JobStatus::Completed);
        assert_eq!(stored.results()[0].status, ResultStatus::Failed);
    }

    #[tokio::test]
    async fn test_timeout_is_recorded_as_error() {
        let h = harness(FakeSandbox::new(|_| Step::Output(ExecutionOutput::timed_out(10_001))));
        let claimed = h
            .submit(vec![TestCase::new("t1", "x").with_expected_output("y").with_timeout(10_000)])
            .await;
        let id = claimed.job.id;

        process_job(&h.ctx, claimed).await.unwrap();

        let stored = h.stored(&id).await;
        let result = &stored.results()[0];
        assert_eq!(result.status, ResultStatus::Error);
        assert!(result.error.as_deref().unwrap().contains("timedOut=true"));
        assert!(result.output.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_package_fails_job_without_results() {
        let h = harness(FakeSandbox::echo());
        let job = EvalJob::new("sv-1", "/definitely/not/a/skill", vec![TestCase::new("t1", "x")]);
        h.queue.push(&job).await.unwrap();
        let claimed = h.queue.claim("w", h.ctx.lease_ttl).await.unwrap().unwrap();

        assert_eq!(process_job(&h.ctx, claimed).await.unwrap(), JobOutcome::Failed);

        let stored = h.stored(&job.id).await;
        assert_eq!(stored.status(), JobStatus::Failed);
        assert!(stored.error().unwrap().contains("not found"));
        assert!(stored.results().is_empty());
        // Never entered RUNNING
        assert!(stored.started_at().is_none());
        assert_eq!(h.queue.processing_len(), 0);
    }

    #[tokio::test]
    async fn test_unavailable_backend_fails_after_retries() {
        let sandbox = FakeSandbox::echo();
        sandbox.healthy.store(false, Ordering::SeqCst);
        let h = harness(sandbox.clone());
        let claimed = h.submit(vec![TestCase::new("t1", "x")]).await;
        let id = claimed.job.id;

        assert_eq!(process_job(&h.ctx, claimed).await.unwrap(), JobOutcome::Failed);

        let stored = h.stored(&id).await;
        assert!(stored.error().unwrap().contains("unavailable"));
        assert_eq!(sandbox.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_runner_error_and_panic_are_isolated() {
        let h = harness(FakeSandbox::new(|input| match input {
            "boom" => Step::Panic,
            "broken" => Step::Fail("daemon hiccup"),
            other => Step::Output(ok(other)),
        }));
        let claimed = h
            .submit(vec![
                TestCase::new("panics", "boom"),
                TestCase::new("errors", "broken"),
                TestCase::new("fine", "hello").with_expected_output("hello"),
            ])
            .await;
        let id = claimed.job.id;

        assert_eq!(process_job(&h.ctx, claimed).await.unwrap(), JobOutcome::Completed);

        let stored = h.stored(&id).await;
        let statuses: Vec<_> = stored.results().iter().map(|r| r.status).collect();
        assert_eq!(
            statuses,
            vec![ResultStatus::Error, ResultStatus::Error, ResultStatus::Passed]
        );
        assert!(stored.results()[0].error.as_deref().unwrap().contains("panicked"));
        assert!(stored.results()[1].error.as_deref().unwrap().contains("daemon hiccup"));
    }

    #[tokio::test]
    async fn test_cancel_before_start_skips_everything() {
        let sandbox = FakeSandbox::echo();
        let h = harness(sandbox.clone());
        let claimed = h
            .submit(vec![TestCase::new("t1", "a"), TestCase::new("t2", "b")])
            .await;
        let id = claimed.job.id;
        h.queue.request_cancel(&id).await.unwrap();

        assert_eq!(process_job(&h.ctx, claimed).await.unwrap(), JobOutcome::Completed);

        let stored = h.stored(&id).await;
        assert_eq!(stored.status(), JobStatus::Completed);
        assert!(stored.results().iter().all(|r| r.status == ResultStatus::Skipped));
        assert_eq!(sandbox.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cancel_during_execution_skips_current_and_rest() {
        let h = harness(FakeSandbox::new(|input| match input {
            "slow" => Step::Hang,
            other => Step::Output(ok(other)),
        }));
        let claimed = h
            .submit(vec![
                TestCase::new("t1", "quick"),
                TestCase::new("t2", "slow"),
                TestCase::new("t3", "quick"),
            ])
            .await;
        let id = claimed.job.id;

        let queue = h.queue.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            queue.request_cancel(&id).await.unwrap();
        });

        let outcome = tokio::time::timeout(Duration::from_secs(5), process_job(&h.ctx, claimed))
            .await
            .expect("cancellation must interrupt the hanging execution")
            .unwrap();
        assert_eq!(outcome, JobOutcome::Completed);

        let stored = h.stored(&id).await;
        let statuses: Vec<_> = stored.results().iter().map(|r| r.status).collect();
        assert_eq!(
            statuses,
            vec![ResultStatus::Passed, ResultStatus::Skipped, ResultStatus::Skipped]
        );
        assert_eq!(h.ctx.pool.available(), 2, "aborted execution must release its permit");
    }

    #[tokio::test]
    async fn test_redelivery_restarts_from_scratch() {
        let h = harness(FakeSandbox::echo());
        let first = h
            .submit(vec![TestCase::new("t1", "a"), TestCase::new("t2", "b")])
            .await;
        let id = first.job.id;

        // First worker got one result in, then died
        let mut job = first.job.clone();
        job.begin(Utc::now()).unwrap();
        job.record(EvalResult::error("t1", "", 1, "stale")).unwrap();
        h.queue.save(&job, &first.lease).await.unwrap();

        let redelivered = h.reassign(&id, "w2").await;
        assert_eq!(redelivered.job.status(), JobStatus::Running);
        process_job(&h.ctx, redelivered).await.unwrap();

        let stored = h.stored(&id).await;
        assert_eq!(stored.status(), JobStatus::Completed);
        assert_eq!(stored.attempts(), 2);
        let names: Vec<_> = stored.results().iter().map(|r| r.test_name.as_str()).collect();
        assert_eq!(names, vec!["t1", "t2"]);
        assert!(stored.results().iter().all(|r| r.status == ResultStatus::Passed));
    }

    #[tokio::test]
    async fn test_poison_job_is_failed_without_running() {
        let sandbox = FakeSandbox::echo();
        let h = harness(sandbox.clone());
        let mut claimed = h.submit(vec![TestCase::new("t1", "a")]).await;
        let id = claimed.job.id;
        for _ in 0..h.ctx.config.max_deliveries {
            claimed.job.begin(Utc::now()).unwrap();
        }

        assert_eq!(process_job(&h.ctx, claimed).await.unwrap(), JobOutcome::Failed);

        let stored = h.stored(&id).await;
        assert!(stored.error().unwrap().contains("maximum delivery attempts"));
        assert_eq!(sandbox.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_transient_store_failures_are_retried() {
        let h = harness(FakeSandbox::echo());
        let claimed = h.submit(vec![TestCase::new("t1", "a")]).await;
        let id = claimed.job.id;
        h.queue.fail_next_saves(2);

        assert_eq!(process_job(&h.ctx, claimed).await.unwrap(), JobOutcome::Completed);
        assert_eq!(h.stored(&id).await.status(), JobStatus::Completed);
    }

    #[tokio::test]
    async fn test_persistent_store_failure_leaves_job_unacked() {
        let h = harness(FakeSandbox::echo());
        let claimed = h.submit(vec![TestCase::new("t1", "a")]).await;
        h.queue.fail_next_saves(100);

        let err = process_job(&h.ctx, claimed).await.unwrap_err();
        assert!(matches!(err, InfraError::Store(_)));
        assert_eq!(h.queue.processing_len(), 1);
    }

    #[tokio::test]
    async fn test_every_case_gets_exactly_one_result_in_order() {
        let h = harness(FakeSandbox::echo());
        let names: Vec<String> = (1..=6).map(|i| format!("case-{}", i)).collect();
        let cases = names
            .iter()
            .map(|n| TestCase::new(n.clone(), n.clone()).with_expected_output(n.clone()))
            .collect();
        let claimed = h.submit(cases).await;
        let id = claimed.job.id;

        process_job(&h.ctx, claimed).await.unwrap();

        let stored = h.stored(&id).await;
        let got: Vec<_> = stored.results().iter().map(|r| r.test_name.clone()).collect();
        assert_eq!(got, names);
    }

    #[tokio::test]
    async fn test_already_terminal_job_is_just_acked() {
        let sandbox = FakeSandbox::echo();
        let h = harness(sandbox.clone());
        let mut claimed = h.submit(vec![TestCase::new("t1", "a")]).await;
        claimed.job.fail("earlier failure", Utc::now()).unwrap();
        h.queue.save(&claimed.job, &claimed.lease).await.unwrap();

        assert_eq!(process_job(&h.ctx, claimed).await.unwrap(), JobOutcome::Failed);
        assert_eq!(h.queue.processing_len(), 0);
        assert_eq!(sandbox.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_stale_worker_stops_without_writing() {
        let sandbox = FakeSandbox::echo();
        let h = harness(sandbox.clone());
        let stale = h.submit(vec![TestCase::new("t1", "a")]).await;
        let id = stale.job.id;
        let current = h.reassign(&id, "w2").await;

        let saves_before = h.queue.save_calls();
        assert_eq!(process_job(&h.ctx, stale).await.unwrap(), JobOutcome::Abandoned);

        // One refused write, no retries and no results
        assert_eq!(h.queue.save_calls(), saves_before + 1);
        assert_eq!(sandbox.calls.load(Ordering::SeqCst), 0);
        let stored = h.stored(&id).await;
        assert_eq!(stored.status(), JobStatus::Pending);
        assert_eq!(h.queue.processing_len(), 1);

        assert_eq!(process_job(&h.ctx, current).await.unwrap(), JobOutcome::Completed);
        assert_eq!(h.stored(&id).await.status(), JobStatus::Completed);
        assert_eq!(h.queue.processing_len(), 0);
    }

    #[tokio::test]
    async fn test_stale_worker_cannot_regress_completed_record() {
        let h = harness(FakeSandbox::echo());
        let stale = h.submit(vec![TestCase::new("t1", "a")]).await;
        let id = stale.job.id;
        let current = h.reassign(&id, "w2").await;

        assert_eq!(process_job(&h.ctx, current).await.unwrap(), JobOutcome::Completed);
        let finished = h.stored(&id).await;

        assert_eq!(process_job(&h.ctx, stale).await.unwrap(), JobOutcome::Abandoned);

        let stored = h.stored(&id).await;
        assert_eq!(stored.status(), JobStatus::Completed);
        assert_eq!(stored.attempts(), finished.attempts());
        assert_eq!(stored.completed_at(), finished.completed_at());
        assert_eq!(stored.results().len(), 1);
        assert_eq!(h.queue.processing_len(), 0);
    }

    #[tokio::test]
    async fn test_two_owners_racing_leave_one_consistent_record() {
        let h = harness(FakeSandbox::new(|input| {
            Step::Delay(Duration::from_millis(100), input.to_string())
        }));
        let names = ["t1", "t2", "t3"];
        let first = h
            .submit(names.iter().map(|n| TestCase::new(*n, *n).with_expected_output(*n)).collect())
            .await;
        let id = first.job.id;

        let ctx = h.ctx.clone();
        let stale_run = tokio::spawn(async move { process_job(&ctx, first).await });

        // The first owner is mid-run when its lease is reaped
        tokio::time::sleep(Duration::from_millis(50)).await;
        let second = h.reassign(&id, "w2").await;
        let current = process_job(&h.ctx, second).await.unwrap();
        let stale = stale_run.await.unwrap().unwrap();

        assert_eq!(stale, JobOutcome::Abandoned);
        assert_eq!(current, JobOutcome::Completed);
        let stored = h.stored(&id).await;
        assert_eq!(stored.status(), JobStatus::Completed);
        assert_eq!(stored.attempts(), 2);
        let got: Vec<_> = stored.results().iter().map(|r| r.test_name.as_str()).collect();
        assert_eq!(got, names);
        assert!(stored.results().iter().all(|r| r.status == ResultStatus::Passed));
        assert_eq!(h.queue.processing_len(), 0);
    }

    #[tokio::test]
    async fn test_heartbeat_loss_abandons_job() {
        let mut h = harness(FakeSandbox::new(|input| {
            Step::Delay(Duration::from_millis(150), input.to_string())
        }));
        h.ctx.lease_ttl = Duration::from_millis(60);
        let claimed = h
            .submit(vec![TestCase::new("t1", "a"), TestCase::new("t2", "b")])
            .await;
        let id = claimed.job.id;

        let queue = h.queue.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            queue.expire_lease(&id);
        });

        assert_eq!(process_job(&h.ctx, claimed).await.unwrap(), JobOutcome::Abandoned);

        // Left RUNNING and unacked for the reaper
        let stored = h.stored(&id).await;
        assert_eq!(stored.status(), JobStatus::Running);
        assert!(stored.results().is_empty());
        assert_eq!(h.queue.processing_len(), 1);
        assert_eq!(h.queue.requeue_stale().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_retry_gives_up_on_permanent_errors_immediately() {
        let calls = AtomicUsize::new(0);
        let result: Result<(), InfraError> = with_retries("lookup", 5, Duration::from_millis(1), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(InfraError::NoEntrypoint { path: "/p".into() }) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
