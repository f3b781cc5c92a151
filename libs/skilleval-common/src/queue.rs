//! Evaluation queue contract
//!
//! Backend-agnostic: `RedisQueue` is the durable production store and
//! `MemoryQueue` (in `fakes`) satisfies the same contract for tests.
//!
//! Guarantees every implementation must keep:
//! - `push` persists the job record and makes it claimable in one atomic step.
//! - `claim` hands a job to exactly one caller and leases it to that caller
//!   under a token unique to that claim.
//! - `save` replaces the whole record at once; readers see either the old or
//!   the new state, never a mix.
//! - `save`, `ack` and `renew_lease` only act while the caller's lease is the
//!   current one. A terminal record is never overwritten.
//! - A claimed job whose lease lapses is returned to the pending queue by
//!   `requeue_stale` (at-least-once delivery).

use async_trait::async_trait;
use std::time::Duration;
use uuid::Uuid;

use crate::error::StoreResult;
use crate::types::{EvalJob, JobId};

/// Ownership of one claimed job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub job_id: JobId,
    pub token: String,
}

impl Lease {
    /// Token for a new claim by `worker_id`. Two claims never share a token,
    /// even from workers configured with the same id.
    pub fn new_token(worker_id: &str) -> String {
        format!("{}:{}", worker_id, Uuid::new_v4().simple())
    }
}

/// A job together with the lease its claimer must present on every write
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub job: EvalJob,
    pub lease: Lease,
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Persist a new PENDING job and append it to the pending queue
    async fn push(&self, job: &EvalJob) -> StoreResult<()>;

    /// Atomically take the oldest pending job and lease it to `worker_id`.
    /// Returns `None` when nothing is pending.
    async fn claim(&self, worker_id: &str, lease: Duration) -> StoreResult<Option<ClaimedJob>>;

    /// Overwrite the stored job record.
    ///
    /// Fails with `StoreError::LeaseLost` unless `lease` is still current and
    /// with `StoreError::TerminalRecord` if the stored job already finished.
    async fn save(&self, job: &EvalJob, lease: &Lease) -> StoreResult<()>;

    async fn load(&self, job_id: &JobId) -> StoreResult<Option<EvalJob>>;

    /// Release a claimed job after its terminal state is stored.
    /// `false` means the lease was no longer current and nothing changed.
    async fn ack(&self, lease: &Lease) -> StoreResult<bool>;

    /// Extend the lease if it is still current. `false` means the lease was
    /// lost and the job may already be re-delivered elsewhere.
    async fn renew_lease(&self, lease: &Lease, ttl: Duration) -> StoreResult<bool>;

    /// Move claimed jobs with expired leases back to pending. Returns how many moved.
    async fn requeue_stale(&self) -> StoreResult<usize>;

    /// Flag a job for cancellation; workers observe it via `is_cancelled`
    async fn request_cancel(&self, job_id: &JobId) -> StoreResult<()>;

    async fn is_cancelled(&self, job_id: &JobId) -> StoreResult<bool>;
}
