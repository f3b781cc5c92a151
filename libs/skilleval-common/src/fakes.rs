//! In-memory queue (tests and local runs)
//!
//! `MemoryQueue` honours the `JobQueue` contract without Redis. Leases use
//! `Instant` deadlines, so `requeue_stale` behaves like the Lua reaper.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::error::{StoreError, StoreResult};
use crate::queue::{ClaimedJob, JobQueue, Lease};
use crate::types::{EvalJob, JobId};

#[derive(Debug, Default)]
struct State {
    jobs: HashMap<JobId, EvalJob>,
    pending: VecDeque<JobId>,
    processing: Vec<JobId>,
    leases: HashMap<JobId, (String, Instant)>,
    cancelled: HashSet<JobId>,
    corrupted: HashSet<JobId>,
}

impl State {
    fn holds(&self, lease: &Lease) -> bool {
        matches!(
            self.leases.get(&lease.job_id),
            Some((token, deadline)) if *token == lease.token && *deadline > Instant::now()
        )
    }
}

#[derive(Debug, Default)]
pub struct MemoryQueue {
    state: Mutex<State>,
    save_failures: AtomicUsize,
    push_failures: AtomicUsize,
    save_calls: AtomicUsize,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` calls to `save` fail with `StoreError::Unavailable`
    pub fn fail_next_saves(&self, n: usize) {
        self.save_failures.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` calls to `push` fail with `StoreError::Unavailable`
    pub fn fail_next_pushes(&self, n: usize) {
        self.push_failures.store(n, Ordering::SeqCst);
    }

    pub fn save_calls(&self) -> usize {
        self.save_calls.load(Ordering::SeqCst)
    }

    pub fn pending_len(&self) -> usize {
        self.state.lock().unwrap().pending.len()
    }

    pub fn processing_len(&self) -> usize {
        self.state.lock().unwrap().processing.len()
    }

    /// Drop the lease on a claimed job, as if its worker had died
    pub fn expire_lease(&self, job_id: &JobId) {
        self.state.lock().unwrap().leases.remove(job_id);
    }

    /// Make `load` fail to decode the stored record, like a damaged Redis value
    pub fn corrupt_record(&self, job_id: &JobId) {
        self.state.lock().unwrap().corrupted.insert(*job_id);
    }
}

fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl JobQueue for MemoryQueue {
    async fn push(&self, job: &EvalJob) -> StoreResult<()> {
        if take_one(&self.push_failures) {
            return Err(StoreError::Unavailable("injected push failure".into()));
        }
        let mut state = self.state.lock().unwrap();
        state.jobs.insert(job.id, job.clone());
        state.pending.push_back(job.id);
        Ok(())
    }

    async fn claim(&self, worker_id: &str, lease: Duration) -> StoreResult<Option<ClaimedJob>> {
        let mut state = self.state.lock().unwrap();
        while let Some(id) = state.pending.pop_front() {
            let Some(job) = state.jobs.get(&id).cloned() else {
                continue;
            };
            let lease_for = Lease {
                job_id: id,
                token: Lease::new_token(worker_id),
            };
            state.processing.push(id);
            state
                .leases
                .insert(id, (lease_for.token.clone(), Instant::now() + lease));
            return Ok(Some(ClaimedJob {
                job,
                lease: lease_for,
            }));
        }
        Ok(None)
    }

    async fn save(&self, job: &EvalJob, lease: &Lease) -> StoreResult<()> {
        self.save_calls.fetch_add(1, Ordering::SeqCst);
        if take_one(&self.save_failures) {
            return Err(StoreError::Unavailable("injected save failure".into()));
        }
        let mut state = self.state.lock().unwrap();
        if !state.holds(lease) {
            return Err(StoreError::LeaseLost { job_id: job.id });
        }
        if state.jobs.get(&job.id).is_some_and(|stored| stored.status().is_terminal()) {
            return Err(StoreError::TerminalRecord { job_id: job.id });
        }
        state.jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn load(&self, job_id: &JobId) -> StoreResult<Option<EvalJob>> {
        let state = self.state.lock().unwrap();
        if state.corrupted.contains(job_id) {
            let err = serde_json::from_str::<EvalJob>("{\"id\":").unwrap_err();
            return Err(StoreError::Serialization(err));
        }
        Ok(state.jobs.get(job_id).cloned())
    }

    async fn ack(&self, lease: &Lease) -> StoreResult<bool> {
        let mut state = self.state.lock().unwrap();
        if !state.holds(lease) {
            return Ok(false);
        }
        state.processing.retain(|id| *id != lease.job_id);
        state.leases.remove(&lease.job_id);
        Ok(true)
    }

    async fn renew_lease(&self, lease: &Lease, ttl: Duration) -> StoreResult<bool> {
        let mut state = self.state.lock().unwrap();
        if !state.holds(lease) {
            return Ok(false);
        }
        if let Some((_, deadline)) = state.leases.get_mut(&lease.job_id) {
            *deadline = Instant::now() + ttl;
        }
        Ok(true)
    }

    async fn requeue_stale(&self) -> StoreResult<usize> {
        let mut state = self.state.lock().unwrap();
        let now = Instant::now();
        let State {
            processing,
            pending,
            leases,
            ..
        } = &mut *state;

        let mut moved = 0;
        processing.retain(|id| {
            let alive = matches!(leases.get(id), Some((_, deadline)) if *deadline > now);
            if !alive {
                leases.remove(id);
                pending.push_back(*id);
                moved += 1;
            }
            alive
        });
        Ok(moved)
    }

    async fn request_cancel(&self, job_id: &JobId) -> StoreResult<()> {
        self.state.lock().unwrap().cancelled.insert(*job_id);
        Ok(())
    }

    async fn is_cancelled(&self, job_id: &JobId) -> StoreResult<bool> {
        Ok(self.state.lock().unwrap().cancelled.contains(job_id))
    }
}
