//! Job Submitter / Result Reader
//!
//! The boundary used by the web layer: enqueue a test suite, poll its
//! results, ask for cancellation. Everything here is thin; the queue does the
//! storage work and the worker does the execution.

use std::collections::HashSet;

use tracing::{info, warn};

use crate::error::{StoreError, StoreResult, SubmitError, ValidationError};
use crate::queue::JobQueue;
use crate::types::{EvalJob, EvalJobResult, JobId, TestCase};

/// Outcome of a cancellation request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Requested,
    AlreadyTerminal,
    NotFound,
}

/// Check an enqueue request without touching the store
pub fn validate_request(
    skill_version_id: &str,
    test_cases: &[TestCase],
    skill_path: &str,
) -> Result<(), ValidationError> {
    if skill_version_id.trim().is_empty() {
        return Err(ValidationError::EmptySkillVersionId);
    }
    if skill_path.trim().is_empty() {
        return Err(ValidationError::EmptySkillPath);
    }
    if test_cases.is_empty() {
        return Err(ValidationError::EmptyTestSuite);
    }

    let mut seen = HashSet::with_capacity(test_cases.len());
    for (index, tc) in test_cases.iter().enumerate() {
        if tc.name.trim().is_empty() {
            return Err(ValidationError::EmptyTestName { index });
        }
        if !seen.insert(tc.name.as_str()) {
            return Err(ValidationError::DuplicateTestName {
                name: tc.name.clone(),
            });
        }
        if tc.timeout == Some(0) {
            return Err(ValidationError::ZeroTimeout {
                name: tc.name.clone(),
            });
        }
    }
    Ok(())
}

/// Validate and durably enqueue a new evaluation job.
///
/// Returns as soon as the job is stored; execution happens asynchronously.
/// Whether `skill_path` actually resolves is decided by the worker, so a bad
/// path yields a FAILED job rather than a rejected request.
pub async fn queue_evaluation(
    queue: &dyn JobQueue,
    skill_version_id: &str,
    test_cases: Vec<TestCase>,
    skill_path: &str,
) -> Result<JobId, SubmitError> {
    validate_request(skill_version_id, &test_cases, skill_path)?;

    let job = EvalJob::new(skill_version_id, skill_path, test_cases);
    queue.push(&job).await?;

    info!(
        job_id = %job.id,
        skill_version_id = %job.skill_version_id,
        test_cases = job.test_cases.len(),
        "Evaluation queued"
    );
    Ok(job.id)
}

/// Load a job for readers. A record that no longer decodes is reported as
/// missing; connection failures still surface as errors.
async fn load_readable(queue: &dyn JobQueue, id: &JobId) -> StoreResult<Option<EvalJob>> {
    match queue.load(id).await {
        Err(StoreError::Serialization(e)) => {
            warn!(job_id = %id, error = %e, "Unreadable job record, treating as not found");
            Ok(None)
        }
        other => other,
    }
}

/// Poll a job. Unknown or malformed ids and unreadable records yield `None`.
pub async fn get_eval_results(
    queue: &dyn JobQueue,
    job_id: &str,
) -> StoreResult<Option<EvalJobResult>> {
    let Ok(id) = JobId::parse_str(job_id.trim()) else {
        return Ok(None);
    };
    Ok(load_readable(queue, &id).await?.map(|job| job.snapshot()))
}

/// Request cancellation of a pending or running job
pub async fn cancel_evaluation(queue: &dyn JobQueue, job_id: &str) -> StoreResult<CancelOutcome> {
    let Ok(id) = JobId::parse_str(job_id.trim()) else {
        return Ok(CancelOutcome::NotFound);
    };
    match load_readable(queue, &id).await? {
        None => Ok(CancelOutcome::NotFound),
        Some(job) if job.status().is_terminal() => Ok(CancelOutcome::AlreadyTerminal),
        Some(_) => {
            queue.request_cancel(&id).await?;
            info!(job_id = %id, "Cancellation requested");
            Ok(CancelOutcome::Requested)
        }
    }
}
