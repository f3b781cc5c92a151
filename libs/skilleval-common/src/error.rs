//! Error types shared by the queue, the submitter and the worker.

use crate::types::{JobId, JobStatus};

/// Malformed enqueue request. No job is created.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("at least one test case is required")]
    EmptyTestSuite,

    #[error("test case #{index} has an empty name")]
    EmptyTestName { index: usize },

    #[error("duplicate test case name: {name}")]
    DuplicateTestName { name: String },

    #[error("test case {name} has a zero timeout")]
    ZeroTimeout { name: String },

    #[error("skillVersionId must not be empty")]
    EmptySkillVersionId,

    #[error("skillPath must not be empty")]
    EmptySkillPath,
}

/// Illegal state-machine move on an [`EvalJob`](crate::types::EvalJob)
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransitionError {
    #[error("invalid job transition {from} -> {to}")]
    InvalidTransition { from: JobStatus, to: JobStatus },

    #[error("job is {status}, results can only be recorded while RUNNING")]
    NotRunning { status: JobStatus },

    #[error("unexpected result for {got} (expected {expected:?})")]
    UnexpectedResult {
        expected: Option<String>,
        got: String,
    },

    #[error("cannot complete job with {got} of {expected} results")]
    IncompleteResults { expected: usize, got: usize },
}

/// Durable store failure
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("lease on job {job_id} is no longer held")]
    LeaseLost { job_id: JobId },

    #[error("job {job_id} is already terminal")]
    TerminalRecord { job_id: JobId },
}

impl StoreError {
    /// The write was refused because another claim owns the job or the job
    /// is finished. Retrying cannot succeed.
    pub fn is_ownership_conflict(&self) -> bool {
        matches!(self, StoreError::LeaseLost { .. } | StoreError::TerminalRecord { .. })
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Failure of `queue_evaluation`
#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Store(#[from] StoreError),
}
