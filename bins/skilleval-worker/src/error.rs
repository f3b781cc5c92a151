// Worker-side error taxonomy

use skilleval_common::{StoreError, TransitionError};
use std::io;
use std::path::PathBuf;

/// Per-test-case runner failure. Recorded as an ERROR result, never fatal to the job.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("test input is {size} bytes, limit is {limit}")]
    InputTooLarge { size: usize, limit: usize },

    #[error("sandbox backend error: {0}")]
    Backend(String),

    #[error("sandbox i/o error: {0}")]
    Io(#[from] io::Error),
}

impl From<bollard::errors::Error> for SandboxError {
    fn from(e: bollard::errors::Error) -> Self {
        SandboxError::Backend(e.to_string())
    }
}

/// Failure that prevents any test case from running. Marks the job FAILED.
#[derive(Debug, thiserror::Error)]
pub enum InfraError {
    #[error("skill package not found: {}", path.display())]
    PackageNotFound { path: PathBuf },

    #[error("skill package is not a directory: {}", path.display())]
    NotADirectory { path: PathBuf },

    #[error("skill package has no entrypoint (expected skill.json, run.sh, main.py or index.js): {}", path.display())]
    NoEntrypoint { path: PathBuf },

    #[error("invalid skill manifest {}: {reason}", path.display())]
    InvalidManifest { path: PathBuf, reason: String },

    #[error("cannot read skill package {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("sandbox backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("job record rejected transition: {0}")]
    Transition(#[from] TransitionError),
}

impl InfraError {
    /// Another claim owns the job now, or it already finished
    pub fn is_lease_lost(&self) -> bool {
        matches!(self, InfraError::Store(e) if e.is_ownership_conflict())
    }

    /// Worth retrying with backoff before giving up on the job
    pub fn is_transient(&self) -> bool {
        match self {
            InfraError::BackendUnavailable(_) => true,
            InfraError::Store(e) => !e.is_ownership_conflict(),
            InfraError::Io { source, .. } => matches!(
                source.kind(),
                io::ErrorKind::Interrupted | io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock
            ),
            _ => false,
        }
    }
}
