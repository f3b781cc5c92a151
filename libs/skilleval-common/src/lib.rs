pub mod config;
pub mod error;
pub mod fakes;
pub mod queue;
pub mod redis;
pub mod submit;
pub mod types;

pub use error::{StoreError, StoreResult, SubmitError, TransitionError, ValidationError};
pub use queue::{ClaimedJob, JobQueue, Lease};
