//! Error types shared by the job store, orchestrator and retry coordinator.
use crate::model::{ErrorClass, JobId, JobStatus};
use thiserror::Error;

pub type Result<T, E = SyncError> = std::result::Result<T, E>;

/// Errors surfaced synchronously to callers of the relay.
///
/// Per-channel delivery failures never show up here; they are recorded on the
/// job as failed channel results instead.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("job {0} not found")]
    NotFound(JobId),
    #[error("job {job_id} is {status} and cannot be retried")]
    NotRetryable { job_id: JobId, status: JobStatus },
    #[error("job {job_id} is {status} and cannot be cancelled")]
    NotCancellable { job_id: JobId, status: JobStatus },
    #[error("job {0} already exists")]
    DuplicateId(JobId),
    #[error("job {job_id} is {status}; refusing write")]
    InvalidState { job_id: JobId, status: JobStatus },
    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),
    #[error("corrupt job record: {0}")]
    Corrupt(String),
}

impl SyncError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        SyncError::InvalidRequest(msg.into())
    }
}

/// Failure of a single delivery attempt, classified for the retry loop.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DispatchError {
    /// Timeouts, 5xx, rate limiting: worth another attempt.
    #[error("transient dispatch error: {0}")]
    Transient(String),
    /// Validation or auth rejection: retrying cannot help.
    #[error("permanent dispatch error: {0}")]
    Permanent(String),
}

impl DispatchError {
    pub fn transient(msg: impl Into<String>) -> Self {
        DispatchError::Transient(msg.into())
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        DispatchError::Permanent(msg.into())
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            DispatchError::Transient(_) => ErrorClass::Transient,
            DispatchError::Permanent(_) => ErrorClass::Permanent,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            DispatchError::Transient(m) | DispatchError::Permanent(m) => m,
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("unsupported document source `{0}`")]
    Unsupported(String),
    #[error("document {0} not found")]
    NotFound(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("document has no content to render")]
    Empty,
    #[error("cannot render for {channel}: {reason}")]
    Unsupported { channel: String, reason: String },
}
