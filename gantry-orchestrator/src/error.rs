//! Orchestrator error taxonomy
//!
//! Every component returns [`Error`]. The variants follow how callers are
//! expected to react: validation problems are rejected and never retried,
//! transient infrastructure problems are retried with backoff, and conflicts
//! are ordinary contention that the caller yields on.

use thiserror::Error;

use crate::lock::LockError;
use crate::repository::RepoError;

#[derive(Debug, Error)]
pub enum Error {
    /// Bad input (trigger rule, webhook URL, request shape)
    #[error("validation failed: {0}")]
    Validation(String),

    /// Pipeline document could not be turned into a stage graph
    #[error("invalid pipeline configuration: {0}")]
    ConfigInvalid(String),

    #[error("{0} not found")]
    NotFound(String),

    /// Lost a race (stage claim, unique key, busy lock)
    #[error("conflict: {0}")]
    Conflict(String),

    /// A lease expired or moved to another holder mid-operation
    #[error("lease lost: {0}")]
    LeaseLost(String),

    /// The execution was canceled; the requested transition is refused
    #[error("execution canceled: {0}")]
    Canceled(String),

    /// Storage, bus or network blip
    #[error("transient infrastructure error: {0}")]
    Transient(String),

    /// Webhook endpoint unreachable or rejecting
    #[error("delivery failed: {0}")]
    Delivery(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether retrying the same operation later may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Transient(_))
    }

    /// Expected contention, logged at debug level only
    pub fn is_contention(&self) -> bool {
        matches!(self, Error::Conflict(_) | Error::LeaseLost(_))
    }
}

impl From<RepoError> for Error {
    fn from(err: RepoError) -> Self {
        match err {
            RepoError::NotFound(what) => Error::NotFound(what),
            RepoError::Conflict(what) => Error::Conflict(what),
            other => Error::Transient(other.to_string()),
        }
    }
}

impl From<LockError> for Error {
    fn from(err: LockError) -> Self {
        match err {
            LockError::Busy(key) => Error::Conflict(format!("lock {} is busy", key)),
            LockError::Lost(key) => Error::LeaseLost(key),
            LockError::Repository(err) => err.into(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Validation(format!("malformed payload: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repository_errors_map_to_taxonomy() {
        let err: Error = RepoError::Conflict("duplicate uid".to_string()).into();
        assert!(err.is_contention());
        assert!(!err.is_retryable());

        let err: Error = RepoError::Unavailable("connection reset".to_string()).into();
        assert!(err.is_retryable());
    }

    #[test]
    fn test_lock_errors_map_to_taxonomy() {
        let err: Error = LockError::Busy("jobs:cron".to_string()).into();
        assert!(matches!(err, Error::Conflict(_)));

        let err: Error = LockError::Lost("execution:1".to_string()).into();
        assert!(matches!(err, Error::LeaseLost(_)));
    }
}
