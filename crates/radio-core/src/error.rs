//! Error types for the Radio broker core.

use crate::job::JobState;
use thiserror::Error;
use uuid::Uuid;

/// The main error type for the broker core.
///
/// Every operation exposed to the transport returns one of these kinds; the
/// transport decides how to render them (status codes, retry headers).
#[derive(Error, Debug)]
pub enum Error {
    /// Unparseable input, or JSON of an unknown shape
    #[error("Malformed message: {0}")]
    Malformed(String),

    /// Offer signature did not verify against the claimed public key
    #[error("Signature invalid: {0}")]
    SignatureInvalid(String),

    /// Offer timestamp is outside the accepted freshness window
    #[error("Stale offer: {0}")]
    StaleOffer(String),

    /// No job is registered under this id
    #[error("Job not found: {0}")]
    JobNotFound(Uuid),

    /// The job already reached a terminal state
    #[error("Job {job_id} already finished in state {state}")]
    AlreadyCompleted { job_id: Uuid, state: JobState },

    /// A state change that would skip or reverse the job lifecycle
    #[error("Invalid transition for job {job_id}: {from} -> {to}")]
    InvalidTransition {
        job_id: Uuid,
        from: JobState,
        to: JobState,
    },

    /// A job with this id is already stored
    #[error("Duplicate job id: {0}")]
    DuplicateJob(Uuid),

    /// An idempotency key was reused for a different offer
    #[error("Idempotency key {0} was already used for a different offer")]
    IdempotencyConflict(String),

    /// Backing store failed
    #[error("Storage failure: {0}")]
    StorageFailure(String),

    /// Broker settings that cannot be used to run the service
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The downstream worker could not be reached
    #[error("Dispatch failure: {0}")]
    DispatchFailure(String),

    /// Generic I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Whether the error was caused by the caller's input rather than by the broker.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Error::Malformed(_)
                | Error::SignatureInvalid(_)
                | Error::StaleOffer(_)
                | Error::JobNotFound(_)
                | Error::AlreadyCompleted { .. }
                | Error::InvalidTransition { .. }
                | Error::DuplicateJob(_)
                | Error::IdempotencyConflict(_)
        )
    }

    /// Whether retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::StorageFailure(_) | Error::Io(_))
    }
}

/// Convenience type alias for Results using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_error_display() {
        let malformed = Error::Malformed("Unknown request type".to_string());
        assert_eq!(format!("{}", malformed), "Malformed message: Unknown request type");

        let id = Uuid::nil();
        let not_found = Error::JobNotFound(id);
        assert_eq!(
            format!("{}", not_found),
            "Job not found: 00000000-0000-0000-0000-000000000000"
        );

        let completed = Error::AlreadyCompleted {
            job_id: id,
            state: JobState::Completed,
        };
        assert!(format!("{}", completed).contains("completed"));

        let transition = Error::InvalidTransition {
            job_id: id,
            from: JobState::Pending,
            to: JobState::Completed,
        };
        assert!(format!("{}", transition).contains("pending -> completed"));
    }

    #[test]
    fn test_classification() {
        assert!(Error::Malformed("x".into()).is_client_error());
        assert!(Error::SignatureInvalid("x".into()).is_client_error());
        assert!(Error::JobNotFound(Uuid::nil()).is_client_error());
        assert!(!Error::StorageFailure("disk full".into()).is_client_error());
        assert!(!Error::DispatchFailure("refused".into()).is_client_error());

        assert!(Error::StorageFailure("busy".into()).is_transient());
        assert!(!Error::SignatureInvalid("x".into()).is_transient());
    }

    #[test]
    fn test_config_errors_are_not_client_errors() {
        let error = Error::InvalidConfig("worker_url is required".into());

        assert!(!error.is_client_error());
        assert!(!error.is_transient());
        assert_eq!(error.to_string(), "Invalid configuration: worker_url is required");
    }

    #[test]
    fn test_from_io_error() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "File not found");
        let converted: Error = io_error.into();

        match converted {
            Error::Io(_) => (),
            _ => panic!("Expected IO error"),
        }
    }

    #[test]
    fn test_from_serde_json_error() {
        let serde_error = serde_json::from_str::<serde_json::Value>("invalid json").unwrap_err();
        let converted: Error = serde_error.into();

        match converted {
            Error::Serialization(_) => (),
            _ => panic!("Expected Serialization error"),
        }
    }
}
