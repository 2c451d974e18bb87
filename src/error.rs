//! Error types for batch processing.
//!
//! The taxonomy follows where an error is allowed to travel:
//! - `ValidationError`: bad submission shape, rejected before a batch exists
//! - `PipelineError`: per-file, recorded in a `FileResult`, never escapes the orchestrator
//! - `DispatchError`: distributed backend unavailable, triggers the in-process fallback
//! - `StoreError`: progress store failures
//! - `BatchFatalError`: anything that stops a batch; always ends the batch as `failed`
//! - `SubmitError`: what the submission boundary reports to its caller

use thiserror::Error;
use uuid::Uuid;

use crate::batch::BatchStatus;

/// Errors raised when a submission does not have an acceptable shape.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("No files provided")]
    NoFiles,

    #[error("Batch size too large: {count} files (max {max})")]
    TooManyFiles { count: usize, max: usize },

    #[error("File at position {0} has an empty filename")]
    EmptyFilename(usize),
}

/// Errors raised while processing a single file.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("File content is missing")]
    MissingContent,

    #[error("Failed to decode base64 content: {0}")]
    Decode(#[from] base64::DecodeError),

    #[error("Temporary file error: {0}")]
    TempFile(#[source] std::io::Error),

    #[error("Conversion to DICOM failed: {0}")]
    Conversion(String),

    #[error("Anonymization failed: {0}")]
    Anonymization(#[from] crate::pipeline::dicom::DicomError),

    #[error("Encryption failed: {0}")]
    Encryption(#[from] crate::pipeline::crypto::CryptoError),

    #[error("Artifact persistence failed: {0}")]
    Persistence(#[from] crate::storage::StorageError),

    #[error("Processing step panicked: {0}")]
    Panicked(String),
}

/// Errors raised when the distributed backend cannot accept a batch.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Broker unreachable: {0}")]
    BrokerUnavailable(String),

    #[error("Failed to serialize task message: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Backend is not running")]
    NotRunning,
}

impl From<crate::scheduler::QueueError> for DispatchError {
    fn from(err: crate::scheduler::QueueError) -> Self {
        match err {
            crate::scheduler::QueueError::SerializationFailed(e) => DispatchError::Serialization(e),
            other => DispatchError::BrokerUnavailable(other.to_string()),
        }
    }
}

/// Errors raised by a progress store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Batch {0} not found")]
    NotFound(Uuid),

    #[error("Batch {0} already exists")]
    AlreadyExists(Uuid),

    #[error("Invalid status transition for batch {batch_id}: {from} -> {to}")]
    InvalidTransition {
        batch_id: Uuid,
        from: BatchStatus,
        to: BatchStatus,
    },

    #[error("Progress for batch {batch_id} would regress from {current} to {requested}")]
    ProgressRegression {
        batch_id: Uuid,
        current: u32,
        requested: u32,
    },

    #[error("Processed count {processed} exceeds total {total} for batch {batch_id}")]
    ProgressOverflow {
        batch_id: Uuid,
        processed: u32,
        total: u32,
    },

    #[error("Progress store unavailable: {0}")]
    Unavailable(String),
}

impl From<crate::storage::DatabaseError> for StoreError {
    fn from(err: crate::storage::DatabaseError) -> Self {
        StoreError::Unavailable(err.to_string())
    }
}

/// Errors that stop a batch before it reaches a normal terminal state.
#[derive(Debug, Error)]
pub enum BatchFatalError {
    #[error("Batch {0} is already claimed by another invocation")]
    AlreadyClaimed(Uuid),

    #[error("Batch {0} has no progress record")]
    UnknownBatch(Uuid),

    #[error("Progress store failed: {0}")]
    Store(#[from] StoreError),

    #[error("Batch {batch_id} expects {expected} files but {actual} were supplied")]
    FileCountMismatch {
        batch_id: Uuid,
        expected: u32,
        actual: usize,
    },

    #[error("Final status write failed for batch {batch_id}: {source}")]
    FinalWrite {
        batch_id: Uuid,
        #[source]
        source: StoreError,
    },

    #[error("Soft time limit of {0:?} exceeded")]
    SoftTimeLimitExceeded(std::time::Duration),

    #[error("Hard time limit of {0:?} exceeded")]
    HardTimeLimitExceeded(std::time::Duration),

    #[error("Batch task panicked: {0}")]
    Panicked(String),
}

/// Errors reported by the submission boundary.
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Progress store error: {0}")]
    Store(#[from] StoreError),

    #[error("All backends rejected batch {batch_id}: {source}")]
    Undispatchable {
        batch_id: Uuid,
        #[source]
        source: DispatchError,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_display() {
        assert!(ValidationError::NoFiles.to_string().contains("No files"));
        let err = ValidationError::TooManyFiles { count: 51, max: 50 };
        assert!(err.to_string().contains("51"));
        assert!(err.to_string().contains("50"));
    }

    #[test]
    fn test_store_error_display() {
        let id = Uuid::new_v4();
        let err = StoreError::InvalidTransition {
            batch_id: id,
            from: BatchStatus::Completed,
            to: BatchStatus::Processing,
        };
        assert!(err.to_string().contains("completed -> processing"));

        let err = StoreError::ProgressRegression {
            batch_id: id,
            current: 3,
            requested: 2,
        };
        assert!(err.to_string().contains("from 3 to 2"));
    }

    #[test]
    fn test_queue_error_maps_to_dispatch_error() {
        let err: DispatchError =
            crate::scheduler::QueueError::ConnectionFailed("refused".to_string()).into();
        assert!(matches!(err, DispatchError::BrokerUnavailable(_)));
        assert!(err.to_string().contains("refused"));
    }

    #[test]
    fn test_batch_fatal_error_display() {
        let err = BatchFatalError::SoftTimeLimitExceeded(std::time::Duration::from_secs(1500));
        assert!(err.to_string().contains("1500"));
    }
}
