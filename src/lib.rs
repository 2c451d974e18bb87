//! medbatch: batch processing engine for medical image uploads.
//!
//! A submitted batch of files is validated, recorded as `queued`, and run on
//! one of two backends: a Redis-backed worker pool or an in-process fallback
//! worker. Either way the same orchestrator converts each file to DICOM,
//! strips direct identifiers, encrypts the result and records provenance,
//! while one bad file never takes the batch down with it.

pub mod batch;
pub mod cli;
pub mod error;
pub mod metrics;
pub mod pipeline;
pub mod scheduler;
pub mod storage;

// Re-export commonly used error types
pub use error::{
    BatchFatalError, DispatchError, PipelineError, StoreError, SubmitError, ValidationError,
};
