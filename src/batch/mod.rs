//! Batch lifecycle: configuration, submission and orchestration.
//!
//! A batch is created `queued` by [`BatchSubmitter`], claimed and driven to a
//! terminal state by [`BatchOrchestrator`], and read back as a
//! [`BatchStatusReport`].

pub mod config;
pub mod orchestrator;
pub mod submission;
pub mod types;

pub use config::{ConfigError, EngineConfig, DEFAULT_MAX_BATCH_SIZE};
pub use orchestrator::{BatchOrchestrator, ExecutionLimits, RetryPolicy};
pub use submission::{validate_files, BatchRequest, BatchSubmitter, SubmissionReceipt};
pub use types::{
    progress_percentage, Batch, BatchOutcome, BatchStatus, BatchStatusReport, Classification,
    ContentKind, FileResult, FileTask,
};
