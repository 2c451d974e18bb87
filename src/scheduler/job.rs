//! Job definitions for the scheduler.
//!
//! - `BatchJob`: the task message carrying one whole batch
//! - `JobResult`: result of running a batch job, kept in the broker for a while
//! - `JobStatus`: how the job ended
//! - `OutcomeSummary`: the batch outcome without per-file payloads

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::batch::{BatchOutcome, BatchStatus, FileTask};

/// A whole batch submitted as a single unit of work.
///
/// Batch jobs are never retried: re-running a batch is not idempotent, so a
/// job that cannot finish is dead-lettered instead.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BatchJob {
    /// Unique identifier for this job.
    pub id: Uuid,
    /// Batch the job processes.
    pub batch_id: Uuid,
    /// Optional caller identity.
    #[serde(default)]
    pub owner: Option<String>,
    /// Files in submission order.
    pub files: Vec<FileTask>,
    /// When this job was created.
    pub enqueued_at: DateTime<Utc>,
    /// Optional metadata for tracking and debugging.
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

impl BatchJob {
    /// Creates a job for a batch, numbering files by position.
    pub fn new(batch_id: Uuid, owner: Option<String>, files: Vec<FileTask>) -> Self {
        let files = files
            .into_iter()
            .enumerate()
            .map(|(idx, file)| match file.position {
                Some(_) => file,
                None => file.with_position(idx),
            })
            .collect();

        Self {
            id: Uuid::new_v4(),
            batch_id,
            owner,
            files,
            enqueued_at: Utc::now(),
            metadata: None,
        }
    }

    /// Sets optional metadata for the job.
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Number of files in the batch.
    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    /// Returns how long ago the job was enqueued.
    pub fn age(&self) -> chrono::Duration {
        Utc::now() - self.enqueued_at
    }
}

/// How a batch job ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// The orchestrator returned an outcome.
    Completed,
    /// The orchestrator returned a fatal error.
    Failed,
    /// The hard time limit expired.
    Timeout,
    /// The batch was already claimed by another invocation.
    Rejected,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::Timeout => write!(f, "timeout"),
            JobStatus::Rejected => write!(f, "rejected"),
        }
    }
}

/// A failed file, by name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileFailure {
    pub filename: String,
    pub error: String,
}

/// Batch outcome without the per-file success payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeSummary {
    pub status: BatchStatus,
    pub total_files: u32,
    pub processed_files: u32,
    pub failed_files: u32,
    pub failures: Vec<FileFailure>,
}

impl From<&BatchOutcome> for OutcomeSummary {
    fn from(outcome: &BatchOutcome) -> Self {
        Self {
            status: outcome.status,
            total_files: outcome.total_files,
            processed_files: outcome.processed_files,
            failed_files: outcome.failed_files,
            failures: outcome
                .failures()
                .map(|r| FileFailure {
                    filename: r.filename.clone(),
                    error: r.error.clone().unwrap_or_default(),
                })
                .collect(),
        }
    }
}

/// Result of a batch job execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResult {
    /// ID of the job that was executed.
    pub job_id: Uuid,
    pub batch_id: Uuid,
    pub status: JobStatus,
    /// Outcome summary when the orchestrator ran to the end.
    pub outcome: Option<OutcomeSummary>,
    /// Error message if the job did not complete.
    pub error: Option<String>,
    pub completed_at: DateTime<Utc>,
    /// ID of the worker that processed this job.
    pub worker_id: String,
    pub duration_ms: u64,
}

impl JobResult {
    /// Creates a result for a batch that reached its terminal status.
    pub fn success(
        job: &BatchJob,
        worker_id: impl Into<String>,
        outcome: &BatchOutcome,
        duration_ms: u64,
    ) -> Self {
        Self {
            job_id: job.id,
            batch_id: job.batch_id,
            status: JobStatus::Completed,
            outcome: Some(outcome.into()),
            error: None,
            completed_at: Utc::now(),
            worker_id: worker_id.into(),
            duration_ms,
        }
    }

    /// Creates a result for a batch that failed.
    pub fn failure(
        job: &BatchJob,
        worker_id: impl Into<String>,
        error: impl Into<String>,
        duration_ms: u64,
    ) -> Self {
        Self::ended(job, worker_id, JobStatus::Failed, error, duration_ms)
    }

    /// Creates a result for a batch stopped by the hard time limit.
    pub fn timeout(job: &BatchJob, worker_id: impl Into<String>, duration_ms: u64) -> Self {
        Self::ended(
            job,
            worker_id,
            JobStatus::Timeout,
            "Hard time limit exceeded",
            duration_ms,
        )
    }

    /// Creates a result for a job whose batch was already claimed.
    pub fn rejected(job: &BatchJob, worker_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ended(job, worker_id, JobStatus::Rejected, reason, 0)
    }

    fn ended(
        job: &BatchJob,
        worker_id: impl Into<String>,
        status: JobStatus,
        error: impl Into<String>,
        duration_ms: u64,
    ) -> Self {
        Self {
            job_id: job.id,
            batch_id: job.batch_id,
            status,
            outcome: None,
            error: Some(error.into()),
            completed_at: Utc::now(),
            worker_id: worker_id.into(),
            duration_ms,
        }
    }

    /// Returns whether the batch reached a non-failed terminal status.
    pub fn is_success(&self) -> bool {
        self.status == JobStatus::Completed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::FileResult;

    fn job() -> BatchJob {
        BatchJob::new(
            Uuid::new_v4(),
            Some("alice".to_string()),
            vec![
                FileTask::new("a.jpg", "AAAA"),
                FileTask::new("b.jpg", "BBBB"),
            ],
        )
    }

    #[test]
    fn test_batch_job_numbers_files() {
        let job = job();
        assert!(!job.id.is_nil());
        assert_eq!(job.file_count(), 2);
        assert_eq!(job.files[0].position, Some(0));
        assert_eq!(job.files[1].position, Some(1));
    }

    #[test]
    fn test_batch_job_serialization() {
        let job = job().with_metadata(serde_json::json!({"source": "cli"}));

        let json = serde_json::to_string(&job).expect("serialization should work");
        let parsed: BatchJob = serde_json::from_str(&json).expect("deserialization should work");

        assert_eq!(parsed, job);
    }

    #[test]
    fn test_job_status_display() {
        assert_eq!(format!("{}", JobStatus::Completed), "completed");
        assert_eq!(format!("{}", JobStatus::Failed), "failed");
        assert_eq!(format!("{}", JobStatus::Timeout), "timeout");
        assert_eq!(format!("{}", JobStatus::Rejected), "rejected");
    }

    #[test]
    fn test_job_result_success_summarizes_failures() {
        let job = job();
        let outcome = BatchOutcome {
            batch_id: job.batch_id,
            status: BatchStatus::CompletedWithErrors,
            total_files: 2,
            processed_files: 1,
            failed_files: 1,
            results: vec![FileResult::failure("b.jpg", "bad base64")],
            missed_progress_updates: 0,
        };

        let result = JobResult::success(&job, "worker-1", &outcome, 1200);

        assert!(result.is_success());
        let summary = result.outcome.expect("summary");
        assert_eq!(summary.status, BatchStatus::CompletedWithErrors);
        assert_eq!(summary.failures.len(), 1);
        assert_eq!(summary.failures[0].filename, "b.jpg");
        assert_eq!(summary.failures[0].error, "bad base64");
    }

    #[test]
    fn test_job_result_failure_kinds() {
        let job = job();

        let failed = JobResult::failure(&job, "worker-2", "store down", 10);
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.error.as_deref(), Some("store down"));
        assert!(!failed.is_success());

        let timeout = JobResult::timeout(&job, "worker-3", 30000);
        assert_eq!(timeout.status, JobStatus::Timeout);
        assert!(timeout.outcome.is_none());

        let rejected = JobResult::rejected(&job, "worker-4", "already claimed");
        assert_eq!(rejected.status, JobStatus::Rejected);
        assert_eq!(rejected.duration_ms, 0);
        assert_eq!(rejected.batch_id, job.batch_id);
    }
}
