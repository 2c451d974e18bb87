//! Submission boundary.
//!
//! Validates a batch, creates its progress record and hands it to an
//! execution backend: the distributed backend when one is configured, the
//! in-process fallback when that dispatch fails. A batch that passes
//! validation is never silently dropped.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use uuid::Uuid;

use super::types::{BatchStatus, BatchStatusReport, FileTask};
use crate::error::{StoreError, SubmitError, ValidationError};
use crate::metrics::MetricsCollector;
use crate::scheduler::{Backend, BatchExecutor, BatchJob};
use crate::storage::ProgressStore;

/// A batch as supplied by a caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRequest {
    pub batch_id: Uuid,
    #[serde(default)]
    pub owner: Option<String>,
    pub files: Vec<FileTask>,
}

impl BatchRequest {
    /// Creates a request with a fresh batch id.
    pub fn new(owner: Option<String>, files: Vec<FileTask>) -> Self {
        Self {
            batch_id: Uuid::new_v4(),
            owner,
            files,
        }
    }

    pub fn with_batch_id(mut self, batch_id: Uuid) -> Self {
        self.batch_id = batch_id;
        self
    }
}

/// What the caller gets back for an accepted batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmissionReceipt {
    pub batch_id: Uuid,
    pub job_id: Uuid,
    pub total_files: u32,
    pub status: BatchStatus,
    pub backend: Backend,
}

/// Checks the shape of a submission.
///
/// # Errors
///
/// Rejects an empty batch, a batch over `max_batch_size`, and files without a name.
pub fn validate_files(files: &[FileTask], max_batch_size: usize) -> Result<(), ValidationError> {
    if files.is_empty() {
        return Err(ValidationError::NoFiles);
    }
    if files.len() > max_batch_size {
        return Err(ValidationError::TooManyFiles {
            count: files.len(),
            max: max_batch_size,
        });
    }
    if let Some(position) = files.iter().position(|f| f.filename.trim().is_empty()) {
        return Err(ValidationError::EmptyFilename(position));
    }
    Ok(())
}

/// Accepts batches and routes them to a backend.
pub struct BatchSubmitter {
    max_batch_size: usize,
    progress: Arc<dyn ProgressStore>,
    primary: Option<Arc<dyn BatchExecutor>>,
    fallback: Arc<dyn BatchExecutor>,
}

impl BatchSubmitter {
    /// Creates a submitter that only uses `fallback`.
    pub fn new(
        max_batch_size: usize,
        progress: Arc<dyn ProgressStore>,
        fallback: Arc<dyn BatchExecutor>,
    ) -> Self {
        Self {
            max_batch_size,
            progress,
            primary: None,
            fallback,
        }
    }

    /// Sets the preferred backend.
    pub fn with_primary(mut self, primary: Arc<dyn BatchExecutor>) -> Self {
        self.primary = Some(primary);
        self
    }

    pub fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    /// Validates, records and dispatches a batch.
    ///
    /// # Errors
    ///
    /// - `Validation` before anything is written
    /// - `Store` when the batch record cannot be created
    /// - `Undispatchable` when no backend accepts the batch; the record is
    ///   marked `failed`
    pub async fn submit(&self, request: BatchRequest) -> Result<SubmissionReceipt, SubmitError> {
        validate_files(&request.files, self.max_batch_size)?;

        let BatchRequest {
            batch_id,
            owner,
            files,
        } = request;
        let total_files = files.len() as u32;

        self.progress
            .create(batch_id, owner.as_deref(), total_files)
            .await?;

        let job = BatchJob::new(batch_id, owner, files);
        let job_id = job.id;

        let handle = match &self.primary {
            Some(primary) => match primary.submit(job.clone()).await {
                Ok(handle) => Ok(handle),
                Err(e) => {
                    warn!(
                        batch_id = %batch_id,
                        backend = %primary.backend(),
                        error = %e,
                        "Dispatch failed, falling back to in-process worker"
                    );
                    MetricsCollector::new().record_fallback();
                    self.fallback.submit(job).await
                }
            },
            None => self.fallback.submit(job).await,
        };

        let handle = match handle {
            Ok(handle) => handle,
            Err(source) => {
                error!(batch_id = %batch_id, error = %source, "No backend accepted batch");
                if let Err(e) = self.progress.mark_failed(batch_id).await {
                    error!(batch_id = %batch_id, error = %e, "Could not mark undispatchable batch failed");
                }
                return Err(SubmitError::Undispatchable { batch_id, source });
            }
        };

        info!(
            batch_id = %batch_id,
            job_id = %job_id,
            total_files = total_files,
            backend = %handle.backend,
            "Batch submitted"
        );

        Ok(SubmissionReceipt {
            batch_id,
            job_id,
            total_files,
            status: BatchStatus::Queued,
            backend: handle.backend,
        })
    }

    /// Current status of a batch.
    pub async fn status(&self, batch_id: Uuid) -> Result<BatchStatusReport, StoreError> {
        let batch = self.progress.read(batch_id).await?;
        Ok(BatchStatusReport::from(&batch))
    }

    /// An owner's batches, newest first.
    pub async fn batches_for_owner(&self, owner: &str) -> Result<Vec<BatchStatusReport>, StoreError> {
        let batches = self.progress.list_by_owner(owner).await?;
        Ok(batches.iter().map(BatchStatusReport::from).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DispatchError;
    use crate::scheduler::TaskHandle;
    use crate::storage::MemoryProgressStore;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Records accepted jobs, or refuses everything.
    struct RecordingExecutor {
        backend: Backend,
        refuse: bool,
        accepted: Mutex<Vec<BatchJob>>,
    }

    impl RecordingExecutor {
        fn new(backend: Backend, refuse: bool) -> Arc<Self> {
            Arc::new(Self {
                backend,
                refuse,
                accepted: Mutex::new(Vec::new()),
            })
        }

        fn accepted(&self) -> usize {
            self.accepted.lock().expect("lock").len()
        }
    }

    #[async_trait]
    impl BatchExecutor for RecordingExecutor {
        fn backend(&self) -> Backend {
            self.backend
        }

        async fn submit(&self, job: BatchJob) -> Result<TaskHandle, DispatchError> {
            if self.refuse {
                return Err(DispatchError::BrokerUnavailable("connection refused".to_string()));
            }
            let handle = TaskHandle {
                job_id: job.id,
                batch_id: job.batch_id,
                backend: self.backend,
            };
            self.accepted.lock().expect("lock").push(job);
            Ok(handle)
        }
    }

    fn files(n: usize) -> Vec<FileTask> {
        (0..n)
            .map(|i| FileTask::new(format!("f{}.jpg", i), "AAAA"))
            .collect()
    }

    #[test]
    fn test_validate_files() {
        assert_eq!(validate_files(&[], 50), Err(ValidationError::NoFiles));
        assert_eq!(
            validate_files(&files(51), 50),
            Err(ValidationError::TooManyFiles { count: 51, max: 50 })
        );
        assert!(validate_files(&files(50), 50).is_ok());

        let mut unnamed = files(2);
        unnamed[1].filename = "  ".to_string();
        assert_eq!(
            validate_files(&unnamed, 50),
            Err(ValidationError::EmptyFilename(1))
        );
    }

    #[tokio::test]
    async fn test_prefers_primary() {
        let store = Arc::new(MemoryProgressStore::new());
        let primary = RecordingExecutor::new(Backend::Distributed, false);
        let fallback = RecordingExecutor::new(Backend::Inline, false);
        let submitter =
            BatchSubmitter::new(50, store.clone(), fallback.clone()).with_primary(primary.clone());

        let receipt = submitter
            .submit(BatchRequest::new(Some("alice".to_string()), files(2)))
            .await
            .expect("submit");

        assert_eq!(receipt.backend, Backend::Distributed);
        assert_eq!(receipt.status, BatchStatus::Queued);
        assert_eq!(receipt.total_files, 2);
        assert_eq!(primary.accepted(), 1);
        assert_eq!(fallback.accepted(), 0);

        let report = submitter.status(receipt.batch_id).await.expect("status");
        assert_eq!(report.status, BatchStatus::Queued);
        assert_eq!(report.progress_percentage, 0.0);
    }

    #[tokio::test]
    async fn test_falls_back_on_dispatch_error() {
        let store = Arc::new(MemoryProgressStore::new());
        let primary = RecordingExecutor::new(Backend::Distributed, true);
        let fallback = RecordingExecutor::new(Backend::Inline, false);
        let submitter =
            BatchSubmitter::new(50, store.clone(), fallback.clone()).with_primary(primary);

        let receipt = submitter
            .submit(BatchRequest::new(None, files(1)))
            .await
            .expect("fallback accepts");

        assert_eq!(receipt.backend, Backend::Inline);
        assert_eq!(fallback.accepted(), 1);
    }

    #[tokio::test]
    async fn test_undispatchable_batch_is_failed() {
        let store = Arc::new(MemoryProgressStore::new());
        let submitter = BatchSubmitter::new(
            50,
            store.clone(),
            RecordingExecutor::new(Backend::Inline, true),
        )
        .with_primary(RecordingExecutor::new(Backend::Distributed, true));

        let request = BatchRequest::new(None, files(1));
        let batch_id = request.batch_id;
        let err = submitter.submit(request).await.expect_err("nobody accepts");

        assert!(matches!(err, SubmitError::Undispatchable { .. }));
        assert_eq!(
            store.read(batch_id).await.expect("record exists").status,
            BatchStatus::Failed
        );
    }

    #[tokio::test]
    async fn test_rejected_submission_creates_no_record() {
        let store = Arc::new(MemoryProgressStore::new());
        let fallback = RecordingExecutor::new(Backend::Inline, false);
        let submitter = BatchSubmitter::new(50, store.clone(), fallback.clone());

        let err = submitter
            .submit(BatchRequest::new(None, Vec::new()))
            .await
            .expect_err("empty batch");
        assert!(matches!(err, SubmitError::Validation(ValidationError::NoFiles)));

        let err = submitter
            .submit(BatchRequest::new(None, files(51)))
            .await
            .expect_err("oversized batch");
        assert!(matches!(
            err,
            SubmitError::Validation(ValidationError::TooManyFiles { .. })
        ));

        assert!(store.is_empty().await);
        assert_eq!(fallback.accepted(), 0);
    }

    #[tokio::test]
    async fn test_batches_for_owner() {
        let store = Arc::new(MemoryProgressStore::new());
        let submitter = BatchSubmitter::new(
            50,
            store.clone(),
            RecordingExecutor::new(Backend::Inline, false),
        );

        submitter
            .submit(BatchRequest::new(Some("bob".to_string()), files(1)))
            .await
            .expect("submit");
        submitter
            .submit(BatchRequest::new(Some("carol".to_string()), files(1)))
            .await
            .expect("submit");

        let reports = submitter.batches_for_owner("bob").await.expect("list");
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].total_files, 1);
    }

    #[tokio::test]
    async fn test_duplicate_batch_id_rejected() {
        let store = Arc::new(MemoryProgressStore::new());
        let submitter = BatchSubmitter::new(
            50,
            store.clone(),
            RecordingExecutor::new(Backend::Inline, false),
        );
        let batch_id = Uuid::new_v4();

        submitter
            .submit(BatchRequest::new(None, files(1)).with_batch_id(batch_id))
            .await
            .expect("first");
        let err = submitter
            .submit(BatchRequest::new(None, files(1)).with_batch_id(batch_id))
            .await
            .expect_err("duplicate");
        assert!(matches!(err, SubmitError::Store(StoreError::AlreadyExists(_))));
    }
}
