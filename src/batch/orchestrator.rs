//! Backend-agnostic batch orchestration.
//!
//! Both execution backends run a batch through [`BatchOrchestrator`], so a
//! batch ends in the same state whichever backend picked it up.
//!
//! One invocation:
//!
//! 1. Claims the batch (`queued -> processing`); a batch that is already
//!    claimed is left untouched
//! 2. Runs the file pipeline over each file, strictly in submission order
//! 3. Writes progress after every file; a failed intermediate write is logged
//!    and skipped
//! 4. Writes the terminal status; a failed final write fails the batch
//!
//! Any batch-level error marks the batch `failed` before it is returned.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::batch::{BatchOutcome, BatchStatus, FileResult, FileTask};
use crate::error::{BatchFatalError, StoreError};
use crate::metrics::MetricsCollector;
use crate::pipeline::FilePipeline;
use crate::storage::{Claim, ProgressStore};

/// Bounded per-file retry budget.
///
/// A file that fails is processed again up to `max_file_retries` more times
/// within the same invocation. Batches themselves are never retried.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_file_retries: u32,
}

impl RetryPolicy {
    /// No retries: the first failure is final.
    pub fn none() -> Self {
        Self::default()
    }

    pub fn with_max_file_retries(max_file_retries: u32) -> Self {
        Self { max_file_retries }
    }
}

/// Wall-clock limits for one invocation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecutionLimits {
    /// Checked between files; exceeding it stops the batch as `failed`.
    pub soft_time_limit: Option<Duration>,
    /// Ceiling for the whole invocation, enforced by [`BatchOrchestrator::run_supervised`].
    pub hard_time_limit: Option<Duration>,
}

impl ExecutionLimits {
    /// No limits.
    pub fn unlimited() -> Self {
        Self::default()
    }

    /// Soft and hard limits.
    pub fn new(soft_time_limit: Duration, hard_time_limit: Duration) -> Self {
        Self {
            soft_time_limit: Some(soft_time_limit),
            hard_time_limit: Some(hard_time_limit),
        }
    }

    /// Sets only the soft limit.
    pub fn with_soft_limit(mut self, limit: Duration) -> Self {
        self.soft_time_limit = Some(limit);
        self
    }

    /// Sets only the hard limit.
    pub fn with_hard_limit(mut self, limit: Duration) -> Self {
        self.hard_time_limit = Some(limit);
        self
    }
}

/// Keeps the in-progress gauge balanced on every exit path.
struct InProgress(MetricsCollector);

impl InProgress {
    fn enter() -> Self {
        let metrics = MetricsCollector::new();
        metrics.inc_batches_in_progress();
        Self(metrics)
    }
}

impl Drop for InProgress {
    fn drop(&mut self) {
        self.0.dec_batches_in_progress();
    }
}

/// Drives the file pipeline over a batch and keeps its progress record.
pub struct BatchOrchestrator {
    pipeline: Arc<FilePipeline>,
    progress: Arc<dyn ProgressStore>,
    retry: RetryPolicy,
}

impl BatchOrchestrator {
    /// Creates an orchestrator without per-file retries.
    pub fn new(pipeline: Arc<FilePipeline>, progress: Arc<dyn ProgressStore>) -> Self {
        Self {
            pipeline,
            progress,
            retry: RetryPolicy::none(),
        }
    }

    /// Sets the per-file retry policy.
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Returns the progress store batches are tracked in.
    pub fn progress(&self) -> &Arc<dyn ProgressStore> {
        &self.progress
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Runs one batch to a terminal state.
    ///
    /// Only the soft limit of `limits` is honored here; see
    /// [`run_supervised`](Self::run_supervised) for the hard limit.
    ///
    /// # Errors
    ///
    /// - `AlreadyClaimed` when another invocation owns the batch; nothing is written
    /// - `UnknownBatch` when no record exists
    /// - any other variant after the batch has been marked `failed`
    pub async fn orchestrate(
        &self,
        batch_id: Uuid,
        files: Vec<FileTask>,
        owner: Option<&str>,
        limits: &ExecutionLimits,
    ) -> Result<BatchOutcome, BatchFatalError> {
        let started = Instant::now();

        let batch = match self.progress.begin(batch_id).await {
            Ok(Claim::Claimed(batch)) => batch,
            Ok(Claim::AlreadyClaimed(status)) => {
                warn!(batch_id = %batch_id, status = %status, "Batch already claimed, skipping");
                return Err(BatchFatalError::AlreadyClaimed(batch_id));
            }
            Err(StoreError::NotFound(_)) => return Err(BatchFatalError::UnknownBatch(batch_id)),
            Err(e) => {
                error!(batch_id = %batch_id, error = %e, "Failed to claim batch");
                self.fail_batch(batch_id).await;
                return Err(BatchFatalError::Store(e));
            }
        };

        let total = batch.total_files;
        if files.len() != total as usize {
            error!(
                batch_id = %batch_id,
                expected = total,
                actual = files.len(),
                "File count does not match the batch record"
            );
            self.fail_batch(batch_id).await;
            return Err(BatchFatalError::FileCountMismatch {
                batch_id,
                expected: total,
                actual: files.len(),
            });
        }

        let _in_progress = InProgress::enter();
        let metrics = MetricsCollector::new();

        info!(
            batch_id = %batch_id,
            total_files = total,
            submitted_files = files.len(),
            "Batch processing started"
        );

        let mut results: Vec<FileResult> = Vec::with_capacity(files.len());
        let mut processed: u32 = 0;
        let mut failed: u32 = 0;
        let mut missed_updates: u32 = 0;

        for (file_index, file) in files.into_iter().enumerate() {
            if let Some(limit) = limits.soft_time_limit {
                if started.elapsed() >= limit {
                    warn!(
                        batch_id = %batch_id,
                        file_index = file_index,
                        limit_secs = limit.as_secs(),
                        "Soft time limit exceeded, stopping batch"
                    );
                    self.fail_batch(batch_id).await;
                    return Err(BatchFatalError::SoftTimeLimitExceeded(limit));
                }
            }

            let result = self.process_with_retry(file, batch_id, owner).await;
            metrics.record_file(result.success);

            if result.success {
                processed += 1;
                debug!(batch_id = %batch_id, file_index = file_index, filename = %result.filename, "File processed");
            } else {
                failed += 1;
                warn!(
                    batch_id = %batch_id,
                    file_index = file_index,
                    filename = %result.filename,
                    error = result.error.as_deref().unwrap_or("unknown error"),
                    "File failed"
                );
            }
            results.push(result);

            if let Err(e) = self
                .progress
                .update(batch_id, processed, total, BatchStatus::Processing)
                .await
            {
                missed_updates += 1;
                warn!(
                    batch_id = %batch_id,
                    file_index = file_index,
                    error = %e,
                    "Intermediate progress write failed, continuing"
                );
            }
        }

        let status = BatchStatus::terminal_for(failed as usize);
        if let Err(source) = self.progress.update(batch_id, processed, total, status).await {
            error!(batch_id = %batch_id, status = %status, error = %source, "Final status write failed");
            self.fail_batch(batch_id).await;
            return Err(BatchFatalError::FinalWrite { batch_id, source });
        }

        info!(
            batch_id = %batch_id,
            status = %status,
            processed_files = processed,
            failed_files = failed,
            missed_progress_updates = missed_updates,
            duration_ms = started.elapsed().as_millis() as u64,
            "Batch processing finished"
        );

        Ok(BatchOutcome {
            batch_id,
            status,
            total_files: total,
            processed_files: processed,
            failed_files: failed,
            results,
            missed_progress_updates: missed_updates,
        })
    }

    /// Runs [`orchestrate`](Self::orchestrate) on its own task under the hard limit.
    ///
    /// A panic inside the invocation becomes `Panicked`, an expired hard limit
    /// becomes `HardTimeLimitExceeded`; in both cases the batch is marked
    /// `failed` here because the invocation itself could not do it.
    pub async fn run_supervised(
        self: Arc<Self>,
        batch_id: Uuid,
        files: Vec<FileTask>,
        owner: Option<String>,
        limits: ExecutionLimits,
    ) -> Result<BatchOutcome, BatchFatalError> {
        let orchestrator = Arc::clone(&self);
        let mut task = tokio::spawn(async move {
            orchestrator
                .orchestrate(batch_id, files, owner.as_deref(), &limits)
                .await
        });

        let joined = match limits.hard_time_limit {
            Some(limit) => match tokio::time::timeout(limit, &mut task).await {
                Ok(joined) => joined,
                Err(_) => {
                    task.abort();
                    error!(batch_id = %batch_id, limit_secs = limit.as_secs(), "Hard time limit exceeded, batch aborted");
                    self.fail_batch(batch_id).await;
                    return Err(BatchFatalError::HardTimeLimitExceeded(limit));
                }
            },
            None => task.await,
        };

        match joined {
            Ok(result) => result,
            Err(join_error) => {
                error!(batch_id = %batch_id, error = %join_error, "Batch task panicked");
                self.fail_batch(batch_id).await;
                Err(BatchFatalError::Panicked(join_error.to_string()))
            }
        }
    }

    async fn process_with_retry(
        &self,
        file: FileTask,
        batch_id: Uuid,
        owner: Option<&str>,
    ) -> FileResult {
        let mut attempt = 0;
        loop {
            let result = self.pipeline.process(file.clone(), batch_id, owner).await;
            if result.success || attempt >= self.retry.max_file_retries {
                return result;
            }
            attempt += 1;
            debug!(
                batch_id = %batch_id,
                filename = %file.filename,
                attempt = attempt,
                "Retrying failed file"
            );
        }
    }

    /// Best-effort `failed` mark; the original error is what gets reported.
    async fn fail_batch(&self, batch_id: Uuid) {
        if let Err(e) = self.progress.mark_failed(batch_id).await {
            error!(batch_id = %batch_id, error = %e, "Could not mark batch failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::Batch;
    use crate::batch::ContentKind;
    use crate::pipeline::{ArtifactCipher, DicomError, ImageConverter, SecondaryCaptureConverter};
    use crate::storage::{MemoryArtifactStore, MemoryProgressStore};
    use async_trait::async_trait;
    use std::sync::Mutex;

    const JPEG: &[u8] = &[0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10, b'J', b'F', b'I', b'F'];

    /// Wraps a memory store, recording every update and failing on demand.
    #[derive(Default)]
    struct ScriptedStore {
        inner: MemoryProgressStore,
        updates: Mutex<Vec<(u32, BatchStatus)>>,
        fail_intermediate: bool,
        fail_final: bool,
    }

    #[async_trait]
    impl ProgressStore for ScriptedStore {
        async fn create(
            &self,
            batch_id: Uuid,
            owner: Option<&str>,
            total_files: u32,
        ) -> Result<Batch, StoreError> {
            self.inner.create(batch_id, owner, total_files).await
        }

        async fn begin(&self, batch_id: Uuid) -> Result<Claim, StoreError> {
            self.inner.begin(batch_id).await
        }

        async fn update(
            &self,
            batch_id: Uuid,
            processed: u32,
            total: u32,
            status: BatchStatus,
        ) -> Result<(), StoreError> {
            let failing = if status == BatchStatus::Processing {
                self.fail_intermediate
            } else {
                self.fail_final && status != BatchStatus::Failed
            };
            if failing {
                return Err(StoreError::Unavailable("connection reset".to_string()));
            }
            self.updates
                .lock()
                .expect("lock")
                .push((processed, status));
            self.inner.update(batch_id, processed, total, status).await
        }

        async fn read(&self, batch_id: Uuid) -> Result<Batch, StoreError> {
            self.inner.read(batch_id).await
        }

        async fn list_by_owner(&self, owner: &str) -> Result<Vec<Batch>, StoreError> {
            self.inner.list_by_owner(owner).await
        }
    }

    fn orchestrator(store: Arc<dyn ProgressStore>) -> BatchOrchestrator {
        let pipeline = FilePipeline::new(
            ArtifactCipher::generate(),
            Arc::new(MemoryArtifactStore::new()),
        );
        BatchOrchestrator::new(Arc::new(pipeline), store)
    }

    fn files(valid: usize) -> Vec<FileTask> {
        (0..valid)
            .map(|i| FileTask::from_bytes(format!("img{}.jpg", i), JPEG))
            .collect()
    }

    #[tokio::test]
    async fn test_all_files_succeed() {
        let store = Arc::new(MemoryProgressStore::new());
        let batch_id = Uuid::new_v4();
        store.create(batch_id, None, 3).await.expect("create");

        let outcome = orchestrator(store.clone())
            .orchestrate(batch_id, files(3), None, &ExecutionLimits::unlimited())
            .await
            .expect("batch should finish");

        assert_eq!(outcome.status, BatchStatus::Completed);
        assert_eq!(outcome.processed_files, 3);
        assert!(outcome.results.iter().all(|r| r.success));

        let record = store.read(batch_id).await.expect("read");
        assert_eq!(record.status, BatchStatus::Completed);
        assert_eq!(record.processed_files, 3);
    }

    #[tokio::test]
    async fn test_progress_written_after_every_file() {
        let store = Arc::new(ScriptedStore::default());
        let batch_id = Uuid::new_v4();
        store.create(batch_id, None, 3).await.expect("create");

        let mut batch = files(3);
        batch[1] = FileTask::new("bad.jpg", "%%%");

        orchestrator(store.clone())
            .orchestrate(batch_id, batch, None, &ExecutionLimits::unlimited())
            .await
            .expect("batch should finish");

        let updates = store.updates.lock().expect("lock").clone();
        assert_eq!(
            updates,
            vec![
                (1, BatchStatus::Processing),
                (1, BatchStatus::Processing),
                (2, BatchStatus::Processing),
                (2, BatchStatus::CompletedWithErrors),
            ]
        );
    }

    #[tokio::test]
    async fn test_failed_intermediate_writes_do_not_stop_batch() {
        let store = Arc::new(ScriptedStore {
            fail_intermediate: true,
            ..Default::default()
        });
        let batch_id = Uuid::new_v4();
        store.create(batch_id, None, 2).await.expect("create");

        let outcome = orchestrator(store.clone())
            .orchestrate(batch_id, files(2), None, &ExecutionLimits::unlimited())
            .await
            .expect("batch should finish");

        assert_eq!(outcome.status, BatchStatus::Completed);
        assert_eq!(outcome.missed_progress_updates, 2);
        assert_eq!(store.read(batch_id).await.expect("read").processed_files, 2);
    }

    #[tokio::test]
    async fn test_failed_final_write_fails_batch() {
        let store = Arc::new(ScriptedStore {
            fail_final: true,
            ..Default::default()
        });
        let batch_id = Uuid::new_v4();
        store.create(batch_id, None, 1).await.expect("create");

        let err = orchestrator(store.clone())
            .orchestrate(batch_id, files(1), None, &ExecutionLimits::unlimited())
            .await
            .expect_err("final write failure is fatal");

        assert!(matches!(err, BatchFatalError::FinalWrite { .. }));
        let record = store.read(batch_id).await.expect("read");
        assert_eq!(record.status, BatchStatus::Failed);
        assert_eq!(record.processed_files, 1);
    }

    #[tokio::test]
    async fn test_second_invocation_is_rejected() {
        let store = Arc::new(MemoryProgressStore::new());
        let batch_id = Uuid::new_v4();
        store.create(batch_id, None, 1).await.expect("create");
        let orchestrator = orchestrator(store.clone());

        orchestrator
            .orchestrate(batch_id, files(1), None, &ExecutionLimits::unlimited())
            .await
            .expect("first run");
        let err = orchestrator
            .orchestrate(batch_id, files(1), None, &ExecutionLimits::unlimited())
            .await
            .expect_err("second run must not re-process");

        assert!(matches!(err, BatchFatalError::AlreadyClaimed(id) if id == batch_id));
        let record = store.read(batch_id).await.expect("read");
        assert_eq!(record.status, BatchStatus::Completed);
        assert_eq!(record.processed_files, 1);
    }

    #[tokio::test]
    async fn test_unknown_batch() {
        let store = Arc::new(MemoryProgressStore::new());
        let err = orchestrator(store)
            .orchestrate(Uuid::new_v4(), files(1), None, &ExecutionLimits::unlimited())
            .await
            .expect_err("no record");
        assert!(matches!(err, BatchFatalError::UnknownBatch(_)));
    }

    #[tokio::test]
    async fn test_file_count_mismatch_fails_batch() {
        let sink = Arc::new(MemoryArtifactStore::new());
        let pipeline = FilePipeline::new(ArtifactCipher::generate(), sink.clone());
        let store = Arc::new(MemoryProgressStore::new());
        let batch_id = Uuid::new_v4();
        store.create(batch_id, None, 3).await.expect("create");

        let err = BatchOrchestrator::new(Arc::new(pipeline), store.clone())
            .orchestrate(batch_id, files(2), None, &ExecutionLimits::unlimited())
            .await
            .expect_err("two files for a three-file batch");

        assert!(matches!(
            err,
            BatchFatalError::FileCountMismatch { expected: 3, actual: 2, .. }
        ));
        let record = store.read(batch_id).await.expect("read");
        assert_eq!(record.status, BatchStatus::Failed);
        assert_eq!(record.processed_files, 0);
        assert_eq!(sink.len(), 0);
    }

    #[tokio::test]
    async fn test_soft_limit_stops_batch() {
        let store = Arc::new(MemoryProgressStore::new());
        let batch_id = Uuid::new_v4();
        store.create(batch_id, None, 2).await.expect("create");

        let limits = ExecutionLimits::unlimited().with_soft_limit(Duration::ZERO);
        let err = orchestrator(store.clone())
            .orchestrate(batch_id, files(2), None, &limits)
            .await
            .expect_err("soft limit of zero stops before the first file");

        assert!(matches!(err, BatchFatalError::SoftTimeLimitExceeded(_)));
        let record = store.read(batch_id).await.expect("read");
        assert_eq!(record.status, BatchStatus::Failed);
        assert_eq!(record.processed_files, 0);
    }

    #[tokio::test]
    async fn test_retry_policy_reprocesses_failed_file() {
        let sink = Arc::new(MemoryArtifactStore::new());
        sink.fail_next_writes(1);
        let pipeline = FilePipeline::new(ArtifactCipher::generate(), sink.clone());
        let store = Arc::new(MemoryProgressStore::new());
        let batch_id = Uuid::new_v4();
        store.create(batch_id, None, 1).await.expect("create");

        let outcome = BatchOrchestrator::new(Arc::new(pipeline), store.clone())
            .with_retry_policy(RetryPolicy::with_max_file_retries(1))
            .orchestrate(batch_id, files(1), None, &ExecutionLimits::unlimited())
            .await
            .expect("batch should finish");

        assert_eq!(outcome.status, BatchStatus::Completed);
        assert_eq!(sink.len(), 1);
    }

    #[tokio::test]
    async fn test_run_supervised_returns_outcome() {
        let store = Arc::new(MemoryProgressStore::new());
        let batch_id = Uuid::new_v4();
        store.create(batch_id, Some("alice"), 1).await.expect("create");

        let outcome = Arc::new(orchestrator(store.clone()))
            .run_supervised(
                batch_id,
                files(1),
                Some("alice".to_string()),
                ExecutionLimits::new(Duration::from_secs(60), Duration::from_secs(120)),
            )
            .await
            .expect("batch should finish");

        assert_eq!(outcome.status, BatchStatus::Completed);
    }

    #[tokio::test]
    async fn test_hard_limit_aborts_slow_batch() {
        struct SlowConverter(Duration);
        impl ImageConverter for SlowConverter {
            fn convert(
                &self,
                source: &[u8],
                kind: ContentKind,
                artifact_id: Uuid,
            ) -> Result<Vec<u8>, DicomError> {
                std::thread::sleep(self.0);
                SecondaryCaptureConverter.convert(source, kind, artifact_id)
            }
        }

        let sink = Arc::new(MemoryArtifactStore::new());
        let pipeline = FilePipeline::new(ArtifactCipher::generate(), sink.clone())
            .with_converter(Arc::new(SlowConverter(Duration::from_millis(500))));
        let store = Arc::new(MemoryProgressStore::new());
        let batch_id = Uuid::new_v4();
        store.create(batch_id, None, 1).await.expect("create");

        let limit = Duration::from_millis(50);
        let err = Arc::new(BatchOrchestrator::new(Arc::new(pipeline), store.clone()))
            .run_supervised(
                batch_id,
                files(1),
                None,
                ExecutionLimits::unlimited().with_hard_limit(limit),
            )
            .await
            .expect_err("converter outlives the hard limit");

        assert!(matches!(err, BatchFatalError::HardTimeLimitExceeded(l) if l == limit));
        assert_eq!(store.read(batch_id).await.expect("read").status, BatchStatus::Failed);

        // The aborted invocation must not persist anything once the converter returns.
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(sink.len(), 0);
        assert_eq!(store.read(batch_id).await.expect("read").status, BatchStatus::Failed);
    }
}
