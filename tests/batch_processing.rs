//! End-to-end batch processing tests.
//!
//! These run entirely in process: memory stores, the in-process fallback
//! worker, and hand-written fakes for the distributed backend.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use medbatch::batch::{
    Batch, BatchOrchestrator, BatchRequest, BatchStatus, BatchSubmitter, ExecutionLimits,
    FileTask,
};
use medbatch::error::{BatchFatalError, DispatchError, StoreError, SubmitError, ValidationError};
use medbatch::pipeline::{sha256_hex, ArtifactCipher, FilePipeline};
use medbatch::scheduler::{
    Backend, BatchExecutor, BatchJob, FallbackConfig, FallbackWorker, InlineExecutor, TaskHandle,
};
use medbatch::storage::{
    ArtifactMetadata, ArtifactSink, Claim, MemoryArtifactStore, MemoryProgressStore,
    ProgressStore, StorageError,
};

const JPEG: &[u8] = &[0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10, b'J', b'F', b'I', b'F', 0x00];

// ============================================================================
// Fakes
// ============================================================================

/// Artifact sink that remembers the batch of every write, in write order.
#[derive(Default)]
struct OrderedSink {
    inner: MemoryArtifactStore,
    writes: Mutex<Vec<Uuid>>,
}

#[async_trait]
impl ArtifactSink for OrderedSink {
    async fn persist_artifact(
        &self,
        owner: Option<&str>,
        metadata: &ArtifactMetadata,
        encrypted: &[u8],
    ) -> Result<Uuid, StorageError> {
        self.writes.lock().expect("lock").push(metadata.batch_id);
        self.inner.persist_artifact(owner, metadata, encrypted).await
    }
}

/// Progress store that records every successful update and can fail writes.
#[derive(Default)]
struct RecordingStore {
    inner: MemoryProgressStore,
    updates: Mutex<Vec<(Uuid, u32, BatchStatus)>>,
    fail_intermediate: bool,
    fail_final: bool,
}

impl RecordingStore {
    fn updates_for(&self, batch_id: Uuid) -> Vec<(u32, BatchStatus)> {
        self.updates
            .lock()
            .expect("lock")
            .iter()
            .filter(|(id, _, _)| *id == batch_id)
            .map(|(_, processed, status)| (*processed, *status))
            .collect()
    }
}

#[async_trait]
impl ProgressStore for RecordingStore {
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
        let failing = match status {
            BatchStatus::Processing => self.fail_intermediate,
            BatchStatus::Failed => false,
            _ => self.fail_final,
        };
        if failing {
            return Err(StoreError::Unavailable("database is down".to_string()));
        }
        self.inner.update(batch_id, processed, total, status).await?;
        self.updates
            .lock()
            .expect("lock")
            .push((batch_id, processed, status));
        Ok(())
    }

    async fn read(&self, batch_id: Uuid) -> Result<Batch, StoreError> {
        self.inner.read(batch_id).await
    }

    async fn list_by_owner(&self, owner: &str) -> Result<Vec<Batch>, StoreError> {
        self.inner.list_by_owner(owner).await
    }
}

/// Distributed backend whose broker is always unreachable.
struct UnreachableBroker;

#[async_trait]
impl BatchExecutor for UnreachableBroker {
    fn backend(&self) -> Backend {
        Backend::Distributed
    }

    async fn submit(&self, _job: BatchJob) -> Result<TaskHandle, DispatchError> {
        Err(DispatchError::BrokerUnavailable("Connection refused (os error 111)".to_string()))
    }
}

// ============================================================================
// Harness
// ============================================================================

struct Harness {
    progress: Arc<RecordingStore>,
    sink: Arc<OrderedSink>,
    cipher: ArtifactCipher,
    orchestrator: Arc<BatchOrchestrator>,
    worker: Arc<FallbackWorker>,
}

impl Harness {
    fn new() -> Self {
        Self::with_store(RecordingStore::default())
    }

    fn with_store(store: RecordingStore) -> Self {
        let progress = Arc::new(store);
        let sink = Arc::new(OrderedSink::default());
        let cipher = ArtifactCipher::generate();
        let pipeline = FilePipeline::new(cipher.clone(), sink.clone());
        let orchestrator = Arc::new(BatchOrchestrator::new(Arc::new(pipeline), progress.clone()));
        let worker = Arc::new(FallbackWorker::new(
            Arc::clone(&orchestrator),
            FallbackConfig::default()
                .with_poll_interval(Duration::from_millis(10))
                .with_error_backoff(Duration::from_millis(10)),
        ));

        Self {
            progress,
            sink,
            cipher,
            orchestrator,
            worker,
        }
    }

    fn submitter(&self) -> BatchSubmitter {
        BatchSubmitter::new(
            50,
            self.progress.clone(),
            Arc::new(InlineExecutor::new(Arc::clone(&self.worker))),
        )
    }

    async fn wait_terminal(&self, batch_id: Uuid) -> Batch {
        for _ in 0..1000 {
            let batch = self.progress.read(batch_id).await.expect("batch exists");
            if batch.status.is_terminal() {
                return batch;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("batch {} did not reach a terminal status", batch_id);
    }

    async fn run_direct(
        &self,
        files: Vec<FileTask>,
    ) -> (Uuid, Result<medbatch::batch::BatchOutcome, BatchFatalError>) {
        let batch_id = Uuid::new_v4();
        self.progress
            .create(batch_id, Some("user-42"), files.len() as u32)
            .await
            .expect("create");
        let outcome = self
            .orchestrator
            .orchestrate(batch_id, files, Some("user-42"), &ExecutionLimits::unlimited())
            .await;
        (batch_id, outcome)
    }
}

fn valid(name: &str) -> FileTask {
    FileTask::from_bytes(name, JPEG)
}

fn corrupt(name: &str) -> FileTask {
    FileTask::new(name, "@@not-base64@@")
}

// ============================================================================
// Outcome rules
// ============================================================================

#[tokio::test]
async fn test_all_files_succeed() {
    let harness = Harness::new();
    let (batch_id, outcome) = harness
        .run_direct(vec![valid("1.jpg"), valid("2.jpg"), valid("3.jpg"), valid("4.jpg")])
        .await;
    let outcome = outcome.expect("batch finishes");

    assert_eq!(outcome.status, BatchStatus::Completed);
    assert_eq!(outcome.processed_files, 4);
    assert_eq!(outcome.total_files, 4);
    assert!(outcome.results.iter().all(|r| r.success && r.artifact_id.is_some()));

    let batch = harness.progress.read(batch_id).await.expect("read");
    assert_eq!(batch.status, BatchStatus::Completed);
    assert_eq!(batch.processed_files, 4);
}

#[tokio::test]
async fn test_some_files_fail() {
    let harness = Harness::new();
    let files = vec![
        valid("1.jpg"),
        corrupt("2.jpg"),
        valid("3.jpg"),
        corrupt("4.jpg"),
        valid("5.jpg"),
    ];
    let (batch_id, outcome) = harness.run_direct(files).await;
    let outcome = outcome.expect("batch finishes");

    assert_eq!(outcome.status, BatchStatus::CompletedWithErrors);
    assert_eq!(outcome.processed_files, 3);
    assert_eq!(outcome.failed_files, 2);
    assert_eq!(
        harness.progress.read(batch_id).await.expect("read").processed_files,
        3
    );
}

#[tokio::test]
async fn test_all_files_fail_is_not_a_failed_batch() {
    let harness = Harness::new();
    let (batch_id, outcome) = harness
        .run_direct(vec![corrupt("1.jpg"), corrupt("2.jpg")])
        .await;
    let outcome = outcome.expect("batch finishes");

    assert_eq!(outcome.status, BatchStatus::CompletedWithErrors);
    assert_eq!(outcome.processed_files, 0);
    assert!(outcome.results.iter().all(|r| !r.success && r.error.is_some()));

    let batch = harness.progress.read(batch_id).await.expect("read");
    assert_eq!(batch.status, BatchStatus::CompletedWithErrors);
}

#[tokio::test]
async fn test_bad_file_in_the_middle() {
    let harness = Harness::new();
    let receipt = harness
        .submitter()
        .submit(BatchRequest::new(
            Some("user-42".to_string()),
            vec![valid("a.jpg"), corrupt("b.jpg"), valid("c.jpg")],
        ))
        .await
        .expect("accepted");
    assert_eq!(receipt.backend, Backend::Inline);
    assert_eq!(receipt.status, BatchStatus::Queued);

    let batch = harness.wait_terminal(receipt.batch_id).await;
    assert_eq!(batch.status, BatchStatus::CompletedWithErrors);
    assert_eq!(batch.processed_files, 2);
    assert_eq!(batch.total_files, 3);

    let stored = harness.sink.inner.for_batch(receipt.batch_id);
    let mut names: Vec<_> = stored
        .iter()
        .map(|a| a.metadata.original_filename.clone())
        .collect();
    names.sort();
    assert_eq!(names, vec!["a.jpg", "c.jpg"]);

    harness.worker.stop().await;
}

#[tokio::test]
async fn test_failure_results_name_the_file() {
    let harness = Harness::new();
    let (_, outcome) = harness
        .run_direct(vec![valid("a.jpg"), corrupt("b.jpg"), valid("c.jpg")])
        .await;
    let outcome = outcome.expect("batch finishes");

    let b = &outcome.results[1];
    assert_eq!(b.filename, "b.jpg");
    assert!(!b.success);
    assert!(b.artifact_id.is_none());
    assert!(outcome.results[2].success, "files after a failure still run");
}

// ============================================================================
// Submission boundary
// ============================================================================

#[tokio::test]
async fn test_empty_submission_rejected_without_record() {
    let harness = Harness::new();
    let err = harness
        .submitter()
        .submit(BatchRequest::new(None, Vec::new()))
        .await
        .expect_err("must be rejected");

    assert!(matches!(err, SubmitError::Validation(ValidationError::NoFiles)));
    assert!(harness.progress.inner.is_empty().await);
    assert!(!harness.worker.is_running());
}

#[tokio::test]
async fn test_oversized_submission_rejected_without_record() {
    let harness = Harness::new();
    let files: Vec<FileTask> = (0..51).map(|i| valid(&format!("{}.jpg", i))).collect();

    let err = harness
        .submitter()
        .submit(BatchRequest::new(None, files))
        .await
        .expect_err("must be rejected");

    assert!(matches!(
        err,
        SubmitError::Validation(ValidationError::TooManyFiles { count: 51, max: 50 })
    ));
    assert!(harness.progress.inner.is_empty().await);
}

#[tokio::test]
async fn test_dispatch_failure_falls_back_to_inline() {
    let harness = Harness::new();
    let submitter = harness.submitter().with_primary(Arc::new(UnreachableBroker));

    let receipt = submitter
        .submit(BatchRequest::new(None, vec![valid("x.jpg")]))
        .await
        .expect("fallback accepts the batch");

    assert_eq!(receipt.backend, Backend::Inline);
    let batch = harness.wait_terminal(receipt.batch_id).await;
    assert_eq!(batch.status, BatchStatus::Completed);

    let report = submitter.status(receipt.batch_id).await.expect("status");
    assert_eq!(report.progress_percentage, 100.0);

    harness.worker.stop().await;
}

// ============================================================================
// Pipeline guarantees
// ============================================================================

#[tokio::test]
async fn test_fingerprint_survives_encryption() {
    let harness = Harness::new();
    let (_, outcome) = harness.run_direct(vec![valid("scan.jpg")]).await;
    let outcome = outcome.expect("batch finishes");
    let result = &outcome.results[0];

    let artifact = harness
        .sink
        .inner
        .get(result.artifact_id.expect("artifact id"))
        .expect("stored");
    let plain = harness.cipher.decrypt(&artifact.encrypted).expect("decrypts");

    assert_eq!(result.fingerprint.as_deref(), Some(sha256_hex(&plain).as_str()));
    assert_eq!(artifact.metadata.fingerprint, sha256_hex(&plain));
    assert_ne!(artifact.encrypted, plain);
}

// ============================================================================
// Scheduling
// ============================================================================

#[tokio::test]
async fn test_fallback_runs_batches_in_order() {
    let harness = Harness::new();
    let submitter = harness.submitter();

    let first = submitter
        .submit(BatchRequest::new(None, vec![valid("1a.jpg"), valid("1b.jpg"), valid("1c.jpg")]))
        .await
        .expect("first");
    let second = submitter
        .submit(BatchRequest::new(None, vec![valid("2a.jpg"), valid("2b.jpg")]))
        .await
        .expect("second");

    harness.wait_terminal(first.batch_id).await;
    harness.wait_terminal(second.batch_id).await;

    let writes = harness.sink.writes.lock().expect("lock").clone();
    assert_eq!(writes.len(), 5);
    let last_first = writes
        .iter()
        .rposition(|id| *id == first.batch_id)
        .expect("first batch wrote");
    let first_second = writes
        .iter()
        .position(|id| *id == second.batch_id)
        .expect("second batch wrote");
    assert!(last_first < first_second, "batches interleaved: {:?}", writes);

    harness.worker.stop().await;
}

#[tokio::test]
async fn test_double_dispatch_is_rejected() {
    let harness = Harness::new();
    let batch_id = Uuid::new_v4();
    harness
        .progress
        .create(batch_id, None, 2)
        .await
        .expect("create");
    let files = vec![valid("a.jpg"), valid("b.jpg")];

    let limits = ExecutionLimits::unlimited();
    let (first, second) = tokio::join!(
        harness.orchestrator.orchestrate(batch_id, files.clone(), None, &limits),
        harness.orchestrator.orchestrate(batch_id, files, None, &limits),
    );

    let outcomes = [first, second];
    let finished = outcomes.iter().filter(|r| r.is_ok()).count();
    let rejected = outcomes
        .iter()
        .filter(|r| matches!(r, Err(BatchFatalError::AlreadyClaimed(_))))
        .count();
    assert_eq!((finished, rejected), (1, 1));

    let batch = harness.progress.read(batch_id).await.expect("read");
    assert_eq!(batch.status, BatchStatus::Completed);
    assert_eq!(batch.processed_files, 2);
    assert_eq!(harness.sink.inner.len(), 2);
}

// ============================================================================
// Progress store behaviour
// ============================================================================

#[tokio::test]
async fn test_progress_is_monotonic_and_bounded() {
    let harness = Harness::new();
    let files = vec![valid("1.jpg"), corrupt("2.jpg"), valid("3.jpg"), valid("4.jpg")];
    let (batch_id, outcome) = harness.run_direct(files).await;
    outcome.expect("batch finishes");

    let updates = harness.progress.updates_for(batch_id);
    assert_eq!(updates.len(), 5, "one write per file plus the final status");
    assert!(updates.windows(2).all(|w| w[0].0 <= w[1].0));
    assert!(updates.iter().all(|(processed, _)| *processed <= 4));
    assert!(updates[..4].iter().all(|(_, s)| *s == BatchStatus::Processing));
    assert_eq!(updates[4], (3, BatchStatus::CompletedWithErrors));
}

#[tokio::test]
async fn test_intermediate_write_failures_are_skipped() {
    let harness = Harness::with_store(RecordingStore {
        fail_intermediate: true,
        ..Default::default()
    });
    let (batch_id, outcome) = harness
        .run_direct(vec![valid("1.jpg"), valid("2.jpg"), valid("3.jpg")])
        .await;
    let outcome = outcome.expect("intermediate failures are not fatal");

    assert_eq!(outcome.status, BatchStatus::Completed);
    assert_eq!(outcome.missed_progress_updates, 3);
    assert_eq!(outcome.processed_files, 3);
    assert_eq!(
        harness.progress.read(batch_id).await.expect("read").status,
        BatchStatus::Completed
    );
}

#[tokio::test]
async fn test_final_write_failure_fails_batch() {
    let harness = Harness::with_store(RecordingStore {
        fail_final: true,
        ..Default::default()
    });
    let (batch_id, outcome) = harness.run_direct(vec![valid("1.jpg")]).await;

    assert!(matches!(outcome, Err(BatchFatalError::FinalWrite { .. })));
    assert_eq!(
        harness.progress.read(batch_id).await.expect("read").status,
        BatchStatus::Failed
    );
}

#[tokio::test]
async fn test_owner_listing() {
    let harness = Harness::new();
    let submitter = harness.submitter();

    let receipt = submitter
        .submit(BatchRequest::new(Some("dr-who".to_string()), vec![valid("a.jpg")]))
        .await
        .expect("submit");
    harness.wait_terminal(receipt.batch_id).await;

    let reports = submitter.batches_for_owner("dr-who").await.expect("list");
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].batch_id, receipt.batch_id);
    assert_eq!(reports[0].status, BatchStatus::Completed);
    assert!(submitter
        .batches_for_owner("nobody")
        .await
        .expect("list")
        .is_empty());

    harness.worker.stop().await;
}
