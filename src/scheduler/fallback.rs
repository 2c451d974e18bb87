//! In-process fallback worker.
//!
//! Used when the broker cannot accept a batch. One background task drains a
//! FIFO of batch jobs, one batch at a time, so batches enqueued here never
//! overlap. The worker is an explicit object: each instance owns its queue
//! and lifecycle, and nothing is process-global.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::executor::Backend;
use super::job::BatchJob;
use crate::batch::{BatchOrchestrator, BatchStatus, EngineConfig, ExecutionLimits};
use crate::error::{BatchFatalError, DispatchError};
use crate::metrics::MetricsCollector;

/// Timing for the fallback worker.
#[derive(Debug, Clone, Copy)]
pub struct FallbackConfig {
    /// Idle wait between queue checks.
    pub poll_interval: Duration,
    /// Pause after a batch ends with a batch-level error.
    pub error_backoff: Duration,
    /// Limits applied to every batch.
    pub limits: ExecutionLimits,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            error_backoff: Duration::from_secs(5),
            limits: ExecutionLimits::new(Duration::from_secs(25 * 60), Duration::from_secs(30 * 60)),
        }
    }
}

impl FallbackConfig {
    pub fn from_engine(config: &EngineConfig) -> Self {
        Self {
            poll_interval: config.fallback_poll_interval,
            error_backoff: config.fallback_error_backoff,
            limits: ExecutionLimits::new(config.soft_time_limit, config.hard_time_limit),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_error_backoff(mut self, backoff: Duration) -> Self {
        self.error_backoff = backoff;
        self
    }

    pub fn with_limits(mut self, limits: ExecutionLimits) -> Self {
        self.limits = limits;
        self
    }
}

/// Snapshot of the fallback worker.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FallbackStats {
    pub running: bool,
    pub pending: usize,
    pub batches_completed: u64,
    pub batches_failed: u64,
}

/// State shared between the worker object and its drain task.
#[derive(Default)]
struct Shared {
    queue: Mutex<VecDeque<BatchJob>>,
    notify: Notify,
    batches_completed: AtomicU64,
    batches_failed: AtomicU64,
}

impl Shared {
    fn queue(&self) -> MutexGuard<'_, VecDeque<BatchJob>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn pop(&self) -> Option<BatchJob> {
        self.queue().pop_front()
    }
}

struct Running {
    shutdown_tx: broadcast::Sender<()>,
    handle: JoinHandle<()>,
}

/// Single background worker draining a FIFO of batches.
pub struct FallbackWorker {
    orchestrator: Arc<BatchOrchestrator>,
    config: FallbackConfig,
    shared: Arc<Shared>,
    running: Mutex<Option<Running>>,
}

impl FallbackWorker {
    /// Creates a stopped worker.
    pub fn new(orchestrator: Arc<BatchOrchestrator>, config: FallbackConfig) -> Self {
        Self {
            orchestrator,
            config,
            shared: Arc::new(Shared::default()),
            running: Mutex::new(None),
        }
    }

    fn running(&self) -> MutexGuard<'_, Option<Running>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Starts the drain task.
    ///
    /// Returns `Ok(false)` when it is already running.
    ///
    /// # Errors
    ///
    /// Returns `DispatchError::NotRunning` when called outside a Tokio runtime.
    pub fn start(&self) -> Result<bool, DispatchError> {
        let runtime =
            tokio::runtime::Handle::try_current().map_err(|_| DispatchError::NotRunning)?;

        let mut running = self.running();
        if let Some(current) = running.as_ref() {
            if !current.handle.is_finished() {
                return Ok(false);
            }
        }

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let drain = Drain {
            orchestrator: Arc::clone(&self.orchestrator),
            config: self.config,
            shared: Arc::clone(&self.shared),
        };
        let handle = runtime.spawn(drain.run(shutdown_rx));
        *running = Some(Running {
            shutdown_tx,
            handle,
        });

        info!("Fallback worker started");
        Ok(true)
    }

    /// Stops the drain task after the batch in hand, if any, finishes.
    ///
    /// Batches still queued stay queued and run on the next start. Returns
    /// `false` when the worker was not running.
    pub async fn stop(&self) -> bool {
        let running = self.running().take();
        let Some(Running {
            shutdown_tx,
            handle,
        }) = running
        else {
            return false;
        };

        // The task may already have exited.
        let _ = shutdown_tx.send(());
        if let Err(e) = handle.await {
            error!(error = %e, "Fallback worker task panicked");
        }

        info!(pending = self.pending(), "Fallback worker stopped");
        true
    }

    /// Appends a batch to the queue, starting the worker if needed.
    ///
    /// Never waits for the batch to run. Returns the number of queued batches.
    pub fn enqueue(&self, job: BatchJob) -> Result<usize, DispatchError> {
        self.start()?;

        let pending = {
            let mut queue = self.shared.queue();
            queue.push_back(job);
            queue.len()
        };
        self.shared.notify.notify_one();
        Ok(pending)
    }

    /// Returns whether the drain task is alive.
    pub fn is_running(&self) -> bool {
        self.running()
            .as_ref()
            .is_some_and(|r| !r.handle.is_finished())
    }

    /// Number of batches waiting to run.
    pub fn pending(&self) -> usize {
        self.shared.queue().len()
    }

    pub fn stats(&self) -> FallbackStats {
        FallbackStats {
            running: self.is_running(),
            pending: self.pending(),
            batches_completed: self.shared.batches_completed.load(Ordering::SeqCst),
            batches_failed: self.shared.batches_failed.load(Ordering::SeqCst),
        }
    }
}

/// The drain loop, owned by the background task.
struct Drain {
    orchestrator: Arc<BatchOrchestrator>,
    config: FallbackConfig,
    shared: Arc<Shared>,
}

impl Drain {
    async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        loop {
            match shutdown_rx.try_recv() {
                Ok(()) | Err(broadcast::error::TryRecvError::Closed) => break,
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(broadcast::error::TryRecvError::Empty) => {}
            }

            let Some(job) = self.shared.pop() else {
                tokio::select! {
                    _ = self.shared.notify.notified() => {}
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                    _ = shutdown_rx.recv() => break,
                }
                continue;
            };

            if !self.run_job(job).await {
                tokio::select! {
                    _ = tokio::time::sleep(self.config.error_backoff) => {}
                    _ = shutdown_rx.recv() => break,
                }
            }
        }

        debug!("Fallback drain loop exited");
    }

    /// Runs one batch. Returns `false` when it ended with a batch-level error.
    async fn run_job(&self, job: BatchJob) -> bool {
        let started = Instant::now();
        let job_id = job.id;
        let batch_id = job.batch_id;
        let metrics = MetricsCollector::new();

        info!(job_id = %job_id, batch_id = %batch_id, files = job.file_count(), "Running batch in process");

        let result = Arc::clone(&self.orchestrator)
            .run_supervised(batch_id, job.files, job.owner, self.config.limits)
            .await;
        let duration = started.elapsed();

        match result {
            Ok(outcome) => {
                self.shared.batches_completed.fetch_add(1, Ordering::SeqCst);
                metrics.record_batch(outcome.status, Backend::Inline.as_str(), duration.as_secs_f64());
                true
            }
            Err(BatchFatalError::AlreadyClaimed(_)) => {
                warn!(job_id = %job_id, batch_id = %batch_id, "Batch already claimed elsewhere");
                true
            }
            Err(e) => {
                self.shared.batches_failed.fetch_add(1, Ordering::SeqCst);
                metrics.record_batch(BatchStatus::Failed, Backend::Inline.as_str(), duration.as_secs_f64());
                error!(
                    job_id = %job_id,
                    batch_id = %batch_id,
                    error = %e,
                    backoff_ms = self.config.error_backoff.as_millis() as u64,
                    "Batch failed in process, backing off"
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::FileTask;
    use crate::pipeline::{ArtifactCipher, FilePipeline};
    use crate::storage::{MemoryArtifactStore, MemoryProgressStore, ProgressStore};
    use uuid::Uuid;

    fn worker(store: Arc<MemoryProgressStore>) -> FallbackWorker {
        let pipeline = FilePipeline::new(
            ArtifactCipher::generate(),
            Arc::new(MemoryArtifactStore::new()),
        );
        let orchestrator = BatchOrchestrator::new(Arc::new(pipeline), store);
        let config = FallbackConfig::default()
            .with_poll_interval(Duration::from_millis(10))
            .with_error_backoff(Duration::from_millis(10));
        FallbackWorker::new(Arc::new(orchestrator), config)
    }

    async fn wait_terminal(store: &MemoryProgressStore, batch_id: Uuid) -> BatchStatus {
        for _ in 0..500 {
            let status = store.read(batch_id).await.expect("read").status;
            if status.is_terminal() {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("batch {} never finished", batch_id);
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let worker = worker(Arc::new(MemoryProgressStore::new()));

        assert!(!worker.is_running());
        assert!(worker.start().expect("start"));
        assert!(!worker.start().expect("second start"));
        assert!(worker.is_running());

        assert!(worker.stop().await);
        assert!(!worker.is_running());
        assert!(!worker.stop().await);
    }

    #[test]
    fn test_start_outside_runtime_fails() {
        let worker = worker(Arc::new(MemoryProgressStore::new()));
        assert!(matches!(worker.start(), Err(DispatchError::NotRunning)));
    }

    #[tokio::test]
    async fn test_enqueue_starts_and_runs_batch() {
        let store = Arc::new(MemoryProgressStore::new());
        let worker = worker(store.clone());
        let batch_id = Uuid::new_v4();
        store.create(batch_id, None, 1).await.expect("create");

        let job = BatchJob::new(batch_id, None, vec![FileTask::from_bytes("a.png", b"\x89PNG\r\n\x1a\n")]);
        worker.enqueue(job).expect("enqueue");
        assert!(worker.is_running());

        assert_eq!(wait_terminal(&store, batch_id).await, BatchStatus::Completed);
        worker.stop().await;
        assert_eq!(worker.stats().batches_completed, 1);
    }

    #[tokio::test]
    async fn test_worker_survives_failed_batch() {
        let store = Arc::new(MemoryProgressStore::new());
        let worker = worker(store.clone());

        // No record exists for this batch, so it fails at the batch level.
        worker
            .enqueue(BatchJob::new(Uuid::new_v4(), None, vec![FileTask::new("x.jpg", "AAAA")]))
            .expect("enqueue");

        let batch_id = Uuid::new_v4();
        store.create(batch_id, None, 1).await.expect("create");
        worker
            .enqueue(BatchJob::new(batch_id, None, vec![FileTask::new("bad.jpg", "%%")]))
            .expect("enqueue");

        assert_eq!(
            wait_terminal(&store, batch_id).await,
            BatchStatus::CompletedWithErrors
        );
        assert!(worker.is_running());

        // Stopping waits for the batch in hand, so the counters are final.
        worker.stop().await;
        let stats = worker.stats();
        assert_eq!(stats.batches_failed, 1);
        assert_eq!(stats.batches_completed, 1);
    }

    #[tokio::test]
    async fn test_independent_instances() {
        let first = worker(Arc::new(MemoryProgressStore::new()));
        let second = worker(Arc::new(MemoryProgressStore::new()));

        first.start().expect("start");
        assert!(first.is_running());
        assert!(!second.is_running());
        first.stop().await;
    }
}
