//! Worker pool for processing batch jobs from the Redis queue.
//!
//! This module provides a pool of workers that process batch jobs from a
//! shared Redis queue. Each worker runs as an independent async task, pulls
//! one job at a time and runs the whole batch through the orchestrator.
//!
//! # Features
//!
//! - Configurable number of workers
//! - Graceful shutdown with broadcast channel
//! - Hard and soft per-batch time limits
//! - Late acknowledgement: a job leaves the processing list only once its
//!   batch has reached a terminal state
//! - Worker rotation: after `max_tasks_per_worker` batches a slot replaces its
//!   worker with a fresh one. This resets per-worker state inside the same
//!   process; it does not release process memory, so long-lived deployments
//!   bound that by restarting `medbatch worker` itself
//! - A heartbeat per pool; jobs held by a pool whose heartbeat expired are
//!   dead-lettered by the next pool to start, never re-run
//! - Pool statistics tracking

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use uuid::Uuid;

use thiserror::Error;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::executor::Backend;
use super::job::{BatchJob, JobResult};
use super::queue::{JobQueue, QueueError};
use crate::batch::{BatchOrchestrator, BatchStatus, EngineConfig, ExecutionLimits};
use crate::error::BatchFatalError;
use crate::metrics::MetricsCollector;

/// Errors that can occur in the worker pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// Failed to connect to the job queue.
    #[error("Queue connection failed: {0}")]
    QueueConnection(#[from] QueueError),

    /// Pool is already running.
    #[error("Pool is already running")]
    AlreadyRunning,

    /// Pool is not running.
    #[error("Pool is not running")]
    NotRunning,

    /// Shutdown timed out.
    #[error("Shutdown timed out after {0:?}")]
    ShutdownTimeout(Duration),
}

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of worker tasks to spawn.
    pub num_workers: usize,
    /// Redis connection URL.
    pub redis_url: String,
    /// Name of the job queue.
    pub queue_name: String,
    /// How long a dequeue blocks before the worker re-checks for shutdown.
    pub poll_interval: Duration,
    /// Per-batch time limits.
    pub limits: ExecutionLimits,
    /// Batches a worker runs before it is replaced.
    pub max_tasks_per_worker: u32,
    /// How long job results are kept in Redis.
    pub result_ttl: Duration,
    /// Timeout for graceful shutdown.
    pub shutdown_timeout: Duration,
    /// Lifetime of the pool's liveness key; refreshed every third of it.
    pub heartbeat_ttl: Duration,
}

/// Default lifetime of a pool heartbeat.
pub const DEFAULT_HEARTBEAT_TTL: Duration = Duration::from_secs(30);

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self::from_engine(&EngineConfig::default())
    }
}

impl WorkerPoolConfig {
    /// Creates a new configuration with the specified number of workers.
    pub fn new(num_workers: usize) -> Self {
        Self {
            num_workers,
            ..Default::default()
        }
    }

    /// Takes the distributed backend settings from the engine configuration.
    pub fn from_engine(config: &EngineConfig) -> Self {
        Self {
            num_workers: config.num_workers,
            redis_url: config.redis_url.clone(),
            queue_name: config.queue_name.clone(),
            poll_interval: config.poll_interval,
            limits: ExecutionLimits::new(config.soft_time_limit, config.hard_time_limit),
            max_tasks_per_worker: config.max_tasks_per_worker,
            result_ttl: config.result_ttl,
            shutdown_timeout: config.shutdown_timeout,
            heartbeat_ttl: DEFAULT_HEARTBEAT_TTL,
        }
    }

    /// Sets the Redis URL.
    pub fn with_redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = url.into();
        self
    }

    /// Sets the queue name.
    pub fn with_queue_name(mut self, name: impl Into<String>) -> Self {
        self.queue_name = name.into();
        self
    }

    /// Sets the poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Sets the per-batch time limits.
    pub fn with_limits(mut self, limits: ExecutionLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Sets how many batches a worker runs before it is rotated out.
    pub fn with_max_tasks_per_worker(mut self, max: u32) -> Self {
        self.max_tasks_per_worker = max;
        self
    }

    /// Sets the shutdown timeout.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Sets the heartbeat lifetime.
    pub fn with_heartbeat_ttl(mut self, ttl: Duration) -> Self {
        self.heartbeat_ttl = ttl;
        self
    }

    /// How often a running pool refreshes its heartbeat.
    pub fn heartbeat_interval(&self) -> Duration {
        (self.heartbeat_ttl / 3).max(Duration::from_millis(100))
    }
}

/// Statistics about the worker pool.
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    /// Total number of workers in the pool.
    pub num_workers: usize,
    /// Number of workers currently running a batch.
    pub active_workers: usize,
    /// Batches that reached `completed` or `completed_with_errors`.
    pub batches_completed: u64,
    /// Batches that ended `failed`.
    pub batches_failed: u64,
    /// Jobs skipped because their batch was already claimed.
    pub batches_rejected: u64,
    /// Workers replaced after reaching their task limit.
    pub workers_rotated: u64,
    /// Average batch processing duration.
    pub average_batch_duration: Duration,
}

impl PoolStats {
    /// Returns the total number of batches run (completed + failed).
    pub fn total_processed(&self) -> u64 {
        self.batches_completed + self.batches_failed
    }

    /// Returns the success rate as a percentage.
    pub fn success_rate(&self) -> f64 {
        let total = self.total_processed();
        if total == 0 {
            return 0.0;
        }
        (self.batches_completed as f64 / total as f64) * 100.0
    }
}

/// Shared state for tracking pool statistics.
struct SharedPoolStats {
    batches_completed: AtomicU64,
    batches_failed: AtomicU64,
    batches_rejected: AtomicU64,
    workers_rotated: AtomicU64,
    total_duration_ms: AtomicU64,
    active_workers: AtomicU64,
}

impl SharedPoolStats {
    fn new() -> Self {
        Self {
            batches_completed: AtomicU64::new(0),
            batches_failed: AtomicU64::new(0),
            batches_rejected: AtomicU64::new(0),
            workers_rotated: AtomicU64::new(0),
            total_duration_ms: AtomicU64::new(0),
            active_workers: AtomicU64::new(0),
        }
    }

    fn record_completion(&self, duration: Duration) {
        self.batches_completed.fetch_add(1, Ordering::SeqCst);
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    fn record_failure(&self, duration: Duration) {
        self.batches_failed.fetch_add(1, Ordering::SeqCst);
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    fn record_rejection(&self) {
        self.batches_rejected.fetch_add(1, Ordering::SeqCst);
    }

    fn record_rotation(&self) {
        self.workers_rotated.fetch_add(1, Ordering::SeqCst);
    }

    fn increment_active(&self) {
        self.active_workers.fetch_add(1, Ordering::SeqCst);
    }

    fn decrement_active(&self) {
        self.active_workers.fetch_sub(1, Ordering::SeqCst);
    }

    fn to_pool_stats(&self, num_workers: usize) -> PoolStats {
        let completed = self.batches_completed.load(Ordering::SeqCst);
        let failed = self.batches_failed.load(Ordering::SeqCst);
        let total_duration_ms = self.total_duration_ms.load(Ordering::SeqCst);

        let total = completed + failed;
        let average_duration = if total > 0 {
            Duration::from_millis(total_duration_ms / total)
        } else {
            Duration::ZERO
        };

        PoolStats {
            num_workers,
            active_workers: self.active_workers.load(Ordering::SeqCst) as usize,
            batches_completed: completed,
            batches_failed: failed,
            batches_rejected: self.batches_rejected.load(Ordering::SeqCst),
            workers_rotated: self.workers_rotated.load(Ordering::SeqCst),
            average_batch_duration: average_duration,
        }
    }
}

/// Worker pool that manages multiple workers processing batch jobs.
pub struct WorkerPool {
    config: WorkerPoolConfig,
    queue: Arc<JobQueue>,
    orchestrator: Arc<BatchOrchestrator>,
    /// Consumer name of this pool on the queue.
    consumer: String,
    shutdown_tx: broadcast::Sender<()>,
    worker_handles: Vec<JoinHandle<()>>,
    heartbeat: Option<(oneshot::Sender<()>, JoinHandle<()>)>,
    stats: Arc<SharedPoolStats>,
    is_running: AtomicBool,
}

impl WorkerPool {
    /// Creates a new worker pool.
    ///
    /// # Errors
    ///
    /// Returns `PoolError` if queue connection fails.
    pub async fn new(
        config: WorkerPoolConfig,
        orchestrator: Arc<BatchOrchestrator>,
    ) -> Result<Self, PoolError> {
        let queue = JobQueue::connect(&config.redis_url, &config.queue_name).await?;
        Ok(Self::with_queue(config, Arc::new(queue), orchestrator))
    }

    /// Creates a worker pool with an existing queue connection.
    pub fn with_queue(
        config: WorkerPoolConfig,
        queue: Arc<JobQueue>,
        orchestrator: Arc<BatchOrchestrator>,
    ) -> Self {
        // Buffer size of 1 is sufficient since we only send once
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            config,
            queue,
            orchestrator,
            consumer: format!("pool-{}", Uuid::new_v4()),
            shutdown_tx,
            worker_handles: Vec::new(),
            heartbeat: None,
            stats: Arc::new(SharedPoolStats::new()),
            is_running: AtomicBool::new(false),
        }
    }

    /// Starts all workers in the pool.
    ///
    /// Registers the pool's heartbeat, then dead-letters jobs held by pools
    /// whose heartbeat has expired and marks their batches `failed`. Pools
    /// that are still alive keep their jobs.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::AlreadyRunning` if the pool is already running,
    /// or `PoolError::QueueConnection` if the first heartbeat fails.
    pub async fn start(&mut self) -> Result<(), PoolError> {
        if self.is_running.load(Ordering::SeqCst) {
            return Err(PoolError::AlreadyRunning);
        }

        self.queue
            .heartbeat(&self.consumer, self.config.heartbeat_ttl)
            .await?;
        let (stop_tx, stop_rx) = oneshot::channel();
        let handle = tokio::spawn(run_heartbeat(
            Arc::clone(&self.queue),
            self.consumer.clone(),
            self.config.heartbeat_ttl,
            self.config.heartbeat_interval(),
            stop_rx,
        ));
        self.heartbeat = Some((stop_tx, handle));

        self.recover_abandoned_jobs().await;

        for slot in 0..self.config.num_workers {
            let handle = tokio::spawn(run_slot(
                slot,
                self.worker_parts(),
                self.shutdown_tx.subscribe(),
            ));
            self.worker_handles.push(handle);
        }

        self.is_running.store(true, Ordering::SeqCst);
        MetricsCollector::new().update_workers(self.config.num_workers);
        info!(
            num_workers = self.config.num_workers,
            queue = %self.config.queue_name,
            consumer = %self.consumer,
            "Worker pool started"
        );

        Ok(())
    }

    async fn recover_abandoned_jobs(&self) {
        let recovered = match self.queue.recover_abandoned_jobs().await {
            Ok(recovered) => recovered,
            Err(e) => {
                warn!(error = %e, "Failed to recover abandoned jobs");
                return;
            }
        };

        if recovered.is_empty() {
            return;
        }
        info!(recovered = recovered.len(), "Dead-lettered jobs abandoned by dead pools");

        for job in recovered {
            match self.orchestrator.progress().mark_failed(job.batch_id).await {
                Ok(batch) => {
                    warn!(batch_id = %job.batch_id, status = %batch.status, "Abandoned batch closed");
                }
                Err(e) => {
                    error!(batch_id = %job.batch_id, error = %e, "Could not close abandoned batch");
                }
            }
        }
    }

    fn worker_parts(&self) -> WorkerParts {
        WorkerParts {
            queue: Arc::clone(&self.queue),
            consumer: self.consumer.clone(),
            orchestrator: Arc::clone(&self.orchestrator),
            poll_interval: self.config.poll_interval,
            limits: self.config.limits,
            max_tasks: self.config.max_tasks_per_worker,
            result_ttl: self.config.result_ttl,
            stats: Arc::clone(&self.stats),
        }
    }

    /// Gracefully shuts down all workers.
    ///
    /// Sends a shutdown signal to all workers and waits for them to finish
    /// their current batches.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::ShutdownTimeout` if workers don't stop within
    /// the configured timeout.
    pub async fn shutdown(&mut self) -> Result<(), PoolError> {
        if !self.is_running.load(Ordering::SeqCst) {
            return Err(PoolError::NotRunning);
        }

        info!("Initiating worker pool shutdown");

        // Ignore send error - workers may have already stopped
        let _ = self.shutdown_tx.send(());

        let timeout = self.config.shutdown_timeout;
        let shutdown_future = async {
            for handle in self.worker_handles.drain(..) {
                if let Err(e) = handle.await {
                    error!(error = %e, "Worker task panicked during shutdown");
                }
            }
        };

        let result = tokio::time::timeout(timeout, shutdown_future).await;
        self.is_running.store(false, Ordering::SeqCst);
        MetricsCollector::new().update_workers(0);

        // Beat until the workers are done so a slow drain is not recovered
        // from under them.
        if let Some((stop_tx, handle)) = self.heartbeat.take() {
            let _ = stop_tx.send(());
            if let Err(e) = handle.await {
                error!(error = %e, "Heartbeat task panicked during shutdown");
            }
        }

        match result {
            Ok(()) => {
                match self.queue.retire(&self.consumer).await {
                    Ok(true) => debug!(consumer = %self.consumer, "Consumer retired"),
                    Ok(false) => warn!(consumer = %self.consumer, "Consumer still holds jobs, left for recovery"),
                    Err(e) => warn!(consumer = %self.consumer, error = %e, "Failed to retire consumer"),
                }
                info!("Worker pool shutdown complete");
                Ok(())
            }
            // Jobs still held expire into recovery with the heartbeat.
            Err(_) => Err(PoolError::ShutdownTimeout(timeout)),
        }
    }

    /// Returns current pool statistics.
    pub fn stats(&self) -> PoolStats {
        self.stats.to_pool_stats(self.config.num_workers)
    }

    /// Returns whether the pool is currently running.
    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    /// Returns the number of workers in the pool.
    pub fn num_workers(&self) -> usize {
        self.config.num_workers
    }

    /// Returns a reference to the job queue.
    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.queue
    }

    /// Returns the consumer name this pool uses on the queue.
    pub fn consumer(&self) -> &str {
        &self.consumer
    }
}

/// Refreshes the pool heartbeat until shutdown.
async fn run_heartbeat(
    queue: Arc<JobQueue>,
    consumer: String,
    ttl: Duration,
    interval: Duration,
    mut stop_rx: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = &mut stop_rx => break,
        }
        if let Err(e) = queue.heartbeat(&consumer, ttl).await {
            warn!(consumer = %consumer, error = %e, "Failed to refresh heartbeat");
        }
    }
    debug!(consumer = %consumer, "Heartbeat stopped");
}

/// Everything a worker needs, shared by every generation in a slot.
#[derive(Clone)]
struct WorkerParts {
    queue: Arc<JobQueue>,
    consumer: String,
    orchestrator: Arc<BatchOrchestrator>,
    poll_interval: Duration,
    limits: ExecutionLimits,
    max_tasks: u32,
    result_ttl: Duration,
    stats: Arc<SharedPoolStats>,
}

/// Why a worker stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WorkerExit {
    Shutdown,
    Rotated,
}

/// Names a worker; unique across pools sharing a queue.
fn worker_id(consumer: &str, slot: usize, generation: u64) -> String {
    format!("{}-worker-{}-{}", consumer, slot, generation)
}

/// Keeps one worker alive in a slot, rotating in a fresh worker each time
/// the current one reaches its task limit.
async fn run_slot(slot: usize, parts: WorkerParts, mut shutdown_rx: broadcast::Receiver<()>) {
    let mut generation = 0u64;
    loop {
        let worker = Worker::new(worker_id(&parts.consumer, slot, generation), parts.clone());
        match worker.run(&mut shutdown_rx).await {
            WorkerExit::Shutdown => break,
            WorkerExit::Rotated => {
                parts.stats.record_rotation();
                generation += 1;
            }
        }
    }
}

/// A single worker that processes batch jobs from the queue.
pub struct Worker {
    id: String,
    parts: WorkerParts,
    tasks_run: u32,
}

impl Worker {
    fn new(id: String, parts: WorkerParts) -> Self {
        Self {
            id,
            parts,
            tasks_run: 0,
        }
    }

    /// Main worker loop.
    ///
    /// Polls for jobs until a shutdown signal arrives or the worker has run
    /// its share of batches.
    async fn run(mut self, shutdown_rx: &mut broadcast::Receiver<()>) -> WorkerExit {
        info!(worker_id = %self.id, "Worker started");

        let exit = loop {
            match shutdown_rx.try_recv() {
                Ok(()) | Err(broadcast::error::TryRecvError::Closed) => {
                    info!(worker_id = %self.id, "Worker received shutdown signal");
                    break WorkerExit::Shutdown;
                }
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(broadcast::error::TryRecvError::Empty) => {}
            }

            if self.tasks_run >= self.parts.max_tasks {
                info!(worker_id = %self.id, tasks_run = self.tasks_run, "Worker reached task limit, rotating");
                break WorkerExit::Rotated;
            }

            match self
                .parts
                .queue
                .dequeue(&self.parts.consumer, self.parts.poll_interval)
                .await
            {
                Ok(Some(job)) => {
                    self.process_job(job).await;
                    self.tasks_run += 1;
                }
                Ok(None) => {
                    debug!(worker_id = %self.id, "No jobs available");
                }
                Err(e) => {
                    error!(worker_id = %self.id, error = %e, "Failed to dequeue job");
                    tokio::time::sleep(self.parts.poll_interval).await;
                }
            }
        };

        info!(worker_id = %self.id, exit = ?exit, "Worker stopped");
        exit
    }

    /// Runs one batch and acknowledges its job.
    async fn process_job(&self, job: BatchJob) {
        let start_time = Instant::now();
        let stats = &self.parts.stats;

        info!(
            worker_id = %self.id,
            job_id = %job.id,
            batch_id = %job.batch_id,
            files = job.file_count(),
            queued_ms = job.age().num_milliseconds(),
            "Processing batch job"
        );

        stats.increment_active();
        let run = Arc::clone(&self.parts.orchestrator)
            .run_supervised(
                job.batch_id,
                job.files.clone(),
                job.owner.clone(),
                self.parts.limits,
            )
            .await;
        stats.decrement_active();

        let duration = start_time.elapsed();
        let duration_ms = duration.as_millis() as u64;
        let metrics = MetricsCollector::new();
        let backend = Backend::Distributed.as_str();

        let (job_result, dead_letter) = match run {
            Ok(outcome) => {
                stats.record_completion(duration);
                metrics.record_batch(outcome.status, backend, duration.as_secs_f64());
                info!(
                    worker_id = %self.id,
                    batch_id = %job.batch_id,
                    status = %outcome.status,
                    duration_ms = duration_ms,
                    "Batch job finished"
                );
                (JobResult::success(&job, &self.id, &outcome, duration_ms), false)
            }
            Err(BatchFatalError::AlreadyClaimed(_)) => {
                stats.record_rejection();
                warn!(worker_id = %self.id, batch_id = %job.batch_id, "Batch already claimed, job dropped");
                (JobResult::rejected(&job, &self.id, "batch already claimed"), false)
            }
            Err(BatchFatalError::HardTimeLimitExceeded(limit)) => {
                stats.record_failure(duration);
                metrics.record_batch(BatchStatus::Failed, backend, duration.as_secs_f64());
                error!(worker_id = %self.id, batch_id = %job.batch_id, limit_secs = limit.as_secs(), "Batch job timed out");
                (JobResult::timeout(&job, &self.id, duration_ms), true)
            }
            Err(e) => {
                stats.record_failure(duration);
                metrics.record_batch(BatchStatus::Failed, backend, duration.as_secs_f64());
                error!(worker_id = %self.id, batch_id = %job.batch_id, error = %e, "Batch job failed");
                (JobResult::failure(&job, &self.id, e.to_string(), duration_ms), true)
            }
        };

        if let Err(e) = self
            .parts
            .queue
            .complete(&self.parts.consumer, &job, &job_result, self.parts.result_ttl)
            .await
        {
            error!(worker_id = %self.id, job_id = %job.id, error = %e, "Failed to acknowledge job");
        }

        if dead_letter {
            let reason = job_result.error.as_deref().unwrap_or("batch failed");
            if let Err(e) = self.parts.queue.dead_letter(&self.parts.consumer, &job, reason).await {
                error!(worker_id = %self.id, job_id = %job.id, error = %e, "Failed to move job to dead letter queue");
            }
        }
    }

    /// Returns the worker's ID.
    pub fn id(&self) -> &str {
        &self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_pool_config_default() {
        let config = WorkerPoolConfig::default();

        assert_eq!(config.num_workers, 4);
        assert_eq!(config.redis_url, "redis://localhost:6379/0");
        assert_eq!(config.queue_name, "dicom_batches");
        assert_eq!(config.poll_interval, Duration::from_secs(1));
        assert_eq!(config.limits.hard_time_limit, Some(Duration::from_secs(1800)));
        assert_eq!(config.limits.soft_time_limit, Some(Duration::from_secs(1500)));
        assert_eq!(config.max_tasks_per_worker, 100);
        assert_eq!(config.result_ttl, Duration::from_secs(3600));
        assert_eq!(config.shutdown_timeout, Duration::from_secs(60));
        assert_eq!(config.heartbeat_ttl, DEFAULT_HEARTBEAT_TTL);
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(10));
    }

    #[test]
    fn test_heartbeat_interval_is_a_third_of_ttl() {
        let config = WorkerPoolConfig::default().with_heartbeat_ttl(Duration::from_secs(9));
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(3));

        // Redis expiries are whole seconds, so tiny intervals are pointless.
        let tiny = WorkerPoolConfig::default().with_heartbeat_ttl(Duration::from_millis(30));
        assert_eq!(tiny.heartbeat_interval(), Duration::from_millis(100));
    }

    #[test]
    fn test_worker_ids_are_unique_across_pools_and_rotations() {
        let a = worker_id("pool-a", 0, 0);
        assert_eq!(a, "pool-a-worker-0-0");
        assert_ne!(a, worker_id("pool-b", 0, 0));
        assert_ne!(a, worker_id("pool-a", 0, 1));
        assert_ne!(a, worker_id("pool-a", 1, 0));
    }

    #[test]
    fn test_worker_pool_config_builder() {
        let config = WorkerPoolConfig::new(8)
            .with_redis_url("redis://custom:6380")
            .with_queue_name("my_queue")
            .with_poll_interval(Duration::from_secs(5))
            .with_limits(ExecutionLimits::new(Duration::from_secs(50), Duration::from_secs(60)))
            .with_max_tasks_per_worker(10)
            .with_shutdown_timeout(Duration::from_secs(120));

        assert_eq!(config.num_workers, 8);
        assert_eq!(config.redis_url, "redis://custom:6380");
        assert_eq!(config.queue_name, "my_queue");
        assert_eq!(config.poll_interval, Duration::from_secs(5));
        assert_eq!(config.limits.hard_time_limit, Some(Duration::from_secs(60)));
        assert_eq!(config.max_tasks_per_worker, 10);
        assert_eq!(config.shutdown_timeout, Duration::from_secs(120));
    }

    #[test]
    fn test_pool_stats_default() {
        let stats = PoolStats::default();

        assert_eq!(stats.num_workers, 0);
        assert_eq!(stats.active_workers, 0);
        assert_eq!(stats.batches_completed, 0);
        assert_eq!(stats.batches_failed, 0);
        assert_eq!(stats.average_batch_duration, Duration::ZERO);
        assert_eq!(stats.total_processed(), 0);
        assert!((stats.success_rate() - 0.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_pool_stats_calculations() {
        let stats = PoolStats {
            num_workers: 4,
            active_workers: 2,
            batches_completed: 80,
            batches_failed: 20,
            batches_rejected: 3,
            workers_rotated: 1,
            average_batch_duration: Duration::from_secs(60),
        };

        assert_eq!(stats.total_processed(), 100);
        assert!((stats.success_rate() - 80.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_shared_pool_stats() {
        let stats = SharedPoolStats::new();

        stats.record_completion(Duration::from_secs(10));
        stats.record_completion(Duration::from_secs(20));
        stats.record_failure(Duration::from_secs(5));
        stats.record_rejection();
        stats.record_rotation();

        let pool_stats = stats.to_pool_stats(4);

        assert_eq!(pool_stats.num_workers, 4);
        assert_eq!(pool_stats.batches_completed, 2);
        assert_eq!(pool_stats.batches_failed, 1);
        assert_eq!(pool_stats.batches_rejected, 1);
        assert_eq!(pool_stats.workers_rotated, 1);
        // Average: (10000 + 20000 + 5000) / 3 = 11666 ms
        assert!(pool_stats.average_batch_duration.as_millis() > 11000);
        assert!(pool_stats.average_batch_duration.as_millis() < 12000);
    }

    #[test]
    fn test_shared_pool_stats_active_workers() {
        let stats = SharedPoolStats::new();

        stats.increment_active();
        stats.increment_active();
        assert_eq!(stats.active_workers.load(Ordering::SeqCst), 2);

        stats.decrement_active();
        assert_eq!(stats.active_workers.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_pool_error_display() {
        assert!(PoolError::AlreadyRunning.to_string().contains("already running"));
        assert!(PoolError::NotRunning.to_string().contains("not running"));

        let err = PoolError::ShutdownTimeout(Duration::from_secs(60));
        assert!(err.to_string().contains("60"));
    }
}
