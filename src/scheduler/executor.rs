//! Execution backends.
//!
//! A [`BatchExecutor`] accepts a whole batch and arranges for the batch
//! orchestrator to run it exactly once. The two implementations differ only
//! in where that happens:
//!
//! - [`DistributedExecutor`]: pushes the job onto the Redis queue for a
//!   remote [`WorkerPool`](super::WorkerPool)
//! - [`InlineExecutor`]: hands the job to an in-process [`FallbackWorker`]

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use super::fallback::FallbackWorker;
use super::job::BatchJob;
use super::queue::JobQueue;
use crate::error::DispatchError;

/// Which backend a batch was handed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    Distributed,
    Inline,
}

impl Backend {
    /// Label used in logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            Backend::Distributed => "distributed",
            Backend::Inline => "inline",
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Receipt for an accepted batch job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskHandle {
    pub job_id: Uuid,
    pub batch_id: Uuid,
    pub backend: Backend,
}

impl TaskHandle {
    fn for_job(job: &BatchJob, backend: Backend) -> Self {
        Self {
            job_id: job.id,
            batch_id: job.batch_id,
            backend,
        }
    }
}

/// Accepts batches for execution.
#[async_trait]
pub trait BatchExecutor: Send + Sync {
    /// The backend this executor dispatches to.
    fn backend(&self) -> Backend;

    /// Accepts a batch job.
    ///
    /// An `Err` means the job was not accepted and the batch will not run
    /// through this executor.
    async fn submit(&self, job: BatchJob) -> Result<TaskHandle, DispatchError>;
}

/// Dispatches batches to the Redis-backed worker pool.
pub struct DistributedExecutor {
    queue: Arc<JobQueue>,
}

impl DistributedExecutor {
    pub fn new(queue: Arc<JobQueue>) -> Self {
        Self { queue }
    }

    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.queue
    }
}

#[async_trait]
impl BatchExecutor for DistributedExecutor {
    fn backend(&self) -> Backend {
        Backend::Distributed
    }

    async fn submit(&self, job: BatchJob) -> Result<TaskHandle, DispatchError> {
        self.queue.enqueue(&job).await?;
        info!(
            job_id = %job.id,
            batch_id = %job.batch_id,
            queue = %self.queue.queue_name(),
            "Batch dispatched to broker"
        );
        Ok(TaskHandle::for_job(&job, Backend::Distributed))
    }
}

/// Runs batches on the in-process fallback worker.
pub struct InlineExecutor {
    worker: Arc<FallbackWorker>,
}

impl InlineExecutor {
    pub fn new(worker: Arc<FallbackWorker>) -> Self {
        Self { worker }
    }

    pub fn worker(&self) -> &Arc<FallbackWorker> {
        &self.worker
    }
}

#[async_trait]
impl BatchExecutor for InlineExecutor {
    fn backend(&self) -> Backend {
        Backend::Inline
    }

    async fn submit(&self, job: BatchJob) -> Result<TaskHandle, DispatchError> {
        let handle = TaskHandle::for_job(&job, Backend::Inline);
        let pending = self.worker.enqueue(job)?;
        info!(
            job_id = %handle.job_id,
            batch_id = %handle.batch_id,
            pending = pending,
            "Batch queued on in-process worker"
        );
        Ok(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_labels() {
        assert_eq!(Backend::Distributed.to_string(), "distributed");
        assert_eq!(Backend::Inline.as_str(), "inline");
        let json = serde_json::to_string(&Backend::Inline).expect("serialize");
        assert_eq!(json, "\"inline\"");
    }

    #[test]
    fn test_task_handle_for_job() {
        let job = BatchJob::new(Uuid::new_v4(), None, Vec::new());
        let handle = TaskHandle::for_job(&job, Backend::Distributed);
        assert_eq!(handle.job_id, job.id);
        assert_eq!(handle.batch_id, job.batch_id);
        assert_eq!(handle.backend, Backend::Distributed);
    }
}
