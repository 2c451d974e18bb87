//! Execution backends for batches.
//!
//! - **DistributedExecutor**: pushes a [`BatchJob`] onto a Redis queue
//! - **WorkerPool**: pool of workers that pull batch jobs and run them
//! - **FallbackWorker / InlineExecutor**: single in-process worker used when
//!   the broker cannot accept a batch
//!
//! # Architecture
//!
//! ```text
//!                      ┌──────────────┐
//!                      │  Submitter   │
//!                      └──────┬───────┘
//!                  ok         │        dispatch error
//!            ┌────────────────┴────────────────┐
//!     ┌──────▼───────┐                  ┌──────▼───────┐
//!     │    Redis     │                  │  In-process  │
//!     │    Queue     │                  │     FIFO     │
//!     └──────┬───────┘                  └──────┬───────┘
//!            │                                 │
//!     ┌──────▼───────┐                  ┌──────▼───────┐
//!     │ Worker 1..N  │                  │   Fallback   │
//!     └──────┬───────┘                  │    worker    │
//!            │                          └──────┬───────┘
//!            └───────────► Orchestrator ◄──────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use medbatch::scheduler::{DistributedExecutor, JobQueue, WorkerPool, WorkerPoolConfig};
//! use std::sync::Arc;
//!
//! let queue = Arc::new(JobQueue::connect("redis://localhost:6379/0", "dicom_batches").await?);
//! let executor = DistributedExecutor::new(Arc::clone(&queue));
//!
//! let mut pool = WorkerPool::with_queue(WorkerPoolConfig::new(4), queue, orchestrator);
//! pool.start().await?;
//!
//! // Graceful shutdown
//! pool.shutdown().await?;
//! ```
//!
//! # Reliability Features
//!
//! - **Atomic dequeue**: BRPOPLPUSH moves a job to the processing queue
//! - **Ack late**: a job stays in the processing queue until its batch ends
//! - **No redelivery**: jobs abandoned by a dead pool are dead-lettered and
//!   their batches marked failed, because re-running a batch is not idempotent
//! - **Graceful shutdown**: workers finish current batches before stopping

pub mod executor;
pub mod fallback;
pub mod job;
pub mod queue;
pub mod worker_pool;

// Re-export main types for convenience
pub use executor::{Backend, BatchExecutor, DistributedExecutor, InlineExecutor, TaskHandle};
pub use fallback::{FallbackConfig, FallbackStats, FallbackWorker};
pub use job::{BatchJob, FileFailure, JobResult, JobStatus, OutcomeSummary};
pub use queue::{CleanupReport, JobQueue, QueueError, QueueStats};
pub use worker_pool::{PoolError, PoolStats, Worker, WorkerPool, WorkerPoolConfig};
