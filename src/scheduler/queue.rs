//! Redis-based batch queue with reliable dequeue.
//!
//! This is the transport of the distributed backend. It supports:
//!
//! - Atomic dequeue using BRPOPLPUSH into the consumer's own processing list
//! - Late acknowledgement: a job leaves the processing list only once its
//!   batch has reached a terminal state
//! - Consumer heartbeats, so only the lists of dead consumers are recovered
//! - Dead letter queue for jobs that could not be finished
//! - Job results retained with an expiry
//!
//! A consumer is one worker pool process. Several consumers may share a
//! queue; each one keeps its in-flight jobs in a separate list.
//!
//! # Queue Structure
//!
//! - `{queue_name}`: Main queue where batch jobs are enqueued
//! - `{queue_name}:consumers`: Set of consumers that may own in-flight jobs
//! - `{queue_name}:processing:{consumer}`: Jobs a consumer is running
//! - `{queue_name}:heartbeat:{consumer}`: Liveness key, expires when the consumer dies
//! - `{queue_name}:dead_letter`: Jobs that could not be finished
//! - `{queue_name}:results:{job_id}`: Job results, expiring after the result TTL

use std::time::Duration;

use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::job::{BatchJob, JobResult};
use crate::metrics::MetricsCollector;

/// Errors that can occur during queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Failed to connect to Redis.
    #[error("Redis connection failed: {0}")]
    ConnectionFailed(String),

    /// Redis operation failed.
    #[error("Redis operation failed: {0}")]
    RedisError(#[from] redis::RedisError),

    /// Failed to serialize job data.
    #[error("Serialization failed: {0}")]
    SerializationFailed(#[from] serde_json::Error),
}

/// Redis-based queue of batch jobs.
pub struct JobQueue {
    /// Redis connection manager (handles reconnection automatically).
    redis: ConnectionManager,
    queue_name: String,
    consumers_key: String,
    dead_letter_queue: String,
    /// Prefix of job result keys.
    results_key: String,
}

impl JobQueue {
    /// Connects to Redis and creates a new job queue.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::ConnectionFailed` if the broker is unreachable.
    pub async fn connect(redis_url: &str, queue_name: &str) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;

        let redis = ConnectionManager::new(client)
            .await
            .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;

        Ok(Self::from_connection(redis, queue_name))
    }

    /// Creates a JobQueue from an existing ConnectionManager.
    pub fn from_connection(redis: ConnectionManager, queue_name: &str) -> Self {
        Self {
            redis,
            queue_name: queue_name.to_string(),
            consumers_key: consumers_key(queue_name),
            dead_letter_queue: format!("{}:dead_letter", queue_name),
            results_key: format!("{}:results", queue_name),
        }
    }

    /// Checks that the broker answers.
    pub async fn ping(&self) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();
        redis::cmd("PING").query_async::<_, String>(&mut conn).await?;
        Ok(())
    }

    /// Enqueues a batch job.
    ///
    /// Jobs are added to the left of the queue (LPUSH) so they can be
    /// dequeued from the right in FIFO order.
    pub async fn enqueue(&self, job: &BatchJob) -> Result<(), QueueError> {
        let serialized = serde_json::to_string(job)?;
        let mut conn = self.redis.clone();
        conn.lpush::<_, _, ()>(&self.queue_name, serialized).await?;
        debug!(job_id = %job.id, batch_id = %job.batch_id, queue = %self.queue_name, "Enqueued batch job");
        Ok(())
    }

    /// Registers `consumer` and refreshes its liveness key for `ttl`.
    ///
    /// A consumer must beat before its first dequeue and keep beating more
    /// often than `ttl` while it holds jobs.
    pub async fn heartbeat(&self, consumer: &str, ttl: Duration) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();
        conn.sadd::<_, _, ()>(&self.consumers_key, consumer).await?;
        redis::cmd("SET")
            .arg(heartbeat_key(&self.queue_name, consumer))
            .arg(chrono::Utc::now().to_rfc3339())
            .arg("EX")
            .arg(ttl_secs(ttl))
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    /// Unregisters a consumer that shut down cleanly.
    ///
    /// A consumer that still holds jobs keeps its registration, and its jobs
    /// are recovered once the heartbeat expires. Returns whether the
    /// consumer was removed.
    pub async fn retire(&self, consumer: &str) -> Result<bool, QueueError> {
        let mut conn = self.redis.clone();
        let in_flight: usize = conn.llen(processing_key(&self.queue_name, consumer)).await?;
        if in_flight > 0 {
            return Ok(false);
        }
        conn.del::<_, ()>(heartbeat_key(&self.queue_name, consumer))
            .await?;
        conn.srem::<_, _, ()>(&self.consumers_key, consumer).await?;
        Ok(true)
    }

    /// Dequeues the next job for `consumer`, blocking until one is available or timeout.
    ///
    /// Uses BRPOPLPUSH to atomically move the job from the main queue to
    /// the consumer's processing list. A payload that cannot be parsed is
    /// moved to the dead letter queue and `Ok(None)` is returned.
    pub async fn dequeue(
        &self,
        consumer: &str,
        timeout: Duration,
    ) -> Result<Option<BatchJob>, QueueError> {
        let mut conn = self.redis.clone();
        let timeout_secs = timeout.as_secs().max(1) as usize;
        let processing = processing_key(&self.queue_name, consumer);

        let result: Option<String> = redis::cmd("BRPOPLPUSH")
            .arg(&self.queue_name)
            .arg(&processing)
            .arg(timeout_secs)
            .query_async(&mut conn)
            .await?;

        let Some(data) = result else {
            return Ok(None);
        };

        match serde_json::from_str::<BatchJob>(&data) {
            Ok(job) => Ok(Some(job)),
            Err(e) => {
                warn!(error = %e, "Discarding unparseable job payload to dead letter queue");
                self.dead_letter_raw(&processing, &data, &format!("Unparseable payload: {}", e))
                    .await?;
                Ok(None)
            }
        }
    }

    /// Acknowledges a finished job: stores its result and removes it from
    /// the consumer's processing list.
    pub async fn complete(
        &self,
        consumer: &str,
        job: &BatchJob,
        result: &JobResult,
        result_ttl: Duration,
    ) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();

        let result_key = self.result_key(job.id);
        let result_data = serde_json::to_string(result)?;
        redis::cmd("SET")
            .arg(&result_key)
            .arg(&result_data)
            .arg("EX")
            .arg(ttl_secs(result_ttl))
            .query_async::<_, ()>(&mut conn)
            .await?;

        self.remove_job_from_processing(consumer, job.id).await?;
        Ok(())
    }

    /// Moves a job from the consumer's processing list to the dead letter queue.
    pub async fn dead_letter(
        &self,
        consumer: &str,
        job: &BatchJob,
        error: &str,
    ) -> Result<(), QueueError> {
        self.remove_job_from_processing(consumer, job.id).await?;
        self.push_dead_letter(job, error).await
    }

    async fn dead_letter_raw(
        &self,
        processing: &str,
        payload: &str,
        error: &str,
    ) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();
        conn.lrem::<_, _, ()>(processing, 1, payload).await?;
        self.push_dead_letter(payload, error).await
    }

    async fn push_dead_letter<T: Serialize + ?Sized>(
        &self,
        job: &T,
        error: &str,
    ) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();
        let entry = serde_json::json!({
            "job": job,
            "error": error,
            "moved_at": chrono::Utc::now().to_rfc3339(),
        });
        conn.lpush::<_, _, ()>(&self.dead_letter_queue, serde_json::to_string(&entry)?)
            .await?;
        Ok(())
    }

/// Returns the number of jobs in the main queue.
    pub async fn len(&self) -> Result<usize, QueueError> {
        let mut conn = self.redis.clone();
        let len: usize = conn.llen(&self.queue_name).await?;
        Ok(len)
    }

    /// Returns the number of jobs currently being processed, across consumers.
    pub async fn processing_len(&self) -> Result<usize, QueueError> {
        let mut conn = self.redis.clone();
        let consumers: Vec<String> = conn.smembers(&self.consumers_key).await?;

        let mut total = 0;
        for consumer in consumers {
            let len: usize = conn.llen(processing_key(&self.queue_name, &consumer)).await?;
            total += len;
        }
        Ok(total)
    }

    /// Returns the number of jobs in the dead letter queue.
    pub async fn dead_letter_len(&self) -> Result<usize, QueueError> {
        let mut conn = self.redis.clone();
        let len: usize = conn.llen(&self.dead_letter_queue).await?;
        Ok(len)
    }

    pub async fn is_empty(&self) -> Result<bool, QueueError> {
        Ok(self.len().await? == 0)
    }

    /// Retrieves a job result by job ID, if it has not expired.
    pub async fn get_result(&self, job_id: Uuid) -> Result<Option<JobResult>, QueueError> {
        let mut conn = self.redis.clone();
        let data: Option<String> = conn.get(self.result_key(job_id)).await?;

        match data {
            Some(s) => Ok(Some(serde_json::from_str(&s)?)),
            None => Ok(None),
        }
    }

    /// Moves jobs held by dead consumers to the dead letter queue.
    ///
    /// A consumer is dead once its heartbeat key has expired; consumers with
    /// a live heartbeat are left alone, so a starting pool never touches
    /// batches another process is still running. Jobs are not re-run because
    /// re-running a batch is not idempotent. Returns the jobs that were moved
    /// so their batches can be marked failed.
    pub async fn recover_abandoned_jobs(&self) -> Result<Vec<BatchJob>, QueueError> {
        let mut conn = self.redis.clone();
        let consumers: Vec<String> = conn.smembers(&self.consumers_key).await?;

        let mut recovered = Vec::new();
        for consumer in consumers {
            let alive: bool = conn.exists(heartbeat_key(&self.queue_name, &consumer)).await?;
            if alive {
                continue;
            }

            let processing = processing_key(&self.queue_name, &consumer);
            let entries: Vec<String> = conn.lrange(&processing, 0, -1).await?;
            for data in entries {
                // Another recovering pool may have taken the entry already.
                let removed: usize = conn.lrem(&processing, 1, &data).await?;
                if removed == 0 {
                    continue;
                }
                match serde_json::from_str::<BatchJob>(&data) {
                    Ok(job) => {
                        self.push_dead_letter(&job, "Abandoned by a dead consumer")
                            .await?;
                        recovered.push(job);
                    }
                    Err(e) => {
                        self.push_dead_letter(data.as_str(), &format!("Unparseable payload: {}", e))
                            .await?;
                    }
                }
            }

            conn.srem::<_, _, ()>(&self.consumers_key, &consumer).await?;
            info!(consumer = %consumer, "Recovered processing list of dead consumer");
        }

        Ok(recovered)
    }

    /// Applies `result_ttl` to result keys that have no expiry.
    pub async fn cleanup_results(&self, result_ttl: Duration) -> Result<CleanupReport, QueueError> {
        let mut conn = self.redis.clone();
        let keys: Vec<String> = redis::cmd("KEYS")
            .arg(format!("{}:*", self.results_key))
            .query_async(&mut conn)
            .await?;

        let mut report = CleanupReport {
            result_keys: keys.len(),
            expiry_applied: 0,
        };

        for key in keys {
            let ttl: i64 = redis::cmd("TTL").arg(&key).query_async(&mut conn).await?;
            // -1: key exists without expiry; -2: key vanished meanwhile.
            if ttl == -1 {
                redis::cmd("EXPIRE")
                    .arg(&key)
                    .arg(ttl_secs(result_ttl))
                    .query_async::<_, ()>(&mut conn)
                    .await?;
                report.expiry_applied += 1;
            }
        }

        Ok(report)
    }

    /// Returns queue statistics and refreshes the queue depth gauge.
    pub async fn stats(&self) -> Result<QueueStats, QueueError> {
        let (queue_len, processing_len, dead_letter_len) =
            tokio::try_join!(self.len(), self.processing_len(), self.dead_letter_len())?;

        MetricsCollector::new().update_queue_depth(&self.queue_name, queue_len);

        Ok(QueueStats {
            queue_name: self.queue_name.clone(),
            pending_jobs: queue_len,
            processing_jobs: processing_len,
            dead_letter_jobs: dead_letter_len,
        })
    }

    /// Peeks at entries in the dead letter queue without removing them.
    pub async fn peek_dead_letter(
        &self,
        limit: usize,
    ) -> Result<Vec<serde_json::Value>, QueueError> {
        let mut conn = self.redis.clone();
        let data: Vec<String> = conn
            .lrange(&self.dead_letter_queue, 0, limit as isize - 1)
            .await?;

        let entries: Result<Vec<serde_json::Value>, _> =
            data.iter().map(|s| serde_json::from_str(s)).collect();

        Ok(entries?)
    }

    /// Removes a job from a consumer's processing list by ID.
    async fn remove_job_from_processing(
        &self,
        consumer: &str,
        job_id: Uuid,
    ) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();
        let processing = processing_key(&self.queue_name, consumer);
        let jobs: Vec<String> = conn.lrange(&processing, 0, -1).await?;

        for job_data in jobs {
            if let Ok(job) = serde_json::from_str::<BatchJob>(&job_data) {
                if job.id == job_id {
                    conn.lrem::<_, _, ()>(&processing, 1, &job_data).await?;
                    return Ok(());
                }
            }
        }

        // Already removed is not an error.
        Ok(())
    }

    fn result_key(&self, job_id: Uuid) -> String {
        format!("{}:{}", self.results_key, job_id)
    }

    /// Returns the queue name.
    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }
}

fn consumers_key(queue_name: &str) -> String {
    format!("{}:consumers", queue_name)
}

fn processing_key(queue_name: &str, consumer: &str) -> String {
    format!("{}:processing:{}", queue_name, consumer)
}

fn heartbeat_key(queue_name: &str, consumer: &str) -> String {
    format!("{}:heartbeat:{}", queue_name, consumer)
}

fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

/// Statistics about queue state.
#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub queue_name: String,
    /// Number of jobs waiting to be processed.
    pub pending_jobs: usize,
    /// Number of jobs currently being processed.
    pub processing_jobs: usize,
    /// Number of jobs in the dead letter queue.
    pub dead_letter_jobs: usize,
}

impl QueueStats {
    /// Returns the total number of jobs in all queues.
    pub fn total_jobs(&self) -> usize {
        self.pending_jobs + self.processing_jobs + self.dead_letter_jobs
    }
}

/// What a result cleanup pass did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    /// Result keys found.
    pub result_keys: usize,
    /// Keys that had no expiry and received one.
    pub expiry_applied: usize,
}
