//! Progress store contract and in-memory implementation.
//!
//! The progress store is the only state shared between concurrent batch
//! executions. Each batch record is written only by the orchestrator
//! invocation that claimed it through [`ProgressStore::begin`].

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::batch::{Batch, BatchStatus};
use crate::error::StoreError;

/// Result of trying to claim a batch for processing.
#[derive(Debug, Clone, PartialEq)]
pub enum Claim {
    /// The batch moved from `queued` to `processing`; the caller owns it.
    Claimed(Batch),
    /// Another invocation already claimed the batch, or it already finished.
    AlreadyClaimed(BatchStatus),
}

/// Durable record of batch aggregate state.
#[async_trait]
pub trait ProgressStore: Send + Sync {
    /// Creates a `queued` record. Fails if the id is already taken.
    async fn create(
        &self,
        batch_id: Uuid,
        owner: Option<&str>,
        total_files: u32,
    ) -> Result<Batch, StoreError>;

    /// Atomically moves a `queued` batch to `processing`.
    async fn begin(&self, batch_id: Uuid) -> Result<Claim, StoreError>;

    /// Writes progress and status.
    ///
    /// Rejects a lower `processed` count than stored, a count above the
    /// batch total, and any backward status transition.
    async fn update(
        &self,
        batch_id: Uuid,
        processed: u32,
        total: u32,
        status: BatchStatus,
    ) -> Result<(), StoreError>;

    /// Reads a batch record.
    async fn read(&self, batch_id: Uuid) -> Result<Batch, StoreError>;

    /// Lists an owner's batches, newest first.
    async fn list_by_owner(&self, owner: &str) -> Result<Vec<Batch>, StoreError>;

    /// Marks a non-terminal batch `failed`, keeping its processed count.
    ///
    /// Returns the record as it stands afterwards; terminal batches are
    /// returned untouched.
    async fn mark_failed(&self, batch_id: Uuid) -> Result<Batch, StoreError> {
        let batch = self.read(batch_id).await?;
        if batch.status.is_terminal() {
            return Ok(batch);
        }
        self.update(
            batch_id,
            batch.processed_files,
            batch.total_files,
            BatchStatus::Failed,
        )
        .await?;
        self.read(batch_id).await
    }
}

/// Checks an update against the current record.
pub(crate) fn check_update(
    current: &Batch,
    processed: u32,
    total: u32,
    status: BatchStatus,
) -> Result<(), StoreError> {
    let batch_id = current.batch_id;
    if processed > current.total_files || total != current.total_files {
        return Err(StoreError::ProgressOverflow {
            batch_id,
            processed,
            total: current.total_files,
        });
    }
    if processed < current.processed_files {
        return Err(StoreError::ProgressRegression {
            batch_id,
            current: current.processed_files,
            requested: processed,
        });
    }
    if !current.status.can_transition_to(status) {
        return Err(StoreError::InvalidTransition {
            batch_id,
            from: current.status,
            to: status,
        });
    }
    Ok(())
}

/// Progress store held in process memory.
///
/// Used when no database is configured and by tests.
#[derive(Debug, Default)]
pub struct MemoryProgressStore {
    batches: RwLock<HashMap<Uuid, Batch>>,
}

impl MemoryProgressStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of batch records.
    pub async fn len(&self) -> usize {
        self.batches.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.batches.read().await.is_empty()
    }
}

#[async_trait]
impl ProgressStore for MemoryProgressStore {
    async fn create(
        &self,
        batch_id: Uuid,
        owner: Option<&str>,
        total_files: u32,
    ) -> Result<Batch, StoreError> {
        let mut batches = self.batches.write().await;
        if batches.contains_key(&batch_id) {
            return Err(StoreError::AlreadyExists(batch_id));
        }
        let batch = Batch::queued(batch_id, owner.map(str::to_string), total_files);
        batches.insert(batch_id, batch.clone());
        Ok(batch)
    }

    async fn begin(&self, batch_id: Uuid) -> Result<Claim, StoreError> {
        let mut batches = self.batches.write().await;
        let batch = batches
            .get_mut(&batch_id)
            .ok_or(StoreError::NotFound(batch_id))?;

        if batch.status != BatchStatus::Queued {
            return Ok(Claim::AlreadyClaimed(batch.status));
        }

        batch.status = BatchStatus::Processing;
        batch.updated_at = Some(Utc::now());
        Ok(Claim::Claimed(batch.clone()))
    }

    async fn update(
        &self,
        batch_id: Uuid,
        processed: u32,
        total: u32,
        status: BatchStatus,
    ) -> Result<(), StoreError> {
        let mut batches = self.batches.write().await;
        let batch = batches
            .get_mut(&batch_id)
            .ok_or(StoreError::NotFound(batch_id))?;

        check_update(batch, processed, total, status)?;

        batch.processed_files = processed;
        batch.status = status;
        batch.updated_at = Some(Utc::now());
        Ok(())
    }

    async fn read(&self, batch_id: Uuid) -> Result<Batch, StoreError> {
        self.batches
            .read()
            .await
            .get(&batch_id)
            .cloned()
            .ok_or(StoreError::NotFound(batch_id))
    }

    async fn list_by_owner(&self, owner: &str) -> Result<Vec<Batch>, StoreError> {
        let mut batches: Vec<Batch> = self
            .batches
            .read()
            .await
            .values()
            .filter(|b| b.owner.as_deref() == Some(owner))
            .cloned()
            .collect();
        batches.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(batches)
    }
}
