//! PostgreSQL database client for persistent storage.
//!
//! Holds batch bookkeeping (`upload_batches`) and artifact provenance
//! (`uploads`, `dicom_metadata`, `ml_results`, `user_uploads`, `audit_log`).
//! [`Database`] implements [`ProgressStore`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPoolOptions, postgres::PgRow, PgPool, Row};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::batch::{Batch, BatchStatus};
use crate::error::StoreError;

use super::artifacts::{ArtifactMetadata, BatchFileRecord};
use super::migrations::MigrationRunner;
use super::progress::{check_update, Claim, ProgressStore};

/// Source recorded for artifacts created by batch processing.
pub const BATCH_UPLOAD_SOURCE: &str = "batch_upload";
/// Audit action recorded for each persisted artifact.
pub const AUDIT_ACTION_BATCH_PROCESSED: &str = "batch_processed";

const BATCH_COLUMNS: &str =
    "batch_id, user_id, total_files, processed_files, status, created_at, updated_at";

/// Errors that can occur during database operations.
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Connection to the database failed.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Query execution failed.
    #[error("Query failed: {0}")]
    QueryFailed(#[from] sqlx::Error),

    /// Record not found.
    #[error("Record not found: {0}")]
    NotFound(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Migration error.
    #[error("Migration error: {0}")]
    Migration(#[from] super::migrations::MigrationError),

    /// A stored value could not be interpreted.
    #[error("Corrupt row: {0}")]
    CorruptRow(String),
}

/// PostgreSQL database client.
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Connects to the database and returns a new client.
    pub async fn connect(database_url: &str) -> Result<Self, DatabaseError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .min_connections(1)
            .acquire_timeout(std::time::Duration::from_secs(30))
            .connect(database_url)
            .await
            .map_err(|e| DatabaseError::ConnectionFailed(e.to_string()))?;

        Ok(Self { pool })
    }

    /// Creates a new database client from an existing pool.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Returns a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs database migrations and returns how many were applied.
    pub async fn run_migrations(&self) -> Result<usize, DatabaseError> {
        let runner = MigrationRunner::new(self.pool.clone());
        Ok(runner.run_migrations().await?)
    }

    // =========================================================================
    // Batch Operations
    // =========================================================================

    async fn fetch_batch(&self, batch_id: Uuid) -> Result<Option<Batch>, DatabaseError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM upload_batches WHERE batch_id = $1",
            BATCH_COLUMNS
        ))
        .bind(batch_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(batch_from_row).transpose()
    }

    // =========================================================================
    // Provenance Operations
    // =========================================================================

    /// Records provenance for one persisted artifact.
    ///
    /// This operation is transactional - either every row is written or none.
    pub async fn record_artifact(
        &self,
        owner: Option<&str>,
        metadata: &ArtifactMetadata,
        storage_path: &str,
        size_bytes: u64,
    ) -> Result<(), DatabaseError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO uploads (
                id, original_filename, file_extension, upload_time, source,
                storage_path, file_hash, fingerprint, size_bytes, encrypted, status, batch_id
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, TRUE, 'processed', $10)
            "#,
        )
        .bind(metadata.artifact_id)
        .bind(&metadata.original_filename)
        .bind(&metadata.extension)
        .bind(metadata.processed_at)
        .bind(BATCH_UPLOAD_SOURCE)
        .bind(storage_path)
        .bind(&metadata.source_sha256)
        .bind(&metadata.fingerprint)
        .bind(size_bytes as i64)
        .bind(metadata.batch_id)
        .execute(&mut *tx)
        .await?;

        let removed_tags = serde_json::to_value(&metadata.removed_tags)?;
        sqlx::query(
            r#"
            INSERT INTO dicom_metadata (upload_id, detected_kind, converted, anonymized, removed_tags)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(metadata.artifact_id)
        .bind(metadata.detected_kind.as_str())
        .bind(metadata.converted)
        .bind(metadata.anonymized)
        .bind(&removed_tags)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO ml_results (upload_id, model_version, prediction, confidence)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(metadata.artifact_id)
        .bind(&metadata.classification.model_version)
        .bind(&metadata.classification.label)
        .bind(metadata.classification.confidence)
        .execute(&mut *tx)
        .await?;

        if let Some(owner) = owner {
            sqlx::query(
                r#"
                INSERT INTO user_uploads (user_id, upload_id)
                VALUES ($1, $2)
                ON CONFLICT (user_id, upload_id) DO NOTHING
                "#,
            )
            .bind(owner)
            .bind(metadata.artifact_id)
            .execute(&mut *tx)
            .await?;
        }

        let details = serde_json::json!({
            "batch_id": metadata.batch_id,
            "file_type": metadata.detected_kind.as_str(),
        });
        sqlx::query(
            r#"
            INSERT INTO audit_log (user_id, action, resource_type, resource_id, success, details)
            VALUES ($1, $2, 'upload', $3, TRUE, $4)
            "#,
        )
        .bind(owner)
        .bind(AUDIT_ACTION_BATCH_PROCESSED)
        .bind(metadata.artifact_id)
        .bind(&details)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        debug!(artifact_id = %metadata.artifact_id, batch_id = %metadata.batch_id, "Recorded artifact provenance");
        Ok(())
    }

    /// Returns the storage path of an artifact.
    pub async fn artifact_path(&self, artifact_id: Uuid) -> Result<Option<String>, DatabaseError> {
        let row = sqlx::query("SELECT storage_path FROM uploads WHERE id = $1")
            .bind(artifact_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|r| r.get("storage_path")))
    }

    /// Lists the artifacts of a batch with their classification, oldest first.
    pub async fn files_for_batch(
        &self,
        batch_id: Uuid,
    ) -> Result<Vec<BatchFileRecord>, DatabaseError> {
        let rows = sqlx::query(
            r#"
            SELECT u.id, u.original_filename, u.upload_time, u.status, u.fingerprint,
                   m.prediction, m.confidence, m.model_version
            FROM uploads u
            LEFT JOIN ml_results m ON m.upload_id = u.id
            WHERE u.batch_id = $1
            ORDER BY u.upload_time
            "#,
        )
        .bind(batch_id)
        .fetch_all(&self.pool)
        .await?;

        let mut files = Vec::with_capacity(rows.len());
        for row in rows {
            files.push(BatchFileRecord {
                artifact_id: row.get("id"),
                original_filename: row.get("original_filename"),
                upload_time: row.get("upload_time"),
                status: row.get("status"),
                fingerprint: row.get("fingerprint"),
                classification_label: row.get("prediction"),
                confidence: row.get("confidence"),
                model_version: row.get("model_version"),
            });
        }

        Ok(files)
    }
}

fn batch_from_row(row: &PgRow) -> Result<Batch, DatabaseError> {
    let status: String = row.get("status");
    let status = status
        .parse::<BatchStatus>()
        .map_err(DatabaseError::CorruptRow)?;
    let total: i32 = row.get("total_files");
    let processed: i32 = row.get("processed_files");
    let created_at: DateTime<Utc> = row.get("created_at");

    Ok(Batch {
        batch_id: row.get("batch_id"),
        owner: row.get("user_id"),
        total_files: u32::try_from(total)
            .map_err(|_| DatabaseError::CorruptRow(format!("total_files = {}", total)))?,
        processed_files: u32::try_from(processed)
            .map_err(|_| DatabaseError::CorruptRow(format!("processed_files = {}", processed)))?,
        status,
        created_at,
        updated_at: row.get("updated_at"),
    })
}

/// Statuses from which a transition to `next` is allowed.
fn allowed_from(next: BatchStatus) -> Vec<String> {
    [
        BatchStatus::Queued,
        BatchStatus::Processing,
        BatchStatus::Completed,
        BatchStatus::CompletedWithErrors,
        BatchStatus::Failed,
    ]
    .into_iter()
    .filter(|s| s.can_transition_to(next))
    .map(|s| s.as_str().to_string())
    .collect()
}

#[async_trait]
impl ProgressStore for Database {
    async fn create(
        &self,
        batch_id: Uuid,
        owner: Option<&str>,
        total_files: u32,
    ) -> Result<Batch, StoreError> {
        let batch = Batch::queued(batch_id, owner.map(str::to_string), total_files);

        let result = sqlx::query(
            r#"
            INSERT INTO upload_batches (batch_id, user_id, total_files, processed_files, status, created_at)
            VALUES ($1, $2, $3, 0, $4, $5)
            ON CONFLICT (batch_id) DO NOTHING
            "#,
        )
        .bind(batch.batch_id)
        .bind(&batch.owner)
        .bind(total_files as i32)
        .bind(batch.status.as_str())
        .bind(batch.created_at)
        .execute(&self.pool)
        .await
        .map_err(DatabaseError::from)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::AlreadyExists(batch_id));
        }
        Ok(batch)
    }

    async fn begin(&self, batch_id: Uuid) -> Result<Claim, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE upload_batches
            SET status = 'processing', updated_at = NOW()
            WHERE batch_id = $1 AND status = 'queued'
            RETURNING {}
            "#,
            BATCH_COLUMNS
        ))
        .bind(batch_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from)?;

        if let Some(row) = row {
            return Ok(Claim::Claimed(batch_from_row(&row)?));
        }

        match self.fetch_batch(batch_id).await? {
            Some(batch) => Ok(Claim::AlreadyClaimed(batch.status)),
            None => Err(StoreError::NotFound(batch_id)),
        }
    }

    async fn update(
        &self,
        batch_id: Uuid,
        processed: u32,
        total: u32,
        status: BatchStatus,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE upload_batches
            SET processed_files = $2, status = $3, updated_at = NOW()
            WHERE batch_id = $1
              AND total_files = $4
              AND processed_files <= $2
              AND total_files >= $2
              AND status = ANY($5)
            "#,
        )
        .bind(batch_id)
        .bind(processed as i32)
        .bind(status.as_str())
        .bind(total as i32)
        .bind(allowed_from(status))
        .execute(&self.pool)
        .await
        .map_err(DatabaseError::from)?;

        if result.rows_affected() == 1 {
            return Ok(());
        }

        // Nothing matched: report why.
        let current = self
            .fetch_batch(batch_id)
            .await?
            .ok_or(StoreError::NotFound(batch_id))?;
        check_update(&current, processed, total, status)?;
        Err(StoreError::Unavailable(format!(
            "batch {} changed concurrently",
            batch_id
        )))
    }

    async fn read(&self, batch_id: Uuid) -> Result<Batch, StoreError> {
        self.fetch_batch(batch_id)
            .await?
            .ok_or(StoreError::NotFound(batch_id))
    }

    async fn list_by_owner(&self, owner: &str) -> Result<Vec<Batch>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM upload_batches WHERE user_id = $1 ORDER BY created_at DESC",
            BATCH_COLUMNS
        ))
        .bind(owner)
        .fetch_all(&self.pool)
        .await
        .map_err(DatabaseError::from)?;

        let mut batches = Vec::with_capacity(rows.len());
        for row in &rows {
            batches.push(batch_from_row(row)?);
        }
        Ok(batches)
    }
}
