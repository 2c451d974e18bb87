//! Artifact persistence.
//!
//! Encrypted artifacts are written to the filesystem, organized by the
//! checksum of the sealed bytes. Provenance goes to the database when one is
//! configured, otherwise to a JSON sidecar next to the artifact.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, warn};
use uuid::Uuid;

use super::database::{Database, DatabaseError};
use crate::batch::{Classification, ContentKind};
use crate::pipeline::sha256_hex;

/// Extension of stored artifact files.
const ARTIFACT_EXTENSION: &str = "dcm.enc";
/// Extension of provenance sidecar files.
const SIDECAR_EXTENSION: &str = "json";
/// Suffix of artifact files still being written.
const PARTIAL_SUFFIX: &str = ".partial";

/// Errors that can occur during artifact storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// IO operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    /// Metadata could not be serialized.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Artifact not found.
    #[error("Artifact not found: {0}")]
    NotFound(Uuid),

    /// Checksum verification failed.
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    /// Storage directory creation failed.
    #[error("Failed to create storage directory: {0}")]
    DirectoryCreationFailed(String),

    /// The operation needs a database and none is configured.
    #[error("Operation requires a database")]
    DatabaseRequired,

    /// The storage backend refused the write.
    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

/// Provenance of one processed artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactMetadata {
    pub artifact_id: Uuid,
    pub batch_id: Uuid,
    pub original_filename: String,
    /// Lowercase extension of the original filename.
    pub extension: Option<String>,
    pub detected_kind: ContentKind,
    /// SHA-256 of the decoded source file.
    pub source_sha256: String,
    /// SHA-256 of the de-identified artifact before encryption.
    pub fingerprint: String,
    /// Whether the source was converted to DICOM.
    pub converted: bool,
    pub anonymized: bool,
    /// Identifiers removed during anonymization, with their prior values.
    pub removed_tags: BTreeMap<String, String>,
    pub classification: Classification,
    pub processed_at: DateTime<Utc>,
}

/// A persisted artifact as listed for its batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchFileRecord {
    pub artifact_id: Uuid,
    pub original_filename: String,
    pub upload_time: DateTime<Utc>,
    pub status: String,
    pub fingerprint: String,
    pub classification_label: Option<String>,
    pub confidence: Option<f64>,
    pub model_version: Option<String>,
}

/// Destination for processed artifacts.
#[async_trait]
pub trait ArtifactSink: Send + Sync {
    /// Stores the encrypted artifact and its provenance, returning its id.
    async fn persist_artifact(
        &self,
        owner: Option<&str>,
        metadata: &ArtifactMetadata,
        encrypted: &[u8],
    ) -> Result<Uuid, StorageError>;
}

/// Filesystem storage for encrypted artifacts.
pub struct ArtifactStorage {
    base_path: PathBuf,
    db: Option<Arc<Database>>,
}

impl ArtifactStorage {
    /// Creates storage that records provenance in the database.
    pub fn new(base_path: impl Into<PathBuf>, db: Arc<Database>) -> Self {
        Self {
            base_path: base_path.into(),
            db: Some(db),
        }
    }

    /// Creates storage that records provenance in JSON sidecar files.
    pub fn filesystem_only(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
            db: None,
        }
    }

    /// Returns the base storage path.
    pub fn base_path(&self) -> &PathBuf {
        &self.base_path
    }

    async fn ensure_directories(&self) -> Result<(), StorageError> {
        if !self.base_path.exists() {
            fs::create_dir_all(&self.base_path).await.map_err(|e| {
                StorageError::DirectoryCreationFailed(format!(
                    "Failed to create base directory {:?}: {}",
                    self.base_path, e
                ))
            })?;
        }

        Ok(())
    }

    /// Returns the file path for sealed bytes with the given checksum.
    ///
    /// Uses the first 2 characters of the checksum as a subdirectory
    /// to avoid having too many files in a single directory.
    fn artifact_path(&self, checksum: &str) -> PathBuf {
        let subdir = &checksum[0..2.min(checksum.len())];
        self.base_path
            .join(subdir)
            .join(format!("{}.{}", checksum, ARTIFACT_EXTENSION))
    }

    /// Reads an artifact back, verifying its checksum.
    pub async fn retrieve(&self, artifact_id: Uuid) -> Result<Vec<u8>, StorageError> {
        let db = self.db.as_ref().ok_or(StorageError::DatabaseRequired)?;
        let relative_path = db
            .artifact_path(artifact_id)
            .await?
            .ok_or(StorageError::NotFound(artifact_id))?;

        let file_path = self.base_path.join(&relative_path);
        let mut file = fs::File::open(&file_path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StorageError::NotFound(artifact_id)
            } else {
                StorageError::Io(e)
            }
        })?;

        let mut data = Vec::new();
        file.read_to_end(&mut data).await?;

        let expected = file_path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| n.strip_suffix(&format!(".{}", ARTIFACT_EXTENSION)))
            .unwrap_or_default()
            .to_string();
        let actual = sha256_hex(&data);
        if actual != expected {
            return Err(StorageError::ChecksumMismatch { expected, actual });
        }

        Ok(data)
    }

    /// Lists the artifacts persisted for a batch, oldest first.
    pub async fn files_for_batch(
        &self,
        batch_id: Uuid,
    ) -> Result<Vec<BatchFileRecord>, StorageError> {
        let db = self.db.as_ref().ok_or(StorageError::DatabaseRequired)?;
        Ok(db.files_for_batch(batch_id).await?)
    }
}

#[async_trait]
impl ArtifactSink for ArtifactStorage {
    async fn persist_artifact(
        &self,
        owner: Option<&str>,
        metadata: &ArtifactMetadata,
        encrypted: &[u8],
    ) -> Result<Uuid, StorageError> {
        self.ensure_directories().await?;

        let checksum = sha256_hex(encrypted);
        let file_path = self.artifact_path(&checksum);

        if let Some(parent) = file_path.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent).await?;
            }
        }

        write_artifact_file(&file_path, encrypted).await?;

        let relative_path = file_path
            .strip_prefix(&self.base_path)
            .unwrap_or(&file_path)
            .to_string_lossy()
            .to_string();

        let recorded = match &self.db {
            Some(db) => db
                .record_artifact(owner, metadata, &relative_path, encrypted.len() as u64)
                .await
                .map_err(StorageError::from),
            None => {
                let sidecar = file_path.with_extension(SIDECAR_EXTENSION);
                match serde_json::to_vec_pretty(&SidecarRecord { owner, metadata }) {
                    Ok(bytes) => fs::write(&sidecar, bytes).await.map_err(StorageError::from),
                    Err(e) => Err(e.into()),
                }
            }
        };

        if let Err(e) = recorded {
            // No provenance, no artifact.
            if let Err(remove_err) = fs::remove_file(&file_path).await {
                warn!(path = ?file_path, error = %remove_err, "Failed to remove orphaned artifact");
            }
            return Err(e);
        }

        debug!(artifact_id = %metadata.artifact_id, path = %relative_path, "Stored artifact");
        Ok(metadata.artifact_id)
    }
}

fn partial_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(PARTIAL_SUFFIX);
    PathBuf::from(name)
}

/// Writes an artifact through a sibling partial file renamed into place.
///
/// On any failure the partial file is removed, so no truncated artifact is
/// left under its final name.
async fn write_artifact_file(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let partial = partial_path(path);

    let written = async {
        let mut file = fs::File::create(&partial).await?;
        file.write_all(bytes).await?;
        file.sync_all().await?;
        fs::rename(&partial, path).await
    }
    .await;

    if written.is_err() {
        match fs::remove_file(&partial).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = ?partial, error = %e, "Failed to remove partial artifact"),
        }
    }
    written
}

#[derive(Serialize)]
struct SidecarRecord<'a> {
    owner: Option<&'a str>,
    #[serde(flatten)]
    metadata: &'a ArtifactMetadata,
}

/// An artifact held by [`MemoryArtifactStore`].
#[derive(Debug, Clone, PartialEq)]
pub struct StoredArtifact {
    pub owner: Option<String>,
    pub metadata: ArtifactMetadata,
    pub encrypted: Vec<u8>,
}

/// Artifact sink held in process memory.
#[derive(Debug, Default)]
pub struct MemoryArtifactStore {
    artifacts: Mutex<HashMap<Uuid, StoredArtifact>>,
    failures_pending: AtomicU32,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `n` writes fail.
    pub fn fail_next_writes(&self, n: u32) {
        self.failures_pending.store(n, Ordering::SeqCst);
    }

    pub fn get(&self, artifact_id: Uuid) -> Option<StoredArtifact> {
        self.lock().get(&artifact_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Returns the artifacts of a batch, oldest first.
    pub fn for_batch(&self, batch_id: Uuid) -> Vec<StoredArtifact> {
        let mut artifacts: Vec<StoredArtifact> = self
            .lock()
            .values()
            .filter(|a| a.metadata.batch_id == batch_id)
            .cloned()
            .collect();
        artifacts.sort_by(|a, b| a.metadata.processed_at.cmp(&b.metadata.processed_at));
        artifacts
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, StoredArtifact>> {
        self.artifacts.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl ArtifactSink for MemoryArtifactStore {
    async fn persist_artifact(
        &self,
        owner: Option<&str>,
        metadata: &ArtifactMetadata,
        encrypted: &[u8],
    ) -> Result<Uuid, StorageError> {
        let should_fail = self
            .failures_pending
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(StorageError::Unavailable("injected write failure".to_string()));
        }

        self.lock().insert(
            metadata.artifact_id,
            StoredArtifact {
                owner: owner.map(str::to_string),
                metadata: metadata.clone(),
                encrypted: encrypted.to_vec(),
            },
        );
        Ok(metadata.artifact_id)
    }
}
