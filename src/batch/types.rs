//! Core batch domain types.
//!
//! - `Batch`: the durable aggregate record of a submitted group of files
//! - `BatchStatus`: the forward-only batch state machine
//! - `FileTask`: one submitted file, alive only inside an orchestrator run
//! - `FileResult`: per-file outcome produced by the file pipeline
//! - `BatchOutcome`: what an orchestrator invocation returns

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Status of a batch.
///
/// Transitions only move forward:
/// `queued -> processing -> {completed, completed_with_errors, failed}`.
/// A queued batch may also go straight to `failed` when it can never start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    /// Created at submission time, not yet picked up.
    Queued,
    /// An orchestrator has claimed the batch and is working through its files.
    Processing,
    /// Every file succeeded.
    Completed,
    /// At least one file failed; the batch itself ran to the end.
    CompletedWithErrors,
    /// The batch could not run to the end.
    Failed,
}

impl BatchStatus {
    /// Returns whether no further transition can occur from this status.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BatchStatus::Completed | BatchStatus::CompletedWithErrors | BatchStatus::Failed
        )
    }

    /// Returns whether moving from `self` to `next` is a legal transition.
    ///
    /// Re-asserting `processing` while processing is allowed so intermediate
    /// progress writes can repeat the status.
    pub fn can_transition_to(&self, next: BatchStatus) -> bool {
        match (self, next) {
            (BatchStatus::Queued, BatchStatus::Processing) => true,
            (BatchStatus::Queued, BatchStatus::Failed) => true,
            (BatchStatus::Processing, BatchStatus::Processing) => true,
            (BatchStatus::Processing, s) => s.is_terminal(),
            _ => false,
        }
    }

    /// Returns the storage representation of this status.
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Queued => "queued",
            BatchStatus::Processing => "processing",
            BatchStatus::Completed => "completed",
            BatchStatus::CompletedWithErrors => "completed_with_errors",
            BatchStatus::Failed => "failed",
        }
    }

    /// Computes the terminal status for a batch that ran through all its files.
    ///
    /// A batch where every file failed is still `completed_with_errors`;
    /// only batch-level errors produce `failed`.
    pub fn terminal_for(failed_files: usize) -> BatchStatus {
        if failed_files == 0 {
            BatchStatus::Completed
        } else {
            BatchStatus::CompletedWithErrors
        }
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BatchStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(BatchStatus::Queued),
            "processing" => Ok(BatchStatus::Processing),
            "completed" => Ok(BatchStatus::Completed),
            "completed_with_errors" => Ok(BatchStatus::CompletedWithErrors),
            "failed" => Ok(BatchStatus::Failed),
            other => Err(format!("unknown batch status '{}'", other)),
        }
    }
}

/// Durable aggregate record of one batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    /// Unique batch identifier.
    pub batch_id: Uuid,
    /// Optional caller identity.
    pub owner: Option<String>,
    /// Number of files submitted; fixed at creation.
    pub total_files: u32,
    /// Number of files processed successfully so far.
    pub processed_files: u32,
    /// Current status.
    pub status: BatchStatus,
    /// When the batch was created.
    pub created_at: DateTime<Utc>,
    /// When the record was last written.
    pub updated_at: Option<DateTime<Utc>>,
}

impl Batch {
    /// Creates a freshly queued batch record.
    pub fn queued(batch_id: Uuid, owner: Option<String>, total_files: u32) -> Self {
        Self {
            batch_id,
            owner,
            total_files,
            processed_files: 0,
            status: BatchStatus::Queued,
            created_at: Utc::now(),
            updated_at: None,
        }
    }

    /// Returns progress as a percentage rounded to two decimals.
    pub fn progress_percentage(&self) -> f64 {
        progress_percentage(self.processed_files, self.total_files)
    }
}

/// Computes `processed / total * 100` rounded to two decimals, 0 when `total` is 0.
pub fn progress_percentage(processed: u32, total: u32) -> f64 {
    if total == 0 {
        return 0.0;
    }
    let raw = processed as f64 / total as f64 * 100.0;
    (raw * 100.0).round() / 100.0
}

/// One submitted file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileTask {
    /// Original filename as supplied by the caller.
    pub filename: String,
    /// Base64-encoded file content.
    pub content: String,
    /// Ordinal position within the batch.
    #[serde(default)]
    pub position: Option<usize>,
}

impl FileTask {
    /// Creates a file task from already base64-encoded content.
    pub fn new(filename: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            content: content.into(),
            position: None,
        }
    }

    /// Creates a file task by base64-encoding raw bytes.
    pub fn from_bytes(filename: impl Into<String>, bytes: &[u8]) -> Self {
        use base64::Engine as _;
        Self::new(filename, base64::engine::general_purpose::STANDARD.encode(bytes))
    }

    /// Sets the ordinal position.
    pub fn with_position(mut self, position: usize) -> Self {
        self.position = Some(position);
        self
    }
}

/// Content kind detected for a submitted file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentKind {
    /// Already a DICOM Part-10 object.
    Dicom,
    Jpeg,
    Png,
    Gif,
    Bmp,
    /// Some other image; identified only by not being DICOM.
    Image,
}

impl ContentKind {
    /// Returns whether this kind is already in the target container format.
    pub fn is_dicom(&self) -> bool {
        matches!(self, ContentKind::Dicom)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ContentKind::Dicom => "dicom",
            ContentKind::Jpeg => "jpeg",
            ContentKind::Png => "png",
            ContentKind::Gif => "gif",
            ContentKind::Bmp => "bmp",
            ContentKind::Image => "image",
        }
    }
}

impl fmt::Display for ContentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of processing a single file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileResult {
    /// Original filename.
    pub filename: String,
    /// Whether the file was fully processed and persisted.
    pub success: bool,
    /// Identifier of the stored artifact; present only on success.
    pub artifact_id: Option<Uuid>,
    /// Human-readable failure message; present only on failure.
    pub error: Option<String>,
    /// Classification label produced for the artifact.
    pub classification_label: Option<String>,
    /// Confidence of the classification label.
    pub confidence: Option<f64>,
    /// Content kind detected during processing.
    pub detected_kind: Option<ContentKind>,
    /// SHA-256 of the de-identified artifact before encryption.
    pub fingerprint: Option<String>,
}

impl FileResult {
    /// Creates a successful result.
    pub fn success(
        filename: impl Into<String>,
        artifact_id: Uuid,
        classification: &Classification,
        detected_kind: ContentKind,
        fingerprint: impl Into<String>,
    ) -> Self {
        Self {
            filename: filename.into(),
            success: true,
            artifact_id: Some(artifact_id),
            error: None,
            classification_label: Some(classification.label.clone()),
            confidence: Some(classification.confidence),
            detected_kind: Some(detected_kind),
            fingerprint: Some(fingerprint.into()),
        }
    }

    /// Creates a failed result.
    pub fn failure(filename: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            success: false,
            artifact_id: None,
            error: Some(error.into()),
            classification_label: None,
            confidence: None,
            detected_kind: None,
            fingerprint: None,
        }
    }

    /// Records the detected kind on a failed result when detection got that far.
    pub fn with_detected_kind(mut self, kind: ContentKind) -> Self {
        self.detected_kind = Some(kind);
        self
    }
}

/// Label attached to a processed artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub model_version: String,
    pub label: String,
    pub confidence: f64,
}

/// What a single orchestrator invocation produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchOutcome {
    pub batch_id: Uuid,
    /// Terminal status written for the batch.
    pub status: BatchStatus,
    pub total_files: u32,
    pub processed_files: u32,
    pub failed_files: u32,
    /// Per-file results in submission order.
    pub results: Vec<FileResult>,
    /// Intermediate progress writes that failed and were skipped.
    #[serde(default)]
    pub missed_progress_updates: u32,
}

impl BatchOutcome {
    /// Returns the results of failed files only.
    pub fn failures(&self) -> impl Iterator<Item = &FileResult> {
        self.results.iter().filter(|r| !r.success)
    }
}

/// Status view of a batch, as returned to pollers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchStatusReport {
    pub batch_id: Uuid,
    pub status: BatchStatus,
    pub total_files: u32,
    pub processed_files: u32,
    pub progress_percentage: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl From<&Batch> for BatchStatusReport {
    fn from(batch: &Batch) -> Self {
        Self {
            batch_id: batch.batch_id,
            status: batch.status,
            total_files: batch.total_files,
            processed_files: batch.processed_files,
            progress_percentage: batch.progress_percentage(),
            created_at: batch.created_at,
            updated_at: batch.updated_at,
        }
    }
}
