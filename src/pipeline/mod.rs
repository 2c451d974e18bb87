//! Per-file transformation pipeline.
//!
//! Turns one submitted file into a stored, de-identified, encrypted artifact.
//! The pipeline knows nothing about batches beyond tagging provenance with a
//! batch id.
//!
//! # Steps
//!
//! 1. Decode the base64 payload
//! 2. Materialize it into a scoped temporary file (removed on every exit path)
//! 3. Detect the content kind from signature bytes, then the extension
//! 4. Convert to DICOM unless it already is
//! 5. Strip direct identifiers, recording what was removed
//! 6. Fingerprint the de-identified bytes
//! 7. Encrypt the de-identified bytes
//! 8. Persist through the [`ArtifactSink`]
//!
//! Steps 1-7 are synchronous and run on the blocking thread pool. Any failure
//! before step 8 leaves no persisted side effect.
//!
//! [`FilePipeline::process`] never returns an error: every failure becomes a
//! failed [`FileResult`].

pub mod crypto;
pub mod detect;
pub mod dicom;

use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::Arc;

use base64::Engine as _;
use chrono::Utc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::batch::{Classification, ContentKind, FileResult, FileTask};
use crate::error::PipelineError;
use crate::storage::{ArtifactMetadata, ArtifactSink};

pub use crypto::{sha256_hex, ArtifactCipher, CryptoError};
pub use detect::detect_kind;
pub use dicom::{
    Anonymized, Anonymizer, DicomError, DicomObject, ImageConverter, SecondaryCaptureConverter,
    TagStripper,
};

/// Model version recorded for stub classifications.
pub const STUB_MODEL_VERSION: &str = "v1.0";
/// Label recorded for stub classifications.
pub const STUB_LABEL: &str = "Processing Complete";
/// Confidence recorded for stub classifications.
pub const STUB_CONFIDENCE: f64 = 0.95;

/// Bytes read back from the temporary file for signature detection.
const SIGNATURE_WINDOW: u64 = 132;

/// Produces a classification for a de-identified artifact.
pub trait Classifier: Send + Sync {
    fn classify(&self, artifact: &[u8]) -> Classification;
}

/// Classifier returning a fixed label.
#[derive(Debug, Clone, Copy, Default)]
pub struct StubClassifier;

impl Classifier for StubClassifier {
    fn classify(&self, _artifact: &[u8]) -> Classification {
        Classification {
            model_version: STUB_MODEL_VERSION.to_string(),
            label: STUB_LABEL.to_string(),
            confidence: STUB_CONFIDENCE,
        }
    }
}

/// The synchronous part of the pipeline; cheap to clone into a blocking task.
#[derive(Clone)]
struct Transformer {
    converter: Arc<dyn ImageConverter>,
    anonymizer: Arc<dyn Anonymizer>,
    classifier: Arc<dyn Classifier>,
    cipher: ArtifactCipher,
    scratch_dir: Option<PathBuf>,
}

/// An artifact ready to persist.
struct Prepared {
    metadata: ArtifactMetadata,
    encrypted: Vec<u8>,
}

/// A transform failure, with the content kind if detection got that far.
struct Failed {
    error: PipelineError,
    kind: Option<ContentKind>,
}

impl Failed {
    fn before_detection(error: impl Into<PipelineError>) -> Self {
        Self {
            error: error.into(),
            kind: None,
        }
    }

    fn after_detection(kind: ContentKind) -> impl FnOnce(PipelineError) -> Self {
        move |error| Self {
            error,
            kind: Some(kind),
        }
    }
}

impl Transformer {
    fn prepare(&self, task: &FileTask, batch_id: Uuid, artifact_id: Uuid) -> Result<Prepared, Failed> {
        if task.content.trim().is_empty() {
            return Err(Failed::before_detection(PipelineError::MissingContent));
        }

        let source = base64::engine::general_purpose::STANDARD
            .decode(task.content.trim())
            .map_err(Failed::before_detection)?;

        let mut builder = tempfile::Builder::new();
        builder.prefix("medbatch-");
        let created = match &self.scratch_dir {
            Some(dir) => builder.tempfile_in(dir),
            None => builder.tempfile(),
        };
        let mut temp = created.map_err(|e| Failed::before_detection(PipelineError::TempFile(e)))?;
        temp.write_all(&source)
            .and_then(|_| temp.flush())
            .map_err(|e| Failed::before_detection(PipelineError::TempFile(e)))?;

        let mut head = Vec::with_capacity(SIGNATURE_WINDOW as usize);
        temp.reopen()
            .and_then(|file| file.take(SIGNATURE_WINDOW).read_to_end(&mut head))
            .map_err(|e| Failed::before_detection(PipelineError::TempFile(e)))?;

        let kind = detect_kind(&head, &task.filename);
        let on_error = Failed::after_detection(kind);

        let (dicom_bytes, converted) = if kind.is_dicom() {
            (source.clone(), false)
        } else {
            let bytes = self
                .converter
                .convert(&source, kind, artifact_id)
                .map_err(|e| PipelineError::Conversion(e.to_string()))
                .map_err(Failed::after_detection(kind))?;
            (bytes, true)
        };

        let Anonymized { bytes, removed } = self
            .anonymizer
            .anonymize(&dicom_bytes)
            .map_err(|e| on_error(e.into()))?;

        let fingerprint = sha256_hex(&bytes);
        let classification = self.classifier.classify(&bytes);
        let encrypted = self
            .cipher
            .encrypt(&bytes)
            .map_err(|e| Failed::after_detection(kind)(e.into()))?;

        Ok(Prepared {
            metadata: ArtifactMetadata {
                artifact_id,
                batch_id,
                original_filename: task.filename.clone(),
                extension: detect::extension(&task.filename),
                detected_kind: kind,
                source_sha256: sha256_hex(&source),
                fingerprint,
                converted,
                anonymized: true,
                removed_tags: removed,
                classification,
                processed_at: Utc::now(),
            },
            encrypted,
        })
    }
}

/// Transforms and persists single files.
pub struct FilePipeline {
    transformer: Transformer,
    sink: Arc<dyn ArtifactSink>,
}

impl FilePipeline {
    /// Creates a pipeline with the built-in converter, anonymizer and classifier.
    pub fn new(cipher: ArtifactCipher, sink: Arc<dyn ArtifactSink>) -> Self {
        Self {
            transformer: Transformer {
                converter: Arc::new(SecondaryCaptureConverter),
                anonymizer: Arc::new(TagStripper),
                classifier: Arc::new(StubClassifier),
                cipher,
                scratch_dir: None,
            },
            sink,
        }
    }

    /// Places scratch files in `dir` instead of the system temp directory.
    pub fn with_scratch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.transformer.scratch_dir = Some(dir.into());
        self
    }

    /// Replaces the image converter.
    pub fn with_converter(mut self, converter: Arc<dyn ImageConverter>) -> Self {
        self.transformer.converter = converter;
        self
    }

    /// Replaces the anonymizer.
    pub fn with_anonymizer(mut self, anonymizer: Arc<dyn Anonymizer>) -> Self {
        self.transformer.anonymizer = anonymizer;
        self
    }

    /// Replaces the classifier.
    pub fn with_classifier(mut self, classifier: Arc<dyn Classifier>) -> Self {
        self.transformer.classifier = classifier;
        self
    }

    /// Returns the cipher used to seal artifacts.
    pub fn cipher(&self) -> &ArtifactCipher {
        &self.transformer.cipher
    }

    /// Processes one file into a [`FileResult`].
    pub async fn process(&self, task: FileTask, batch_id: Uuid, owner: Option<&str>) -> FileResult {
        let filename = task.filename.clone();
        let artifact_id = Uuid::new_v4();
        let transformer = self.transformer.clone();

        let prepared = tokio::task::spawn_blocking(move || {
            transformer.prepare(&task, batch_id, artifact_id)
        })
        .await;

        let prepared = match prepared {
            Ok(Ok(prepared)) => prepared,
            Ok(Err(Failed { error, kind })) => {
                debug!(batch_id = %batch_id, filename = %filename, error = %error, "File transform failed");
                let result = FileResult::failure(&filename, error.to_string());
                return match kind {
                    Some(kind) => result.with_detected_kind(kind),
                    None => result,
                };
            }
            Err(join_error) => {
                warn!(batch_id = %batch_id, filename = %filename, error = %join_error, "File transform task aborted");
                return FileResult::failure(
                    &filename,
                    PipelineError::Panicked(join_error.to_string()).to_string(),
                );
            }
        };

        let Prepared { metadata, encrypted } = prepared;
        match self.sink.persist_artifact(owner, &metadata, &encrypted).await {
            Ok(stored_id) => FileResult::success(
                &filename,
                stored_id,
                &metadata.classification,
                metadata.detected_kind,
                metadata.fingerprint,
            ),
            Err(e) => {
                let error = PipelineError::Persistence(e);
                warn!(batch_id = %batch_id, filename = %filename, error = %error, "Artifact persistence failed");
                FileResult::failure(&filename, error.to_string()).with_detected_kind(metadata.detected_kind)
            }
        }
    }
}
