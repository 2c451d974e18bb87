//! Database schema constants.
//!
//! Batch bookkeeping lives in `upload_batches`; every persisted artifact adds
//! one row to `uploads`, `dicom_metadata`, `ml_results` and `audit_log`, plus
//! `user_uploads` when the batch has an owner.

/// SQL schema for creating the upload_batches table.
pub const CREATE_UPLOAD_BATCHES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS upload_batches (
    batch_id UUID PRIMARY KEY,
    user_id TEXT,
    total_files INTEGER NOT NULL CHECK (total_files >= 1),
    processed_files INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL DEFAULT 'queued',
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at TIMESTAMPTZ,
    CHECK (processed_files >= 0 AND processed_files <= total_files)
)
"#;

/// SQL schema for creating the uploads table.
pub const CREATE_UPLOADS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS uploads (
    id UUID PRIMARY KEY,
    original_filename TEXT NOT NULL,
    file_extension TEXT,
    upload_time TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    source TEXT NOT NULL,
    storage_path TEXT NOT NULL,
    file_hash VARCHAR(64) NOT NULL,
    fingerprint VARCHAR(64) NOT NULL,
    size_bytes BIGINT NOT NULL,
    encrypted BOOLEAN NOT NULL DEFAULT TRUE,
    status TEXT NOT NULL,
    batch_id UUID REFERENCES upload_batches(batch_id) ON DELETE SET NULL
)
"#;

/// SQL schema for creating the dicom_metadata table.
pub const CREATE_DICOM_METADATA_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS dicom_metadata (
    id SERIAL PRIMARY KEY,
    upload_id UUID NOT NULL REFERENCES uploads(id) ON DELETE CASCADE,
    detected_kind TEXT NOT NULL,
    converted BOOLEAN NOT NULL,
    anonymized BOOLEAN NOT NULL,
    removed_tags JSONB NOT NULL
)
"#;

/// SQL schema for creating the ml_results table.
pub const CREATE_ML_RESULTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS ml_results (
    id SERIAL PRIMARY KEY,
    upload_id UUID NOT NULL REFERENCES uploads(id) ON DELETE CASCADE,
    model_version TEXT NOT NULL,
    prediction TEXT NOT NULL,
    confidence DOUBLE PRECISION NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

/// SQL schema for creating the user_uploads table.
pub const CREATE_USER_UPLOADS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS user_uploads (
    id SERIAL PRIMARY KEY,
    user_id TEXT NOT NULL,
    upload_id UUID NOT NULL REFERENCES uploads(id) ON DELETE CASCADE,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    UNIQUE(user_id, upload_id)
)
"#;

/// SQL schema for creating the audit_log table.
pub const CREATE_AUDIT_LOG_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS audit_log (
    id SERIAL PRIMARY KEY,
    user_id TEXT,
    action TEXT NOT NULL,
    resource_type TEXT NOT NULL,
    resource_id UUID NOT NULL,
    success BOOLEAN NOT NULL,
    details JSONB NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

/// SQL for creating all required indexes.
pub const CREATE_INDEXES: &str = r#"
CREATE INDEX IF NOT EXISTS idx_upload_batches_user_id ON upload_batches(user_id, created_at DESC);
CREATE INDEX IF NOT EXISTS idx_uploads_batch_id ON uploads(batch_id, upload_time);
CREATE INDEX IF NOT EXISTS idx_uploads_fingerprint ON uploads(fingerprint);
CREATE INDEX IF NOT EXISTS idx_ml_results_upload_id ON ml_results(upload_id);
CREATE INDEX IF NOT EXISTS idx_audit_log_resource_id ON audit_log(resource_id)
"#;

/// Returns all schema creation statements in the correct order.
pub fn all_schema_statements() -> Vec<&'static str> {
    vec![
        CREATE_UPLOAD_BATCHES_TABLE,
        CREATE_UPLOADS_TABLE,
        CREATE_DICOM_METADATA_TABLE,
        CREATE_ML_RESULTS_TABLE,
        CREATE_USER_UPLOADS_TABLE,
        CREATE_AUDIT_LOG_TABLE,
        CREATE_INDEXES,
    ]
}

/// Table names in the schema.
pub mod tables {
    pub const UPLOAD_BATCHES: &str = "upload_batches";
    pub const UPLOADS: &str = "uploads";
    pub const DICOM_METADATA: &str = "dicom_metadata";
    pub const ML_RESULTS: &str = "ml_results";
    pub const USER_UPLOADS: &str = "user_uploads";
    pub const AUDIT_LOG: &str = "audit_log";
}
