//! Error types for persona-forge operations.
//!
//! Defines error types for the subsystems the pipeline drives:
//! - External service calls (generation, vision scoring, training)
//! - Status store persistence
//! - Blob storage uploads and downloads
//! - Training job packaging and lifecycle

use thiserror::Error;

use crate::utils::backoff::Transient;

/// Errors returned by the external service clients.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("{service} not configured: {detail}")]
    NotConfigured { service: String, detail: String },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("API error ({code}): {message}")]
    Api { code: u16, message: String },

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Remote job failed: {0}")]
    JobFailed(String),

    #[error("Blob storage error: {0}")]
    Blob(#[from] BlobError),
}

impl ServiceError {
    /// Shorthand for a missing endpoint or credential.
    pub fn not_configured(service: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::NotConfigured {
            service: service.into(),
            detail: detail.into(),
        }
    }

    /// Maps a reqwest transport error, keeping timeouts distinguishable.
    pub fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ServiceError::Timeout(err.to_string())
        } else {
            ServiceError::Network(err.to_string())
        }
    }

    /// Maps a non-success HTTP status and body.
    pub fn from_status(code: u16, body: String) -> Self {
        if code == 429 {
            ServiceError::RateLimited(body)
        } else {
            ServiceError::Api {
                code,
                message: body,
            }
        }
    }
}

impl Transient for ServiceError {
    fn is_transient(&self) -> bool {
        match self {
            ServiceError::Network(_) | ServiceError::RateLimited(_) | ServiceError::Timeout(_) => {
                true
            }
            // 529 is the overload code some providers use
            ServiceError::Api { code, .. } => *code >= 500 || *code == 429 || *code == 408,
            ServiceError::Blob(err) => err.is_transient(),
            ServiceError::NotConfigured { .. }
            | ServiceError::InvalidResponse(_)
            | ServiceError::JobFailed(_) => false,
        }
    }
}

/// Errors that can occur during status store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Query failed: {0}")]
    Query(#[from] sqlx::Error),

    #[error("Run {0} not found")]
    RunNotFound(uuid::Uuid),

    #[error("Image '{image_id}' not found in run {run_id}")]
    ImageNotFound { run_id: uuid::Uuid, image_id: String },

    #[error("Corrupt row data: {0}")]
    InvalidData(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] crate::storage::MigrationError),
}

/// Errors that can occur during blob storage operations.
#[derive(Debug, Error)]
pub enum BlobError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Invalid object path '{0}'")]
    InvalidPath(String),

    #[error("Upload of '{path}' failed: {reason}")]
    UploadFailed { path: String, reason: String },

    #[error("Download of '{location}' failed: {reason}")]
    DownloadFailed { location: String, reason: String },

    #[error("Storage backend error ({code}): {message}")]
    Backend { code: u16, message: String },
}

impl Transient for BlobError {
    fn is_transient(&self) -> bool {
        match self {
            BlobError::Backend { code, .. } => *code >= 500 || *code == 429,
            BlobError::DownloadFailed { .. } | BlobError::UploadFailed { .. } => true,
            BlobError::Io(_) | BlobError::NotFound(_) | BlobError::InvalidPath(_) => false,
        }
    }
}

/// Errors that stop a whole evaluation pass.
///
/// Per-image failures never surface here; they become failed images.
#[derive(Debug, Error)]
pub enum EvaluationError {
    #[error("Failed to fetch reference image: {0}")]
    Reference(#[source] BlobError),

    #[error("Status store error: {0}")]
    Store(#[from] StoreError),
}

/// Errors that can occur while publishing an adapter.
#[derive(Debug, Error)]
pub enum DeployError {
    #[error("Failed to store adapter: {0}")]
    Blob(#[from] BlobError),

    #[error("Status store error: {0}")]
    Store(#[from] StoreError),
}

/// Errors that can occur while producing a trained adapter.
#[derive(Debug, Error)]
pub enum TrainingError {
    #[error("No captioned images to train on")]
    EmptyDataset,

    #[error("Image '{0}' has no caption")]
    MissingCaption(String),

    #[error("Training archive is {size} bytes, over the {limit} byte upload limit")]
    ArchiveTooLarge { size: u64, limit: u64 },

    #[error("Failed to build training archive: {0}")]
    Archive(#[from] std::io::Error),

    #[error("Failed to recompress image '{image_id}': {source}")]
    ImageCodec {
        image_id: String,
        #[source]
        source: image::ImageError,
    },

    #[error("Training job {job_id} ended with status '{status}': {reason}")]
    JobFailed {
        job_id: String,
        status: String,
        reason: String,
    },

    #[error("Training job {job_id} still running after {polls} polls")]
    Timeout { job_id: String, polls: u32 },

    #[error("Training job {0} succeeded without an artifact URL")]
    MissingArtifact(String),

    #[error("Training service error: {0}")]
    Service(#[from] ServiceError),

    #[error("Blob storage error: {0}")]
    Blob(#[from] BlobError),

    #[error("Status store error: {0}")]
    Store(#[from] StoreError),
}
