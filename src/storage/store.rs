//! The status store contract.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::{
    CandidateImage, EvalStatus, EvaluationDetail, ImageCounts, ImageQuery, PipelineRun,
    RunStatus, TrainingArtifact, ValidationResult,
};

/// A downstream consumer of a subject's active adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsumerLink {
    pub consumer_id: String,
    pub subject_id: String,
    pub active_run_id: Option<Uuid>,
    pub active_adapter_url: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Durable run and image state. The single source of truth for resumption.
///
/// Every write is a primary-key row operation, so several runs can share
/// one store.
#[async_trait]
pub trait StatusStore: Send + Sync {
    // Runs

    async fn create_run(&self, run: &PipelineRun) -> Result<(), StoreError>;

    async fn get_run(&self, run_id: Uuid) -> Result<PipelineRun, StoreError>;

    /// Runs ordered by creation time, optionally filtered by status.
    async fn list_runs(&self, status: Option<RunStatus>) -> Result<Vec<PipelineRun>, StoreError>;

    /// Moves a run to `status`. `error` is stored when given and kept otherwise.
    async fn update_run_status(
        &self,
        run_id: Uuid,
        status: RunStatus,
        error: Option<&str>,
    ) -> Result<(), StoreError>;

    /// Records the attempt number together with the job it follows, `None`
    /// for a fresh submission, in one write so an attempt never points at an
    /// earlier attempt's job.
    async fn begin_training_attempt(
        &self,
        run_id: Uuid,
        attempt: u32,
        job_id: Option<&str>,
    ) -> Result<(), StoreError>;

    async fn set_training_job(&self, run_id: Uuid, job_id: Option<&str>) -> Result<(), StoreError>;

    async fn set_validation_score(&self, run_id: Uuid, score: f64) -> Result<(), StoreError>;

    async fn set_dataset_size(&self, run_id: Uuid, size: u32) -> Result<(), StoreError>;

    /// Marks a run `deployed` with its artifact and demotes every other
    /// `deployed` run of the same subject to `archived`, atomically.
    /// Returns the demoted run ids.
    async fn promote_deployment(
        &self,
        run_id: Uuid,
        artifact: &TrainingArtifact,
        deployed_at: DateTime<Utc>,
    ) -> Result<Vec<Uuid>, StoreError>;

    // Images

    async fn insert_image(&self, image: &CandidateImage) -> Result<(), StoreError>;

    async fn get_image(&self, run_id: Uuid, image_id: &str) -> Result<CandidateImage, StoreError>;

    /// All images of a run in insertion order.
    async fn list_images(&self, run_id: Uuid) -> Result<Vec<CandidateImage>, StoreError>;

    async fn list_images_with_status(
        &self,
        run_id: Uuid,
        status: EvalStatus,
    ) -> Result<Vec<CandidateImage>, StoreError>;

    /// Persists a scoring result together with the status it implies.
    async fn update_image_evaluation(
        &self,
        run_id: Uuid,
        image_id: &str,
        status: EvalStatus,
        detail: &EvaluationDetail,
    ) -> Result<(), StoreError>;

    async fn set_image_status(
        &self,
        run_id: Uuid,
        image_id: &str,
        status: EvalStatus,
    ) -> Result<(), StoreError>;

    async fn set_image_caption(
        &self,
        run_id: Uuid,
        image_id: &str,
        caption: &str,
    ) -> Result<(), StoreError>;

    async fn count_images(&self, run_id: Uuid, query: ImageQuery) -> Result<u32, StoreError>;

    async fn image_counts(&self, run_id: Uuid) -> Result<ImageCounts, StoreError>;

    // Validation

    /// Stores a validation result once per attempt. Returns false when a
    /// result for that attempt already existed and was left untouched.
    async fn record_validation(
        &self,
        run_id: Uuid,
        result: &ValidationResult,
    ) -> Result<bool, StoreError>;

    async fn list_validations(&self, run_id: Uuid) -> Result<Vec<ValidationResult>, StoreError>;

    // Consumers

    async fn register_consumer(&self, consumer_id: &str, subject_id: &str)
        -> Result<(), StoreError>;

    /// Points every consumer of the subject at the given adapter. Returns the
    /// number of consumers updated.
    async fn link_active_adapter(
        &self,
        subject_id: &str,
        run_id: Uuid,
        adapter_url: &str,
    ) -> Result<u64, StoreError>;

    async fn list_consumers(&self, subject_id: &str) -> Result<Vec<ConsumerLink>, StoreError>;
}
