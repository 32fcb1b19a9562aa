//! Adapter publication.
//!
//! [`Deployer::stage`] makes a freshly trained adapter reachable by the
//! generation worker so it can be validated. [`Deployer::deploy`] promotes a
//! validated adapter: the run becomes `deployed`, any earlier deployment of
//! the same subject is archived, and consumers are pointed at the new file.

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::DeployError;
use crate::models::{short_run_id, AdapterRef, SubjectInput, TrainingArtifact};
use crate::storage::blob::is_remote_url;
use crate::storage::{BlobStorage, StatusStore};
use crate::training::TrainedArtifact;

/// Where a deployed adapter ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Deployment {
    pub filename: String,
    pub url: String,
    pub size_bytes: u64,
    /// Runs demoted to `archived` by this deployment.
    pub archived_runs: Vec<Uuid>,
}

/// Blob path an adapter is uploaded to when the trainer's URL is not public.
pub fn adapter_blob_path(filename: &str) -> String {
    format!("adapters/{}", filename.trim_start_matches("characters/"))
}

pub struct Deployer {
    store: Arc<dyn StatusStore>,
    blob: Arc<dyn BlobStorage>,
}

impl Deployer {
    pub fn new(store: Arc<dyn StatusStore>, blob: Arc<dyn BlobStorage>) -> Self {
        Self { store, blob }
    }

    /// Returns an adapter reference the generation worker can download.
    ///
    /// An `http(s)` URL from the training service is used as-is; anything else
    /// is uploaded from the downloaded bytes.
    pub async fn stage(
        &self,
        artifact: &TrainedArtifact,
        subject_slug: &str,
        run_id: Uuid,
    ) -> Result<AdapterRef, DeployError> {
        let filename = AdapterRef::filename_for(subject_slug, &short_run_id(run_id));
        let url = if is_remote_url(&artifact.artifact_url) {
            artifact.artifact_url.clone()
        } else {
            self.blob
                .upload(
                    &adapter_blob_path(&filename),
                    &artifact.bytes,
                    "application/octet-stream",
                )
                .await?
        };
        Ok(AdapterRef::new(filename, url))
    }

    pub async fn deploy(
        &self,
        artifact: &TrainedArtifact,
        subject: &SubjectInput,
        run_id: Uuid,
        dataset_size: u32,
    ) -> Result<Deployment, DeployError> {
        let adapter = self.stage(artifact, &subject.slug, run_id).await?;
        let record = TrainingArtifact {
            url: adapter.url.clone(),
            filename: adapter.filename.clone(),
            size_bytes: artifact.size_bytes(),
            training_job_id: artifact.training_job_id.clone(),
            params: artifact.params.clone(),
        };

        self.store.set_dataset_size(run_id, dataset_size).await?;
        let archived_runs = self
            .store
            .promote_deployment(run_id, &record, Utc::now())
            .await?;
        for archived in &archived_runs {
            info!(run_id = %archived, subject = %subject.subject_id, "Archived previous deployment");
        }

        match self
            .store
            .link_active_adapter(&subject.subject_id, run_id, &adapter.url)
            .await
        {
            Ok(linked) => info!(
                run_id = %run_id,
                subject = %subject.subject_id,
                consumers = linked,
                "Linked active adapter"
            ),
            Err(err) => warn!(
                run_id = %run_id,
                subject = %subject.subject_id,
                error = %err,
                "Failed to link adapter to consumers"
            ),
        }

        info!(
            run_id = %run_id,
            filename = %record.filename,
            size_bytes = record.size_bytes,
            "Adapter deployed"
        );

        Ok(Deployment {
            filename: record.filename,
            url: record.url,
            size_bytes: record.size_bytes,
            archived_runs,
        })
    }
}
