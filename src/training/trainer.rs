//! Training job lifecycle: package, upload, submit, poll, download.

use std::sync::Arc;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clients::{TrainingService, TrainingState};
use crate::error::TrainingError;
use crate::models::CandidateImage;
use crate::pipeline::PipelineConfig;
use crate::storage::{BlobStorage, StatusStore};
use crate::utils::{PollPolicy, Transient};

use super::archive::{build_archive, ArchiveEntry};
use super::params::{ParamOverrides, TrainingParams};

/// A finished training job and the downloaded adapter weights.
#[derive(Debug, Clone)]
pub struct TrainedArtifact {
    pub training_job_id: String,
    /// Where the training service published the weights.
    pub artifact_url: String,
    pub bytes: Vec<u8>,
    pub params: TrainingParams,
}

impl TrainedArtifact {
    pub fn size_bytes(&self) -> u64 {
        self.bytes.len() as u64
    }
}

/// Blob path of the packaged dataset for one attempt.
pub fn dataset_archive_path(subject_slug: &str, run_id: Uuid, attempt: u32) -> String {
    format!("training/{}/{}/attempt-{}.tar.gz", subject_slug, run_id, attempt)
}

pub struct Trainer {
    store: Arc<dyn StatusStore>,
    blob: Arc<dyn BlobStorage>,
    service: Arc<dyn TrainingService>,
    poll: PollPolicy,
    max_archive_bytes: u64,
}

impl Trainer {
    pub fn new(
        store: Arc<dyn StatusStore>,
        blob: Arc<dyn BlobStorage>,
        service: Arc<dyn TrainingService>,
        config: &PipelineConfig,
    ) -> Self {
        Self {
            store,
            blob,
            service,
            poll: config.training_poll(),
            max_archive_bytes: config.max_archive_bytes,
        }
    }

    pub fn service(&self) -> &Arc<dyn TrainingService> {
        &self.service
    }

    /// Parameters for one attempt. The trigger word falls back to the subject slug.
    pub fn params_for(&self, subject_slug: &str, overrides: &ParamOverrides) -> TrainingParams {
        let mut params = TrainingParams::default().with_overrides(overrides);
        if params.trigger_word.is_none() {
            params.trigger_word = Some(subject_slug.to_string());
        }
        params
    }

    /// Trains one adapter from captioned images.
    ///
    /// The job id is written to the run as soon as the service accepts the
    /// job, so another process can pick the job up if this one dies.
    pub async fn train(
        &self,
        images: &[CandidateImage],
        subject_slug: &str,
        run_id: Uuid,
        attempt: u32,
        overrides: &ParamOverrides,
    ) -> Result<TrainedArtifact, TrainingError> {
        let params = self.params_for(subject_slug, overrides);

        let mut entries = Vec::with_capacity(images.len());
        for image in images {
            let caption = image
                .caption
                .clone()
                .ok_or_else(|| TrainingError::MissingCaption(image.id.clone()))?;
            let bytes = self.blob.download(&image.storage_path).await?;
            entries.push(ArchiveEntry {
                image_id: image.id.clone(),
                bytes,
                caption,
            });
        }

        let archive = build_archive(&entries, self.max_archive_bytes)?;
        let path = dataset_archive_path(subject_slug, run_id, attempt);
        let dataset_url = self
            .blob
            .upload(&path, &archive, "application/gzip")
            .await?;

        info!(
            run_id = %run_id,
            attempt = attempt,
            images = entries.len(),
            archive_bytes = archive.len(),
            learning_rate = params.learning_rate,
            steps = params.steps,
            "Submitting training job"
        );

        let job_id = self.service.submit_training(&dataset_url, &params).await?;
        self.store.set_training_job(run_id, Some(&job_id)).await?;
        info!(run_id = %run_id, job_id = %job_id, "Training job submitted");

        self.await_job(&job_id, params).await
    }

    /// Polls an existing job to completion and downloads its weights.
    ///
    /// Transient status-lookup errors count as a poll and are retried on the
    /// next interval; anything else ends the wait.
    pub async fn await_job(
        &self,
        job_id: &str,
        params: TrainingParams,
    ) -> Result<TrainedArtifact, TrainingError> {
        for poll in 1..=self.poll.max_polls {
            match self.service.get_training_status(job_id).await {
                Ok(status) => match status.state {
                    TrainingState::Succeeded => {
                        let artifact_url = status
                            .artifact_url
                            .ok_or_else(|| TrainingError::MissingArtifact(job_id.to_string()))?;
                        let bytes = self.service.download_artifact(&artifact_url).await?;
                        info!(
                            job_id = %job_id,
                            polls = poll,
                            size_bytes = bytes.len(),
                            "Training job succeeded"
                        );
                        return Ok(TrainedArtifact {
                            training_job_id: job_id.to_string(),
                            artifact_url,
                            bytes,
                            params,
                        });
                    }
                    TrainingState::Failed | TrainingState::Cancelled => {
                        return Err(TrainingError::JobFailed {
                            job_id: job_id.to_string(),
                            status: status.state.as_str().to_string(),
                            reason: status.error.unwrap_or_else(|| "no reason given".to_string()),
                        });
                    }
                    TrainingState::Queued | TrainingState::Running => {
                        debug!(job_id = %job_id, poll = poll, state = status.state.as_str(), "Training in progress");
                    }
                },
                Err(err) if err.is_transient() => {
                    warn!(job_id = %job_id, poll = poll, error = %err, "Status lookup failed, will retry");
                }
                Err(err) => return Err(err.into()),
            }

            if poll < self.poll.max_polls {
                self.poll.wait().await;
            }
        }

        Err(TrainingError::Timeout {
            job_id: job_id.to_string(),
            polls: self.poll.max_polls,
        })
    }
}
