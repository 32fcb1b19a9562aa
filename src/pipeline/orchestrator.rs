//! Pipeline orchestrator driving one run through every stage.
//!
//! The orchestrator owns the stage state machine:
//!
//! ```text
//! pending → generating_dataset → evaluating ⟲ replacement rounds
//!         → captioning → training ⟲ validating (retry loop) → deployed
//! ```
//!
//! Any stage error ends up in [`PipelineOrchestrator::run_from`], which is the
//! only place a run is marked `failed`. Per-image and per-prompt errors are
//! absorbed by the stage components and never reach this level.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::captioning::Captioner;
use crate::catalog::PromptCatalog;
use crate::clients::{
    ImageGenerationService, ImageGenerator, TrainingService, VisionEvaluationService,
};
use crate::dataset::DatasetGenerator;
use crate::deploy::{Deployer, Deployment};
use crate::error::{DeployError, EvaluationError, ServiceError, StoreError, TrainingError};
use crate::evaluation::QualityEvaluator;
use crate::metrics::{AttemptOutcome, MetricsCollector};
use crate::models::{CandidateImage, EvalStatus, RunStatus, SubjectInput};
use crate::storage::{BlobStorage, StatusStore};
use crate::training::{overrides_for_attempt, TrainedArtifact, Trainer};
use crate::validation::Validator;

use super::config::PipelineConfig;

/// Errors that end a run.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Configuration error: {0}")]
    Config(#[from] super::config::ConfigError),

    #[error("Status store error: {0}")]
    Store(#[from] StoreError),

    #[error("Evaluation error: {0}")]
    Evaluation(#[from] EvaluationError),

    #[error("Training error: {0}")]
    Training(#[from] TrainingError),

    #[error("Service error: {0}")]
    Service(#[from] ServiceError),

    #[error("Deploy error: {0}")]
    Deploy(#[from] DeployError),

    #[error("Insufficient training data: {passed} images passed evaluation, {required} required")]
    InsufficientData { passed: u32, required: u32 },

    #[error("Adapter failed validation after {attempts} training attempts")]
    ValidationExhausted { attempts: u32 },
}

/// External services the pipeline drives.
#[derive(Clone)]
pub struct PipelineServices {
    /// Reference-conditioned renders for the primary catalog lane.
    pub primary_generation: Arc<dyn ImageGenerationService>,
    /// Secondary lane renders and adapter validation renders.
    pub secondary_generation: Arc<dyn ImageGenerationService>,
    pub vision: Arc<dyn VisionEvaluationService>,
    pub training: Arc<dyn TrainingService>,
}

impl PipelineServices {
    /// Builds the HTTP clients from `IMAGE_GEN_*`, `VISION_*` and `TRAINING_*`.
    pub fn from_env() -> Result<Self, ServiceError> {
        use crate::clients::{
            ChatVisionClient, HostedGenerationClient, HttpTrainingClient,
            ServerlessGenerationClient,
        };

        Ok(Self {
            primary_generation: Arc::new(HostedGenerationClient::from_env()?),
            secondary_generation: Arc::new(ServerlessGenerationClient::from_env()?),
            vision: Arc::new(ChatVisionClient::from_env()?),
            training: Arc::new(HttpTrainingClient::from_env()?),
        })
    }
}

/// Where [`PipelineOrchestrator::run_from`] enters the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageEntry {
    /// Fresh run: generate the dataset.
    Start,
    /// Passed images exist; caption them and train.
    Captioning,
    /// Captions exist. Caption any stragglers, then train starting at
    /// `attempt`, following `job_id` instead of submitting if it is set.
    Training { attempt: u32, job_id: Option<String> },
}

/// Outcome of one training attempt that did not error.
enum AttemptResult {
    Validated(TrainedArtifact),
    Rejected,
}

pub struct PipelineOrchestrator {
    config: PipelineConfig,
    store: Arc<dyn StatusStore>,
    generator: DatasetGenerator,
    evaluator: QualityEvaluator,
    captioner: Captioner,
    trainer: Trainer,
    validator: Validator,
    deployer: Deployer,
    metrics: MetricsCollector,
}

impl PipelineOrchestrator {
    /// Wires every stage component from shared storage and services.
    pub fn new(
        config: PipelineConfig,
        store: Arc<dyn StatusStore>,
        blob: Arc<dyn BlobStorage>,
        catalog: Arc<PromptCatalog>,
        services: PipelineServices,
    ) -> Result<Self, PipelineError> {
        config.validate()?;

        let render_poll = config.render_poll();
        let primary = ImageGenerator::new(services.primary_generation, render_poll.clone());
        let secondary = ImageGenerator::new(services.secondary_generation, render_poll);

        let generator = DatasetGenerator::new(
            catalog.clone(),
            primary,
            secondary.clone(),
            blob.clone(),
            store.clone(),
            &config,
        );
        let evaluator = QualityEvaluator::new(
            services.vision.clone(),
            blob.clone(),
            store.clone(),
            &config,
        )
        .with_catalog(catalog.clone());
        let captioner = Captioner::new(catalog);
        let trainer = Trainer::new(store.clone(), blob.clone(), services.training, &config);
        let validator = Validator::new(secondary, services.vision, blob.clone(), &config);
        let deployer = Deployer::new(store.clone(), blob);

        Ok(Self {
            config,
            store,
            generator,
            evaluator,
            captioner,
            trainer,
            validator,
            deployer,
            metrics: MetricsCollector::new(),
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn StatusStore> {
        &self.store
    }

    pub fn training_service(&self) -> &Arc<dyn TrainingService> {
        self.trainer.service()
    }

    /// Runs a fresh pipeline for an existing run row.
    pub async fn run(&self, subject: &SubjectInput, run_id: Uuid) -> RunStatus {
        self.run_from(subject, run_id, StageEntry::Start).await
    }

    /// Drives the run from `entry` to a terminal status and returns it.
    ///
    /// Never returns an error: failures are written to the run instead.
    pub async fn run_from(
        &self,
        subject: &SubjectInput,
        run_id: Uuid,
        entry: StageEntry,
    ) -> RunStatus {
        self.metrics.run_started();
        let started = Instant::now();
        info!(run_id = %run_id, subject = %subject.slug, entry = ?entry, "Pipeline run starting");

        let status = match self.execute(subject, run_id, entry).await {
            Ok(deployment) => {
                info!(
                    run_id = %run_id,
                    filename = %deployment.filename,
                    elapsed_secs = started.elapsed().as_secs(),
                    "Pipeline run deployed"
                );
                RunStatus::Deployed
            }
            Err(err) => {
                error!(run_id = %run_id, error = %err, "Pipeline run failed");
                self.fail_run(run_id, &err.to_string()).await;
                RunStatus::Failed
            }
        };

        self.metrics.run_finished(status);
        status
    }

    /// Records a terminal failure. A store error here can only be logged.
    pub(crate) async fn fail_run(&self, run_id: Uuid, message: &str) {
        if let Err(err) = self
            .store
            .update_run_status(run_id, RunStatus::Failed, Some(message))
            .await
        {
            error!(run_id = %run_id, error = %err, "Could not record run failure");
        }
    }

    async fn execute(
        &self,
        subject: &SubjectInput,
        run_id: Uuid,
        entry: StageEntry,
    ) -> Result<Deployment, PipelineError> {
        let (images, first_attempt, job_id) = match entry {
            StageEntry::Start => {
                self.build_dataset(subject, run_id).await?;
                (self.caption_stage(subject, run_id).await?, 1, None)
            }
            StageEntry::Captioning => (self.caption_stage(subject, run_id).await?, 1, None),
            StageEntry::Training { attempt, job_id } => {
                (self.caption_passed(subject, run_id).await?, attempt.max(1), job_id)
            }
        };

        let artifact = self
            .training_loop(subject, run_id, &images, first_attempt, job_id)
            .await?;

        Ok(self
            .deployer
            .deploy(&artifact, subject, run_id, images.len() as u32)
            .await?)
    }

    async fn enter(&self, run_id: Uuid, status: RunStatus) -> Result<Instant, StoreError> {
        self.store.update_run_status(run_id, status, None).await?;
        info!(run_id = %run_id, stage = %status, "Entering stage");
        Ok(Instant::now())
    }

    fn leave(&self, status: RunStatus, started: Instant) {
        self.metrics
            .record_stage_duration(status, started.elapsed().as_secs_f64());
    }

    /// Generation, evaluation and replacement rounds. Returns the passed count.
    async fn build_dataset(&self, subject: &SubjectInput, run_id: Uuid) -> Result<u32, PipelineError> {
        let started = self.enter(run_id, RunStatus::GeneratingDataset).await?;
        let batch = self.generator.generate(subject, run_id).await?;
        self.leave(RunStatus::GeneratingDataset, started);

        let started = self.enter(run_id, RunStatus::Evaluating).await?;
        let outcome = self
            .evaluator
            .evaluate(subject, batch.images)
            .await?;

        let mut passed: Vec<CandidateImage> = outcome.passed;
        let target = self.config.target_passed_images as usize;
        let mut round = 0;

        while passed.len() < target && round < self.config.max_replacement_rounds {
            round += 1;

            for image in self.store.list_images(run_id).await? {
                if matches!(image.status, EvalStatus::Failed | EvalStatus::Pending) {
                    self.store
                        .set_image_status(run_id, &image.id, EvalStatus::Replaced)
                        .await?;
                }
            }

            // Prompts without a passed image: failed candidates plus prompts
            // that never produced one.
            let covered: BTreeSet<&str> = passed.iter().map(|i| i.prompt_id.as_str()).collect();
            let prompts: Vec<String> = self
                .generator
                .catalog()
                .prompts()
                .iter()
                .filter(|p| !covered.contains(p.id.as_str()))
                .map(|p| p.id.clone())
                .collect();
            if prompts.is_empty() {
                break;
            }

            info!(
                run_id = %run_id,
                round = round,
                passed = passed.len(),
                target = target,
                regenerating = prompts.len(),
                "Starting replacement round"
            );

            let batch = self
                .generator
                .generate_replacements(subject, run_id, &prompts, round)
                .await?;
            let outcome = self
                .evaluator
                .evaluate(subject, batch.images)
                .await?;
            passed.extend(outcome.passed);
        }
        self.leave(RunStatus::Evaluating, started);

        let count = passed.len() as u32;
        info!(run_id = %run_id, passed = count, rounds = round, "Dataset evaluated");
        if count < self.config.min_passed_images {
            return Err(PipelineError::InsufficientData {
                passed: count,
                required: self.config.min_passed_images,
            });
        }
        Ok(count)
    }

    async fn caption_stage(
        &self,
        subject: &SubjectInput,
        run_id: Uuid,
    ) -> Result<Vec<CandidateImage>, PipelineError> {
        let started = self.enter(run_id, RunStatus::Captioning).await?;
        let images = self.caption_passed(subject, run_id).await?;
        self.leave(RunStatus::Captioning, started);
        Ok(images)
    }

    /// Captions every passed image that has no caption yet and returns all
    /// passed images.
    async fn caption_passed(
        &self,
        subject: &SubjectInput,
        run_id: Uuid,
    ) -> Result<Vec<CandidateImage>, PipelineError> {
        let mut images = self
            .store
            .list_images_with_status(run_id, EvalStatus::Passed)
            .await?;

        let mut captioned = 0;
        for image in images.iter_mut().filter(|i| i.caption.is_none()) {
            let caption = self.captioner.caption(image, &subject.gender_tag);
            self.store
                .set_image_caption(run_id, &image.id, &caption)
                .await?;
            debug!(run_id = %run_id, image_id = %image.id, caption = %caption, "Captioned");
            image.caption = Some(caption);
            captioned += 1;
        }

        self.store.set_dataset_size(run_id, images.len() as u32).await?;
        info!(
            run_id = %run_id,
            images = images.len(),
            newly_captioned = captioned,
            "Captions ready"
        );
        Ok(images)
    }

    async fn training_loop(
        &self,
        subject: &SubjectInput,
        run_id: Uuid,
        images: &[CandidateImage],
        first_attempt: u32,
        mut job_id: Option<String>,
    ) -> Result<TrainedArtifact, PipelineError> {
        let max_attempts = self.config.max_training_attempts;

        for attempt in first_attempt..=max_attempts {
            let result = self
                .training_attempt(subject, run_id, images, attempt, job_id.take())
                .await;

            match result {
                Ok(AttemptResult::Validated(artifact)) => {
                    self.metrics.record_training_attempt(AttemptOutcome::Validated);
                    return Ok(artifact);
                }
                Ok(AttemptResult::Rejected) => {
                    self.metrics.record_training_attempt(AttemptOutcome::Rejected);
                    warn!(run_id = %run_id, attempt = attempt, "Adapter rejected by validation");
                }
                Err(err) if attempt < max_attempts => {
                    self.metrics.record_training_attempt(AttemptOutcome::Error);
                    warn!(run_id = %run_id, attempt = attempt, error = %err, "Training attempt failed");
                }
                Err(err) => {
                    self.metrics.record_training_attempt(AttemptOutcome::Error);
                    return Err(err);
                }
            }
        }

        Err(PipelineError::ValidationExhausted {
            attempts: max_attempts,
        })
    }

    async fn training_attempt(
        &self,
        subject: &SubjectInput,
        run_id: Uuid,
        images: &[CandidateImage],
        attempt: u32,
        job_id: Option<String>,
    ) -> Result<AttemptResult, PipelineError> {
        let started = self.enter(run_id, RunStatus::Training).await?;
        self.store
            .begin_training_attempt(run_id, attempt, job_id.as_deref())
            .await?;
        let overrides = overrides_for_attempt(attempt);
        info!(
            run_id = %run_id,
            attempt = attempt,
            learning_rate_factor = overrides.learning_rate_factor,
            steps_factor = overrides.steps_factor,
            "Training attempt"
        );

        let artifact = match job_id {
            Some(job_id) => {
                info!(run_id = %run_id, job_id = %job_id, "Following existing training job");
                let params = self.trainer.params_for(&subject.slug, &overrides);
                self.trainer.await_job(&job_id, params).await?
            }
            None => {
                self.trainer
                    .train(images, &subject.slug, run_id, attempt, &overrides)
                    .await?
            }
        };
        self.leave(RunStatus::Training, started);

        let adapter = self.deployer.stage(&artifact, &subject.slug, run_id).await?;

        let started = self.enter(run_id, RunStatus::Validating).await?;
        let recorded = self
            .store
            .list_validations(run_id)
            .await?
            .into_iter()
            .find(|v| v.attempt == attempt);
        let validation = match recorded {
            Some(validation) => {
                info!(run_id = %run_id, attempt = attempt, "Reusing recorded validation");
                validation
            }
            None => {
                let validation = self.validator.validate(subject, &adapter, attempt).await?;
                self.store.record_validation(run_id, &validation).await?;
                validation
            }
        };
        self.store
            .set_validation_score(run_id, validation.mean_score)
            .await?;
        self.leave(RunStatus::Validating, started);

        if validation.overall_pass {
            Ok(AttemptResult::Validated(artifact))
        } else {
            Ok(AttemptResult::Rejected)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = PipelineError::InsufficientData {
            passed: 12,
            required: 20,
        };
        assert_eq!(
            err.to_string(),
            "Insufficient training data: 12 images passed evaluation, 20 required"
        );

        let err = PipelineError::ValidationExhausted { attempts: 3 };
        assert!(err.to_string().contains("3 training attempts"));
    }
}
