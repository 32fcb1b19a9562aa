//! Dataset generation.
//!
//! Drives image generation over the prompt catalog, one prompt at a time.
//! Primary-lane prompts go to the primary backend, secondary-lane prompts to
//! the secondary backend, each followed by that lane's fixed delay. Each
//! prompt gets a bounded number of attempts with linear backoff on transient
//! failures. Every success is uploaded and inserted as a pending candidate
//! before the next prompt starts, so a crash never loses a paid-for image.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::catalog::{PromptCatalog, PromptLane, PromptTemplate};
use crate::clients::{GenerationRequest, ImageGenerator};
use crate::error::{ServiceError, StoreError};
use crate::metrics::MetricsCollector;
use crate::models::{CandidateImage, SubjectInput};
use crate::pipeline::PipelineConfig;
use crate::storage::{BlobStorage, StatusStore};
use crate::utils::BackoffPolicy;

/// Images created by one generation pass and the prompts that produced nothing.
#[derive(Debug, Default)]
pub struct DatasetBatch {
    pub images: Vec<CandidateImage>,
    pub failed_prompts: Vec<String>,
}

/// Candidate id for a prompt in a given replacement round (0 = original).
pub fn candidate_id(prompt_id: &str, round: u32) -> String {
    match round {
        0 => prompt_id.to_string(),
        1 => format!("{}_replacement", prompt_id),
        n => format!("{}_replacement_{}", prompt_id, n),
    }
}

pub fn storage_path(run_id: Uuid, image_id: &str) -> String {
    format!("datasets/{}/{}.png", run_id, image_id)
}

/// Text substituted for `{subject}` in templates.
pub fn subject_phrase(subject: &SubjectInput) -> String {
    subject
        .description
        .clone()
        .unwrap_or_else(|| format!("{}, a {}", subject.name, subject.gender_tag))
}

pub struct DatasetGenerator {
    catalog: Arc<PromptCatalog>,
    primary: ImageGenerator,
    secondary: ImageGenerator,
    blob: Arc<dyn BlobStorage>,
    store: Arc<dyn StatusStore>,
    backoff: BackoffPolicy,
    primary_delay: Duration,
    secondary_delay: Duration,
    metrics: MetricsCollector,
}

impl DatasetGenerator {
    pub fn new(
        catalog: Arc<PromptCatalog>,
        primary: ImageGenerator,
        secondary: ImageGenerator,
        blob: Arc<dyn BlobStorage>,
        store: Arc<dyn StatusStore>,
        config: &PipelineConfig,
    ) -> Self {
        Self {
            catalog,
            primary,
            secondary,
            blob,
            store,
            backoff: config.generation_backoff(),
            primary_delay: config.lane_delay(PromptLane::Primary),
            secondary_delay: config.lane_delay(PromptLane::Secondary),
            metrics: MetricsCollector::new(),
        }
    }

    pub fn catalog(&self) -> &PromptCatalog {
        &self.catalog
    }

    /// Generates one candidate per catalog prompt, primary lane first.
    pub async fn generate(
        &self,
        subject: &SubjectInput,
        run_id: Uuid,
    ) -> Result<DatasetBatch, StoreError> {
        let prompts: Vec<&PromptTemplate> = self
            .catalog
            .lane(PromptLane::Primary)
            .chain(self.catalog.lane(PromptLane::Secondary))
            .collect();

        info!(
            run_id = %run_id,
            prompts = prompts.len(),
            "Generating dataset"
        );
        self.generate_prompts(subject, run_id, &prompts, 0).await
    }

    /// Regenerates the given prompts for a replacement round (1-based).
    ///
    /// Unknown prompt ids are reported back as failed.
    pub async fn generate_replacements(
        &self,
        subject: &SubjectInput,
        run_id: Uuid,
        prompt_ids: &[String],
        round: u32,
    ) -> Result<DatasetBatch, StoreError> {
        let mut prompts = Vec::with_capacity(prompt_ids.len());
        let mut unknown = Vec::new();
        for id in prompt_ids {
            match self.catalog.get(id) {
                Some(prompt) => prompts.push(prompt),
                None => {
                    warn!(run_id = %run_id, prompt_id = %id, "Replacement requested for unknown prompt");
                    unknown.push(id.clone());
                }
            }
        }
        // Keep lane order stable so rate limits behave the same as the first pass.
        prompts.sort_by_key(|p| p.lane == PromptLane::Secondary);

        info!(
            run_id = %run_id,
            round = round,
            prompts = prompts.len(),
            "Generating replacements"
        );
        let mut batch = self
            .generate_prompts(subject, run_id, &prompts, round.max(1))
            .await?;
        batch.failed_prompts.extend(unknown);
        Ok(batch)
    }

    async fn generate_prompts(
        &self,
        subject: &SubjectInput,
        run_id: Uuid,
        prompts: &[&PromptTemplate],
        round: u32,
    ) -> Result<DatasetBatch, StoreError> {
        let phrase = subject_phrase(subject);
        let mut batch = DatasetBatch::default();

        for prompt in prompts {
            let image_id = candidate_id(&prompt.id, round);
            match self.render(subject, &phrase, prompt).await {
                Ok(bytes) => {
                    self.metrics.record_generation(prompt.lane, true);
                    let path = storage_path(run_id, &image_id);
                    let url = match self.blob.upload(&path, &bytes, "image/png").await {
                        Ok(url) => url,
                        Err(err) => {
                            warn!(
                                run_id = %run_id,
                                prompt_id = %prompt.id,
                                error = %err,
                                "Upload failed, dropping image"
                            );
                            batch.failed_prompts.push(prompt.id.clone());
                            continue;
                        }
                    };

                    let image =
                        CandidateImage::new(&image_id, run_id, prompt.lane, &prompt.id, path, url);
                    self.store.insert_image(&image).await?;
                    debug!(run_id = %run_id, image_id = %image_id, "Candidate stored");
                    batch.images.push(image);
                }
                Err(err) => {
                    self.metrics.record_generation(prompt.lane, false);
                    warn!(
                        run_id = %run_id,
                        prompt_id = %prompt.id,
                        lane = %prompt.lane,
                        error = %err,
                        "Prompt produced no image"
                    );
                    batch.failed_prompts.push(prompt.id.clone());
                }
            }
        }

        info!(
            run_id = %run_id,
            created = batch.images.len(),
            failed = batch.failed_prompts.len(),
            "Generation pass finished"
        );
        Ok(batch)
    }

    /// One prompt with retries. The lane delay follows every request.
    async fn render(
        &self,
        subject: &SubjectInput,
        phrase: &str,
        prompt: &PromptTemplate,
    ) -> Result<Vec<u8>, ServiceError> {
        let (generator, delay) = match prompt.lane {
            PromptLane::Primary => (&self.primary, self.primary_delay),
            PromptLane::Secondary => (&self.secondary, self.secondary_delay),
        };
        let request = GenerationRequest::new(prompt.render(phrase))
            .with_reference(subject.reference_image_url.clone());

        self.backoff
            .retry(&prompt.id, |_attempt| {
                let request = &request;
                async move {
                    let result = generator.generate(request).await;
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    result
                }
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_candidate_ids() {
        assert_eq!(candidate_id("portrait_front", 0), "portrait_front");
        assert_eq!(candidate_id("portrait_front", 1), "portrait_front_replacement");
        assert_eq!(candidate_id("portrait_front", 2), "portrait_front_replacement_2");
    }

    #[test]
    fn test_storage_path() {
        let run_id = Uuid::nil();
        assert_eq!(
            storage_path(run_id, "a_replacement"),
            "datasets/00000000-0000-0000-0000-000000000000/a_replacement.png"
        );
    }

    #[test]
    fn test_subject_phrase_prefers_description() {
        let subject = SubjectInput::new("s", "Ava", "woman", "u");
        assert_eq!(subject_phrase(&subject), "Ava, a woman");
        let described = subject.with_description("a woman with a silver bob");
        assert_eq!(subject_phrase(&described), "a woman with a silver bob");
    }
}
