//! Post-training validation.
//!
//! A trained adapter is exercised on a fixed battery of prompts that vary
//! pose, lighting and context. Each render is compared to the reference on
//! identity alone. The adapter passes when enough renders reach the
//! threshold.

use std::sync::Arc;

use tracing::{info, warn};

use crate::clients::{
    ComparisonFocus, EvaluationContext, GenerationRequest, ImageGenerator,
    VisionEvaluationService,
};
use crate::error::ServiceError;
use crate::metrics::MetricsCollector;
use crate::models::{AdapterRef, EvaluationDetail, PromptScore, SubjectInput, ValidationResult};
use crate::pipeline::PipelineConfig;
use crate::storage::BlobStorage;

/// Default battery. `{subject}` becomes the trigger word and gender tag.
pub const VALIDATION_PROMPTS: &[&str] = &[
    "photo of {subject}, close-up portrait, looking at camera, soft studio lighting",
    "photo of {subject}, side profile, dramatic rim lighting",
    "photo of {subject}, upper body, sitting in a cafe, natural window light",
    "photo of {subject}, full body, walking on a city street at night, neon lighting",
    "photo of {subject}, outdoors at golden hour, smiling, shallow depth of field",
    "photo of {subject}, three-quarter view, wearing a winter coat, snowy park",
];

pub struct Validator {
    generator: ImageGenerator,
    vision: Arc<dyn VisionEvaluationService>,
    blob: Arc<dyn BlobStorage>,
    prompts: Vec<String>,
    threshold: f64,
    min_passes: u32,
    metrics: MetricsCollector,
}

impl Validator {
    /// `generator` must be a backend that honors adapter downloads.
    pub fn new(
        generator: ImageGenerator,
        vision: Arc<dyn VisionEvaluationService>,
        blob: Arc<dyn BlobStorage>,
        config: &PipelineConfig,
    ) -> Self {
        Self {
            generator,
            vision,
            blob,
            prompts: VALIDATION_PROMPTS.iter().map(|p| p.to_string()).collect(),
            threshold: config.validation_threshold,
            min_passes: config.min_validation_passes,
            metrics: MetricsCollector::new(),
        }
    }

    /// Renders the battery with `adapter` and scores each render.
    ///
    /// Per-prompt failures are recorded as a zero score. Only a failure to
    /// fetch the reference image is returned as an error.
    pub async fn validate(
        &self,
        subject: &SubjectInput,
        adapter: &AdapterRef,
        attempt: u32,
    ) -> Result<ValidationResult, ServiceError> {
        let reference = self.blob.download(&subject.reference_image_url).await?;
        let phrase = format!("{} {}", subject.slug, subject.gender_tag);
        let context = EvaluationContext::new(&subject.name, ComparisonFocus::IdentityOnly);

        let mut results = Vec::with_capacity(self.prompts.len());
        for template in &self.prompts {
            let prompt = template.replace("{subject}", &phrase);
            let score = match self.score_prompt(&reference, &prompt, adapter, &context).await {
                Ok(score) => PromptScore {
                    passed: score >= self.threshold,
                    prompt,
                    score,
                    error: None,
                },
                Err(err) => {
                    warn!(subject = %subject.slug, attempt = attempt, error = %err, "Validation render failed");
                    PromptScore::failed(prompt, err.to_string())
                }
            };
            results.push(score);
        }

        let result = ValidationResult::from_scores(attempt, results, self.min_passes);
        self.metrics.record_validation(result.mean_score);
        info!(
            subject = %subject.slug,
            attempt = attempt,
            passes = result.pass_count,
            required = self.min_passes,
            mean_score = result.mean_score,
            overall_pass = result.overall_pass,
            "Validation finished"
        );
        Ok(result)
    }

    async fn score_prompt(
        &self,
        reference: &[u8],
        prompt: &str,
        adapter: &AdapterRef,
        context: &EvaluationContext,
    ) -> Result<f64, ServiceError> {
        let request = GenerationRequest::new(prompt).with_adapter(adapter.clone());
        let rendered = self.generator.generate(&request).await?;
        let comparison = self
            .vision
            .compare(reference, &rendered, &context.clone().with_prompt(prompt))
            .await?;

        Ok(comparison
            .subscores
            .get(EvaluationDetail::IDENTITY)
            .copied()
            .filter(|v| v.is_finite())
            .unwrap_or(0.0))
    }
}
