//! Quality evaluation of generated candidates.
//!
//! Candidates are scored against the reference image in fixed-size batches.
//! Every call in a batch runs concurrently and the next batch starts only
//! after all of them settle. The persisted status is derived from the
//! sub-scores alone; whatever verdict the vision service reports is kept for
//! audit.

use std::sync::Arc;

use futures::future::join_all;
use tracing::{debug, info, warn};

use crate::catalog::PromptCatalog;
use crate::dataset::subject_phrase;
use crate::clients::{ComparisonFocus, EvaluationContext, VisionEvaluationService};
use crate::error::{EvaluationError, ServiceError};
use crate::metrics::{self, MetricsCollector};
use crate::models::{CandidateImage, EvalStatus, EvaluationDetail, SubjectInput};
use crate::pipeline::PipelineConfig;
use crate::storage::{BlobStorage, StatusStore};

/// Candidates split by their persisted status after evaluation.
#[derive(Debug, Default)]
pub struct EvaluationOutcome {
    pub passed: Vec<CandidateImage>,
    pub failed: Vec<CandidateImage>,
}

pub struct QualityEvaluator {
    vision: Arc<dyn VisionEvaluationService>,
    blob: Arc<dyn BlobStorage>,
    store: Arc<dyn StatusStore>,
    catalog: Option<Arc<PromptCatalog>>,
    batch_size: usize,
    min_score: f64,
    metrics: MetricsCollector,
}

impl QualityEvaluator {
    pub fn new(
        vision: Arc<dyn VisionEvaluationService>,
        blob: Arc<dyn BlobStorage>,
        store: Arc<dyn StatusStore>,
        config: &PipelineConfig,
    ) -> Self {
        Self {
            vision,
            blob,
            store,
            catalog: None,
            batch_size: config.eval_batch_size.max(1),
            min_score: config.min_eval_score,
            metrics: MetricsCollector::new(),
        }
    }

    /// Lets the evaluator tell the vision service which prompt a candidate came from.
    pub fn with_catalog(mut self, catalog: Arc<PromptCatalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    pub fn min_score(&self) -> f64 {
        self.min_score
    }

    /// Scores `candidates` against the subject's reference and persists every result.
    pub async fn evaluate(
        &self,
        subject: &SubjectInput,
        candidates: Vec<CandidateImage>,
    ) -> Result<EvaluationOutcome, EvaluationError> {
        let mut outcome = EvaluationOutcome::default();
        if candidates.is_empty() {
            return Ok(outcome);
        }

        let reference = self
            .blob
            .download(&subject.reference_image_url)
            .await
            .map_err(EvaluationError::Reference)?;

        info!(
            candidates = candidates.len(),
            batch_size = self.batch_size,
            "Evaluating candidates"
        );

        let phrase = subject_phrase(subject);
        for batch in candidates.chunks(self.batch_size) {
            let details = join_all(
                batch
                    .iter()
                    .map(|candidate| {
                        self.score_one(&subject.name, &phrase, &reference, candidate)
                    }),
            )
            .await;

            for (candidate, detail) in batch.iter().zip(details) {
                let status = if detail.passed() {
                    EvalStatus::Passed
                } else {
                    EvalStatus::Failed
                };
                self.store
                    .update_image_evaluation(candidate.run_id, &candidate.id, status, &detail)
                    .await?;
                self.record(&detail);

                let mut image = candidate.clone();
                image.status = status;
                image.score = Some(detail.score());
                image.evaluation = Some(detail);

                match status {
                    EvalStatus::Passed => outcome.passed.push(image),
                    _ => outcome.failed.push(image),
                }
            }
        }

        info!(
            passed = outcome.passed.len(),
            failed = outcome.failed.len(),
            "Evaluation pass finished"
        );
        Ok(outcome)
    }

    /// Never fails: errors turn into a zero-score detail.
    async fn score_one(
        &self,
        subject_name: &str,
        phrase: &str,
        reference: &[u8],
        candidate: &CandidateImage,
    ) -> EvaluationDetail {
        match self.compare(subject_name, phrase, reference, candidate).await {
            Ok(detail) => {
                debug!(
                    image_id = %candidate.id,
                    identity = detail.identity,
                    structure = detail.structure,
                    technical = detail.technical,
                    verdict = ?detail.verdict,
                    "Candidate scored"
                );
                detail
            }
            Err(err) => {
                warn!(image_id = %candidate.id, error = %err, "Evaluation failed");
                EvaluationDetail::errored(err.to_string())
            }
        }
    }

    async fn compare(
        &self,
        subject_name: &str,
        phrase: &str,
        reference: &[u8],
        candidate: &CandidateImage,
    ) -> Result<EvaluationDetail, ServiceError> {
        let bytes = self.blob.download(&candidate.storage_path).await?;

        let mut context = EvaluationContext::new(subject_name, ComparisonFocus::FullRubric);
        if let Some(prompt) = self
            .catalog
            .as_ref()
            .and_then(|catalog| catalog.get(&candidate.prompt_id))
        {
            context = context.with_prompt(prompt.render(phrase));
        }

        let comparison = self.vision.compare(reference, &bytes, &context).await?;
        Ok(EvaluationDetail::from_subscores(
            &comparison.subscores,
            comparison.verdict,
            self.min_score,
        ))
    }

    fn record(&self, detail: &EvaluationDetail) {
        let outcome = if detail.error.is_some() {
            metrics::EvaluationOutcome::Error
        } else if detail.passed() {
            metrics::EvaluationOutcome::Passed
        } else {
            metrics::EvaluationOutcome::BelowThreshold
        };
        self.metrics.record_evaluation(outcome, detail.score());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{PromptLane, PromptTemplate};
    use crate::clients::VisionComparison;
    use crate::storage::{LocalBlobStorage, SqliteStatusStore};
    use crate::models::{PipelineRun, SubjectInput};
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use uuid::Uuid;

    /// Scores by candidate bytes: the first byte is used for every sub-score,
    /// except 0xFF which errors.
    struct ByteScorer {
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    #[async_trait]
    impl VisionEvaluationService for ByteScorer {
        async fn compare(
            &self,
            _reference: &[u8],
            candidate: &[u8],
            _context: &EvaluationContext,
        ) -> Result<VisionComparison, ServiceError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::task::yield_now().await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            let value = candidate[0];
            if value == 0xFF {
                return Err(ServiceError::InvalidResponse("no scores".into()));
            }
            let mut subscores = BTreeMap::new();
            subscores.insert("identity".to_string(), value as f64);
            subscores.insert("structure".to_string(), value as f64);
            subscores.insert("technical".to_string(), 6.0_f64.max(value as f64 - 2.0));
            Ok(VisionComparison {
                subscores,
                verdict: Some("PASS".to_string()),
            })
        }
    }

    #[tokio::test]
    async fn test_batches_and_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let blob = Arc::new(LocalBlobStorage::with_file_urls(dir.path()));
        let store = Arc::new(SqliteStatusStore::in_memory().await.unwrap());
        let run_id = Uuid::new_v4();
        let subject = SubjectInput::new("s1", "Ava", "woman", "reference.png");
        store
            .create_run(&PipelineRun::new(run_id, subject.clone()))
            .await
            .unwrap();
        blob.upload("reference.png", &[1], "image/png").await.unwrap();

        // 10 → all ≥ 7 → pass; 8 → technical 6 → fail despite PASS verdict;
        // 0xFF → error.
        let values = [10u8, 8, 0xFF, 10, 10];
        let mut candidates = Vec::new();
        for (i, value) in values.iter().enumerate() {
            let path = format!("datasets/{}/img{}.png", run_id, i);
            let url = blob.upload(&path, &[*value], "image/png").await.unwrap();
            let image = CandidateImage::new(
                format!("img{}", i),
                run_id,
                PromptLane::Primary,
                format!("p{}", i),
                path,
                url,
            );
            store.insert_image(&image).await.unwrap();
            candidates.push(image);
        }

        let scorer = Arc::new(ByteScorer {
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        });
        let config = PipelineConfig::default().with_eval_batch_size(2);
        let evaluator = QualityEvaluator::new(scorer.clone(), blob, store.clone(), &config);

        let outcome = evaluator
            .evaluate(&subject, candidates)
            .await
            .unwrap();

        let passed: Vec<_> = outcome.passed.iter().map(|i| i.id.as_str()).collect();
        let failed: Vec<_> = outcome.failed.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(passed, vec!["img0", "img3", "img4"]);
        assert_eq!(failed, vec!["img1", "img2"]);
        assert!(scorer.max_in_flight.load(Ordering::SeqCst) <= 2);

        let errored = store.get_image(run_id, "img2").await.unwrap();
        assert_eq!(errored.status, EvalStatus::Failed);
        let detail = errored.evaluation.unwrap();
        assert!(detail.error.unwrap().contains("no scores"));
        assert_eq!(detail.identity, 0.0);

        let low = store.get_image(run_id, "img1").await.unwrap();
        let detail = low.evaluation.unwrap();
        assert_eq!(detail.reported_verdict.as_deref(), Some("PASS"));
        assert!(!detail.passed());
    }

    #[tokio::test]
    async fn test_missing_reference_fails_pass() {
        let dir = tempfile::tempdir().unwrap();
        let blob = Arc::new(LocalBlobStorage::with_file_urls(dir.path()));
        let store = Arc::new(SqliteStatusStore::in_memory().await.unwrap());
        let scorer = Arc::new(ByteScorer {
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        });
        let evaluator =
            QualityEvaluator::new(scorer, blob, store, &PipelineConfig::default());

        let subject = SubjectInput::new("s1", "Ava", "woman", "missing.png");
        let image = CandidateImage::new(
            "a",
            Uuid::new_v4(),
            PromptLane::Primary,
            "p",
            "datasets/x/a.png",
            "file:///a.png",
        );
        assert!(matches!(
            evaluator.evaluate(&subject, vec![image]).await,
            Err(EvaluationError::Reference(_))
        ));
    }

    /// Remembers the context of every comparison.
    #[derive(Default)]
    struct ContextRecorder {
        seen: std::sync::Mutex<Vec<EvaluationContext>>,
    }

    #[async_trait]
    impl VisionEvaluationService for ContextRecorder {
        async fn compare(
            &self,
            _reference: &[u8],
            _candidate: &[u8],
            context: &EvaluationContext,
        ) -> Result<VisionComparison, ServiceError> {
            self.seen.lock().unwrap().push(context.clone());
            let mut subscores = BTreeMap::new();
            subscores.insert("identity".to_string(), 9.0);
            Ok(VisionComparison {
                subscores,
                verdict: None,
            })
        }
    }

    #[tokio::test]
    async fn test_context_prompt_matches_generation_prompt() {
        let dir = tempfile::tempdir().unwrap();
        let blob = Arc::new(LocalBlobStorage::with_file_urls(dir.path()));
        let store = Arc::new(SqliteStatusStore::in_memory().await.unwrap());
        let run_id = Uuid::new_v4();
        let subject = SubjectInput::new("s1", "Ava", "woman", "reference.png")
            .with_description("a woman with a silver bob");
        store
            .create_run(&PipelineRun::new(run_id, subject.clone()))
            .await
            .unwrap();
        blob.upload("reference.png", &[1], "image/png").await.unwrap();

        let template = PromptTemplate::new(
            "portrait_01",
            PromptLane::Primary,
            "portrait",
            "close-up portrait of {subject}, soft light",
        );
        let catalog = Arc::new(PromptCatalog::new(vec![template.clone()]).unwrap());

        let path = format!("datasets/{}/portrait_01.png", run_id);
        let url = blob.upload(&path, &[9], "image/png").await.unwrap();
        let image = CandidateImage::new(
            "portrait_01",
            run_id,
            PromptLane::Primary,
            "portrait_01",
            path,
            url,
        );
        store.insert_image(&image).await.unwrap();

        let recorder = Arc::new(ContextRecorder::default());
        let evaluator =
            QualityEvaluator::new(recorder.clone(), blob, store, &PipelineConfig::default())
                .with_catalog(catalog);
        evaluator.evaluate(&subject, vec![image]).await.unwrap();

        let seen = recorder.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].subject_name, "Ava");
        assert_eq!(
            seen[0].prompt.as_deref(),
            Some(template.render(&subject_phrase(&subject)).as_str())
        );
        assert_eq!(
            seen[0].prompt.as_deref(),
            Some("close-up portrait of a woman with a silver bob, soft light")
        );
    }
}
