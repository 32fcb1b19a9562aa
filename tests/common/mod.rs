//! Scripted services and a wired orchestrator for pipeline tests.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use persona_forge::catalog::{PromptCatalog, PromptLane, PromptTemplate};
use persona_forge::clients::{
    ComparisonFocus, EvaluationContext, GenerationRequest, ImageGenerationService, JobHandle,
    JobPoll, Submission, TrainingJobStatus, TrainingService, TrainingState, VisionComparison,
    VisionEvaluationService,
};
use persona_forge::dataset::storage_path;
use persona_forge::models::{
    CandidateImage, EvalStatus, EvaluationDetail, PipelineRun, SubjectInput,
};
use persona_forge::pipeline::{PipelineConfig, PipelineOrchestrator, PipelineServices};
use persona_forge::storage::{BlobStorage, LocalBlobStorage, SqliteStatusStore, StatusStore};
use persona_forge::training::TrainingParams;
use persona_forge::ServiceError;
use tempfile::TempDir;
use uuid::Uuid;

pub const REFERENCE_PATH: &str = "references/ava.png";

/// Echoes the prompt (and adapter filenames) back as image bytes.
#[derive(Default)]
pub struct FakeGenerator {
    failing: Mutex<Vec<String>>,
    dataset_calls: AtomicUsize,
    validation_calls: AtomicUsize,
}

impl FakeGenerator {
    /// Prompts containing `fragment` fail permanently.
    pub fn fail_prompts_containing(&self, fragment: &str) {
        self.failing.lock().unwrap().push(fragment.to_string());
    }

    pub fn dataset_calls(&self) -> usize {
        self.dataset_calls.load(Ordering::SeqCst)
    }

    pub fn validation_calls(&self) -> usize {
        self.validation_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ImageGenerationService for FakeGenerator {
    fn name(&self) -> &str {
        "fake"
    }

    async fn submit(&self, request: &GenerationRequest) -> Result<Submission, ServiceError> {
        if request.adapters.is_empty() {
            self.dataset_calls.fetch_add(1, Ordering::SeqCst);
        } else {
            self.validation_calls.fetch_add(1, Ordering::SeqCst);
        }

        if self
            .failing
            .lock()
            .unwrap()
            .iter()
            .any(|f| request.prompt.contains(f.as_str()))
        {
            return Err(ServiceError::Api {
                code: 400,
                message: "content policy".into(),
            });
        }

        let adapters: Vec<&str> = request.adapters.iter().map(|a| a.filename.as_str()).collect();
        Ok(Submission::Image(
            format!("{}|{}", request.prompt, adapters.join(",")).into_bytes(),
        ))
    }

    async fn poll(&self, _handle: &JobHandle) -> Result<JobPoll, ServiceError> {
        Ok(JobPoll::Pending)
    }
}

/// Sub-scores `[identity, structure, technical]` for a candidate.
///
/// The rule sees the comparison focus, the candidate text and how many times
/// the same text was scored before.
pub type ScoreRule = dyn Fn(ComparisonFocus, &str, u32) -> [f64; 3] + Send + Sync;

pub struct FakeVision {
    rule: Box<ScoreRule>,
    seen: Mutex<HashMap<String, u32>>,
    calls: AtomicUsize,
}

impl FakeVision {
    pub fn new(rule: impl Fn(ComparisonFocus, &str, u32) -> [f64; 3] + Send + Sync + 'static) -> Self {
        Self {
            rule: Box::new(rule),
            seen: Mutex::new(HashMap::new()),
            calls: AtomicUsize::new(0),
        }
    }

    /// Everything scores 9.
    pub fn approving() -> Self {
        Self::new(|_, _, _| [9.0, 9.0, 9.0])
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl VisionEvaluationService for FakeVision {
    async fn compare(
        &self,
        _reference: &[u8],
        candidate: &[u8],
        context: &EvaluationContext,
    ) -> Result<VisionComparison, ServiceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let text = String::from_utf8_lossy(candidate).to_string();
        let nth = {
            let mut seen = self.seen.lock().unwrap();
            let count = seen.entry(text.clone()).or_insert(0);
            let nth = *count;
            *count += 1;
            nth
        };

        let [identity, structure, technical] = (self.rule)(context.focus, &text, nth);
        let mut subscores = std::collections::BTreeMap::new();
        subscores.insert(EvaluationDetail::IDENTITY.to_string(), identity);
        subscores.insert(EvaluationDetail::STRUCTURE.to_string(), structure);
        subscores.insert(EvaluationDetail::TECHNICAL.to_string(), technical);
        Ok(VisionComparison {
            subscores,
            verdict: None,
        })
    }
}

/// Training jobs finish on the first status poll with a scripted outcome.
#[derive(Default)]
pub struct FakeTraining {
    outcomes: Mutex<VecDeque<TrainingState>>,
    jobs: Mutex<HashMap<String, TrainingJobStatus>>,
    submissions: Mutex<Vec<(String, TrainingParams)>>,
    status_calls: AtomicUsize,
}

impl FakeTraining {
    /// Final states for the next submissions, in order. Unscripted jobs succeed.
    pub fn script(&self, outcomes: impl IntoIterator<Item = TrainingState>) {
        self.outcomes.lock().unwrap().extend(outcomes);
    }

    /// Registers a job that was submitted before the test started.
    pub fn seed_job(&self, job_id: &str, status: TrainingJobStatus) {
        self.jobs.lock().unwrap().insert(job_id.to_string(), status);
    }

    pub fn submissions(&self) -> Vec<(String, TrainingParams)> {
        self.submissions.lock().unwrap().clone()
    }

    pub fn status_calls(&self) -> usize {
        self.status_calls.load(Ordering::SeqCst)
    }
}

pub fn artifact_url(job_id: &str) -> String {
    format!("https://trainer.example/artifacts/{}.safetensors", job_id)
}

#[async_trait]
impl TrainingService for FakeTraining {
    async fn submit_training(
        &self,
        dataset_url: &str,
        params: &TrainingParams,
    ) -> Result<String, ServiceError> {
        let mut submissions = self.submissions.lock().unwrap();
        submissions.push((dataset_url.to_string(), params.clone()));
        let job_id = format!("job-{}", submissions.len());

        let state = self
            .outcomes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(TrainingState::Succeeded);
        let status = match state {
            TrainingState::Succeeded => TrainingJobStatus::succeeded(artifact_url(&job_id)),
            TrainingState::Failed => TrainingJobStatus::failed("loss diverged"),
            other => TrainingJobStatus::pending(other),
        };
        self.jobs.lock().unwrap().insert(job_id.clone(), status);
        Ok(job_id)
    }

    async fn get_training_status(&self, job_id: &str) -> Result<TrainingJobStatus, ServiceError> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        self.jobs
            .lock()
            .unwrap()
            .get(job_id)
            .cloned()
            .ok_or_else(|| ServiceError::Api {
                code: 404,
                message: format!("unknown job {}", job_id),
            })
    }

    async fn download_artifact(&self, url: &str) -> Result<Vec<u8>, ServiceError> {
        Ok(format!("weights from {}", url).into_bytes())
    }
}

/// Ten prompts: six on the primary lane, four on the secondary lane.
pub fn small_catalog() -> PromptCatalog {
    let mut prompts = Vec::new();
    for i in 0..6 {
        prompts.push(PromptTemplate::new(
            format!("portrait_{}", i),
            PromptLane::Primary,
            "portrait",
            format!("portrait {} of {{subject}}, studio lighting", i),
        ));
    }
    for i in 0..4 {
        prompts.push(PromptTemplate::new(
            format!("full_body_{}", i),
            PromptLane::Secondary,
            "full_body",
            format!("full body shot {} of {{subject}} outdoors", i),
        ));
    }
    PromptCatalog::new(prompts).unwrap()
}

/// Target 10, floor 6, no sleeps, three training attempts.
pub fn test_config() -> PipelineConfig {
    PipelineConfig::default()
        .without_delays()
        .with_target_passed_images(10)
        .with_min_passed_images(6)
        .with_training_poll(Duration::ZERO, 3)
        .with_database_url("sqlite::memory:")
}

pub struct Harness {
    pub orchestrator: Arc<PipelineOrchestrator>,
    pub store: Arc<SqliteStatusStore>,
    pub blob: Arc<LocalBlobStorage>,
    pub generator: Arc<FakeGenerator>,
    pub vision: Arc<FakeVision>,
    pub training: Arc<FakeTraining>,
    pub subject: SubjectInput,
    _dir: TempDir,
}

impl Harness {
    pub async fn new(vision: FakeVision) -> Self {
        Self::with_config(vision, test_config()).await
    }

    pub async fn with_config(vision: FakeVision, config: PipelineConfig) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SqliteStatusStore::in_memory().await.unwrap());
        let blob = Arc::new(LocalBlobStorage::with_file_urls(dir.path()));
        let reference_url = blob
            .upload(REFERENCE_PATH, b"reference face", "image/png")
            .await
            .unwrap();

        let generator = Arc::new(FakeGenerator::default());
        let vision = Arc::new(vision);
        let training = Arc::new(FakeTraining::default());
        let services = PipelineServices {
            primary_generation: generator.clone(),
            secondary_generation: generator.clone(),
            vision: vision.clone(),
            training: training.clone(),
        };

        let orchestrator = PipelineOrchestrator::new(
            config,
            store.clone(),
            blob.clone(),
            Arc::new(small_catalog()),
            services,
        )
        .unwrap();

        let subject = SubjectInput::new("subject-42", "Ava Stone", "woman", reference_url);

        Self {
            orchestrator: Arc::new(orchestrator),
            store,
            blob,
            generator,
            vision,
            training,
            subject,
            _dir: dir,
        }
    }

    /// Creates a pending run row for the harness subject.
    pub async fn create_run(&self) -> Uuid {
        let run = PipelineRun::new(Uuid::new_v4(), self.subject.clone());
        self.store.create_run(&run).await.unwrap();
        run.id
    }

    /// Stores `count` evaluated images as if generation and scoring had run.
    pub async fn seed_images(&self, run_id: Uuid, count: usize, status: EvalStatus) {
        let catalog = small_catalog();
        for prompt in catalog.prompts().iter().take(count) {
            let path = storage_path(run_id, &prompt.id);
            let url = self
                .blob
                .upload(&path, prompt.text.as_bytes(), "image/png")
                .await
                .unwrap();
            let image = CandidateImage::new(&prompt.id, run_id, prompt.lane, &prompt.id, path, url);
            self.store.insert_image(&image).await.unwrap();

            let score = if status == EvalStatus::Passed { 9.0 } else { 3.0 };
            let mut subscores = std::collections::BTreeMap::new();
            subscores.insert(EvaluationDetail::IDENTITY.to_string(), score);
            subscores.insert(EvaluationDetail::STRUCTURE.to_string(), score);
            subscores.insert(EvaluationDetail::TECHNICAL.to_string(), score);
            let detail = EvaluationDetail::from_subscores(&subscores, None, 7.0);
            self.store
                .update_image_evaluation(run_id, &prompt.id, status, &detail)
                .await
                .unwrap();
        }
    }

    /// Like [`Harness::seed_images`] but stores real, poorly compressible PNGs.
    pub async fn seed_png_images(&self, run_id: Uuid, count: usize) {
        self.seed_images(run_id, count, EvalStatus::Passed).await;
        for (i, image) in self.store.list_images(run_id).await.unwrap().iter().enumerate() {
            self.blob
                .upload(&image.storage_path, &noise_png(192, 192, i as u32 + 1), "image/png")
                .await
                .unwrap();
        }
    }
}

/// PNG of deterministic noise.
pub fn noise_png(width: u32, height: u32, seed: u32) -> Vec<u8> {
    let mut state = seed.wrapping_mul(2_654_435_761).max(1);
    let image = image::RgbImage::from_fn(width, height, |_, _| {
        let mut next = || {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            (state & 0xff) as u8
        };
        image::Rgb([next(), next(), next()])
    });
    let mut bytes = std::io::Cursor::new(Vec::new());
    image.write_to(&mut bytes, image::ImageFormat::Png).unwrap();
    bytes.into_inner()
}
