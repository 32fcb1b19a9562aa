//! Clients for the three external services the pipeline drives.
//!
//! Each service sits behind an `async_trait` so components take
//! `Arc<dyn Trait>` values and tests can substitute scripted fakes:
//!
//! - [`ImageGenerationService`]: prompt + references + adapters in, image out,
//!   either synchronously or through a job that is polled.
//! - [`VisionEvaluationService`]: compares a candidate image to the reference
//!   and returns numeric sub-scores.
//! - [`TrainingService`]: submits a packaged dataset, reports job status,
//!   downloads the trained adapter.

pub mod generation;
mod http;
pub mod training;
pub mod vision;

pub use generation::{
    GenerationRequest, HostedGenerationClient, HostedGenerationConfig, ImageGenerationService,
    ImageGenerator, JobHandle, JobPoll, ServerlessGenerationClient, ServerlessGenerationConfig,
    Submission,
};
pub use http::mask_key;
pub use training::{
    HttpTrainingClient, HttpTrainingConfig, TrainingJobStatus, TrainingService, TrainingState,
};
pub use vision::{
    ChatVisionClient, ChatVisionConfig, ComparisonFocus, EvaluationContext, VisionComparison,
    VisionEvaluationService,
};
