//! Domain types shared by every pipeline stage.
//!
//! - [`PipelineRun`] and [`RunStatus`]: one end-to-end attempt at producing an
//!   adapter for a subject.
//! - [`CandidateImage`] and [`EvaluationDetail`]: generated training images and
//!   their scoring state.
//! - [`TrainingArtifact`] and [`ValidationResult`]: what training and
//!   validation produce.

mod artifact;
mod image;
mod run;

pub use artifact::{AdapterRef, PromptScore, TrainingArtifact, ValidationResult};
pub use image::{
    CandidateImage, EvalStatus, EvaluationDetail, ImageCounts, ImageQuery, Verdict,
};
pub use run::{short_run_id, slugify, PipelineRun, RunStatus, SubjectInput};
