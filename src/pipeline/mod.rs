//! Pipeline orchestration for adapter production.
//!
//! - [`PipelineOrchestrator`] drives a single run through dataset
//!   generation, evaluation with replacement rounds, captioning, training
//!   with retries, validation and deployment.
//! - [`Resumer`] re-enters interrupted runs at the furthest stage their
//!   persisted state supports.
//! - [`PipelineConfig`] holds every threshold and delay, with `PERSONA_*`
//!   environment overrides.
//!
//! # Example
//!
//! ```rust,ignore
//! use persona_forge::pipeline::{PipelineConfig, PipelineOrchestrator, PipelineServices};
//!
//! let config = PipelineConfig::from_env()?;
//! let orchestrator = PipelineOrchestrator::new(
//!     config,
//!     store,
//!     blob,
//!     Arc::new(PromptCatalog::builtin()),
//!     PipelineServices::from_env()?,
//! )?;
//!
//! store.create_run(&PipelineRun::new(run_id, subject.clone())).await?;
//! let status = orchestrator.run(&subject, run_id).await;
//! ```

pub mod config;
pub mod orchestrator;
pub mod resume;

pub use config::{ConfigError, PipelineConfig};
pub use orchestrator::{PipelineError, PipelineOrchestrator, PipelineServices, StageEntry};
pub use resume::{ResumeOutcome, ResumePlan, Resumer};
