//! persona-forge: identity adapter pipeline.
//!
//! This library turns one approved reference image into a trained and
//! deployed identity adapter: it generates a training set, screens it with
//! a vision model, captions it, trains, validates and publishes the result.

// Core modules
pub mod captioning;
pub mod catalog;
pub mod cli;
pub mod clients;
pub mod dataset;
pub mod deploy;
pub mod error;
pub mod evaluation;
pub mod metrics;
pub mod models;
pub mod pipeline;
pub mod scheduler;
pub mod storage;
pub mod training;
pub mod utils;
pub mod validation;

// Re-export commonly used error types
pub use error::{BlobError, DeployError, EvaluationError, ServiceError, StoreError, TrainingError};
