//! Pipeline configuration.
//!
//! Every threshold, loop bound and delay the pipeline uses lives here, with
//! defaults, builder methods and `PERSONA_*` environment overrides.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::catalog::PromptLane;
use crate::utils::{BackoffPolicy, DelayStrategy, PollPolicy};

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    // Dataset generation
    /// Passed images the replacement loop aims for.
    pub target_passed_images: u32,
    /// Hard floor below which the run fails with insufficient training data.
    pub min_passed_images: u32,
    pub max_replacement_rounds: u32,
    /// Attempts per prompt, including the first.
    pub generation_max_attempts: u32,
    /// Backoff unit; attempt `n` waits `n ×` this.
    pub generation_retry_base_delay: Duration,
    /// Pause after every primary-lane request.
    pub primary_lane_delay: Duration,
    /// Pause after every secondary-lane request.
    pub secondary_lane_delay: Duration,
    pub render_poll_interval: Duration,
    pub render_max_polls: u32,

    // Evaluation
    /// Concurrent vision calls per batch.
    pub eval_batch_size: usize,
    /// Every sub-score must reach this (0-10).
    pub min_eval_score: f64,

    // Training
    pub max_training_attempts: u32,
    pub training_poll_interval: Duration,
    pub training_max_polls: u32,
    /// Upload limit for the packaged dataset.
    pub max_archive_bytes: u64,

    // Validation
    /// Identity score a validation render must reach (0-10).
    pub validation_threshold: f64,
    pub min_validation_passes: u32,

    // Storage
    pub database_url: String,
    pub blob_root: PathBuf,
    /// Public URL prefix for local blobs. `file://` URLs when unset.
    pub blob_base_url: Option<String>,
    /// YAML prompt catalog. The built-in catalog when unset.
    pub catalog_path: Option<PathBuf>,

    // Scheduling
    pub max_concurrent_runs: usize,
    /// Non-terminal runs untouched for this long are considered stalled.
    pub stale_after: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            target_passed_images: 25,
            min_passed_images: 20,
            max_replacement_rounds: 2,
            generation_max_attempts: 3,
            generation_retry_base_delay: Duration::from_secs(5),
            primary_lane_delay: Duration::from_secs(3),
            secondary_lane_delay: Duration::from_secs(1),
            render_poll_interval: Duration::from_secs(3),
            render_max_polls: 100,

            eval_batch_size: 3,
            min_eval_score: 7.0,

            max_training_attempts: 3,
            training_poll_interval: Duration::from_secs(10),
            training_max_polls: 180, // 30 minutes
            max_archive_bytes: 50 * 1024 * 1024,

            validation_threshold: 7.0,
            min_validation_passes: 5,

            database_url: "persona-forge.db".to_string(),
            blob_root: PathBuf::from("./blobs"),
            blob_base_url: None,
            catalog_path: None,

            max_concurrent_runs: 2,
            stale_after: Duration::from_secs(30 * 60),
        }
    }
}

impl PipelineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `PERSONA_TARGET_PASSED_IMAGES` (default: 25)
    /// - `PERSONA_MIN_PASSED_IMAGES` (default: 20)
    /// - `PERSONA_MAX_REPLACEMENT_ROUNDS` (default: 2)
    /// - `PERSONA_GENERATION_MAX_ATTEMPTS` (default: 3)
    /// - `PERSONA_GENERATION_RETRY_DELAY_SECS` (default: 5)
    /// - `PERSONA_PRIMARY_LANE_DELAY_MS` (default: 3000)
    /// - `PERSONA_SECONDARY_LANE_DELAY_MS` (default: 1000)
    /// - `PERSONA_EVAL_BATCH_SIZE` (default: 3)
    /// - `PERSONA_MIN_EVAL_SCORE` (default: 7.0)
    /// - `PERSONA_MAX_TRAINING_ATTEMPTS` (default: 3)
    /// - `PERSONA_TRAINING_POLL_SECS` (default: 10)
    /// - `PERSONA_TRAINING_MAX_POLLS` (default: 180)
    /// - `PERSONA_MAX_ARCHIVE_BYTES` (default: 52428800)
    /// - `PERSONA_VALIDATION_THRESHOLD` (default: 7.0)
    /// - `PERSONA_MIN_VALIDATION_PASSES` (default: 5)
    /// - `PERSONA_DATABASE_URL` (default: persona-forge.db)
    /// - `PERSONA_BLOB_ROOT` (default: ./blobs)
    /// - `PERSONA_BLOB_BASE_URL`
    /// - `PERSONA_CATALOG_PATH`
    /// - `PERSONA_MAX_CONCURRENT_RUNS` (default: 2)
    /// - `PERSONA_STALE_MINUTES` (default: 30)
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(val) = env("PERSONA_TARGET_PASSED_IMAGES") {
            config.target_passed_images = parse_env_value(&val, "PERSONA_TARGET_PASSED_IMAGES")?;
        }
        if let Some(val) = env("PERSONA_MIN_PASSED_IMAGES") {
            config.min_passed_images = parse_env_value(&val, "PERSONA_MIN_PASSED_IMAGES")?;
        }
        if let Some(val) = env("PERSONA_MAX_REPLACEMENT_ROUNDS") {
            config.max_replacement_rounds =
                parse_env_value(&val, "PERSONA_MAX_REPLACEMENT_ROUNDS")?;
        }
        if let Some(val) = env("PERSONA_GENERATION_MAX_ATTEMPTS") {
            config.generation_max_attempts =
                parse_env_value(&val, "PERSONA_GENERATION_MAX_ATTEMPTS")?;
        }
        if let Some(val) = env("PERSONA_GENERATION_RETRY_DELAY_SECS") {
            let secs: u64 = parse_env_value(&val, "PERSONA_GENERATION_RETRY_DELAY_SECS")?;
            config.generation_retry_base_delay = Duration::from_secs(secs);
        }
        if let Some(val) = env("PERSONA_PRIMARY_LANE_DELAY_MS") {
            let ms: u64 = parse_env_value(&val, "PERSONA_PRIMARY_LANE_DELAY_MS")?;
            config.primary_lane_delay = Duration::from_millis(ms);
        }
        if let Some(val) = env("PERSONA_SECONDARY_LANE_DELAY_MS") {
            let ms: u64 = parse_env_value(&val, "PERSONA_SECONDARY_LANE_DELAY_MS")?;
            config.secondary_lane_delay = Duration::from_millis(ms);
        }

        if let Some(val) = env("PERSONA_EVAL_BATCH_SIZE") {
            config.eval_batch_size = parse_env_value(&val, "PERSONA_EVAL_BATCH_SIZE")?;
        }
        if let Some(val) = env("PERSONA_MIN_EVAL_SCORE") {
            config.min_eval_score = parse_env_value(&val, "PERSONA_MIN_EVAL_SCORE")?;
        }

        if let Some(val) = env("PERSONA_MAX_TRAINING_ATTEMPTS") {
            config.max_training_attempts = parse_env_value(&val, "PERSONA_MAX_TRAINING_ATTEMPTS")?;
        }
        if let Some(val) = env("PERSONA_TRAINING_POLL_SECS") {
            let secs: u64 = parse_env_value(&val, "PERSONA_TRAINING_POLL_SECS")?;
            config.training_poll_interval = Duration::from_secs(secs);
        }
        if let Some(val) = env("PERSONA_TRAINING_MAX_POLLS") {
            config.training_max_polls = parse_env_value(&val, "PERSONA_TRAINING_MAX_POLLS")?;
        }
        if let Some(val) = env("PERSONA_MAX_ARCHIVE_BYTES") {
            config.max_archive_bytes = parse_env_value(&val, "PERSONA_MAX_ARCHIVE_BYTES")?;
        }

        if let Some(val) = env("PERSONA_VALIDATION_THRESHOLD") {
            config.validation_threshold = parse_env_value(&val, "PERSONA_VALIDATION_THRESHOLD")?;
        }
        if let Some(val) = env("PERSONA_MIN_VALIDATION_PASSES") {
            config.min_validation_passes = parse_env_value(&val, "PERSONA_MIN_VALIDATION_PASSES")?;
        }

        if let Some(val) = env("PERSONA_DATABASE_URL") {
            config.database_url = val;
        }
        if let Some(val) = env("PERSONA_BLOB_ROOT") {
            config.blob_root = PathBuf::from(val);
        }
        if let Some(val) = env("PERSONA_BLOB_BASE_URL") {
            config.blob_base_url = Some(val);
        }
        if let Some(val) = env("PERSONA_CATALOG_PATH") {
            config.catalog_path = Some(PathBuf::from(val));
        }

        if let Some(val) = env("PERSONA_MAX_CONCURRENT_RUNS") {
            config.max_concurrent_runs = parse_env_value(&val, "PERSONA_MAX_CONCURRENT_RUNS")?;
        }
        if let Some(val) = env("PERSONA_STALE_MINUTES") {
            let minutes: u64 = parse_env_value(&val, "PERSONA_STALE_MINUTES")?;
            config.stale_after = Duration::from_secs(minutes * 60);
        }

        Ok(config)
    }

    /// Validates the configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.target_passed_images == 0 {
            return Err(ConfigError::ValidationFailed(
                "target_passed_images must be greater than 0".to_string(),
            ));
        }

        if self.min_passed_images > self.target_passed_images {
            return Err(ConfigError::ValidationFailed(format!(
                "min_passed_images ({}) cannot exceed target_passed_images ({})",
                self.min_passed_images, self.target_passed_images
            )));
        }

        if self.generation_max_attempts == 0 {
            return Err(ConfigError::ValidationFailed(
                "generation_max_attempts must be greater than 0".to_string(),
            ));
        }

        if self.eval_batch_size == 0 {
            return Err(ConfigError::ValidationFailed(
                "eval_batch_size must be greater than 0".to_string(),
            ));
        }

        for (name, value) in [
            ("min_eval_score", self.min_eval_score),
            ("validation_threshold", self.validation_threshold),
        ] {
            if !(0.0..=10.0).contains(&value) {
                return Err(ConfigError::ValidationFailed(format!(
                    "{} must be between 0 and 10",
                    name
                )));
            }
        }

        if self.max_training_attempts == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_training_attempts must be greater than 0".to_string(),
            ));
        }

        if self.training_max_polls == 0 || self.render_max_polls == 0 {
            return Err(ConfigError::ValidationFailed(
                "poll caps must be greater than 0".to_string(),
            ));
        }

        if self.max_archive_bytes == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_archive_bytes must be greater than 0".to_string(),
            ));
        }

        if self.database_url.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "database_url cannot be empty".to_string(),
            ));
        }

        if self.max_concurrent_runs == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_concurrent_runs must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// A configuration that never sleeps. Used by tests and dry runs.
    pub fn without_delays(mut self) -> Self {
        self.generation_retry_base_delay = Duration::ZERO;
        self.primary_lane_delay = Duration::ZERO;
        self.secondary_lane_delay = Duration::ZERO;
        self.render_poll_interval = Duration::ZERO;
        self.training_poll_interval = Duration::ZERO;
        self
    }

    /// Per-prompt retry policy for dataset generation.
    pub fn generation_backoff(&self) -> BackoffPolicy {
        BackoffPolicy::new(
            self.generation_max_attempts,
            self.generation_retry_base_delay,
            DelayStrategy::Linear,
        )
    }

    /// Backoff for status-store-adjacent service lookups (training status on resume).
    pub fn lookup_backoff(&self) -> BackoffPolicy {
        BackoffPolicy::new(3, self.generation_retry_base_delay, DelayStrategy::Exponential)
    }

    pub fn render_poll(&self) -> PollPolicy {
        PollPolicy::new(self.render_poll_interval, self.render_max_polls)
    }

    pub fn training_poll(&self) -> PollPolicy {
        PollPolicy::new(self.training_poll_interval, self.training_max_polls)
    }

    pub fn lane_delay(&self, lane: PromptLane) -> Duration {
        match lane {
            PromptLane::Primary => self.primary_lane_delay,
            PromptLane::Secondary => self.secondary_lane_delay,
        }
    }

    pub fn with_target_passed_images(mut self, target: u32) -> Self {
        self.target_passed_images = target;
        self
    }

    pub fn with_min_passed_images(mut self, min: u32) -> Self {
        self.min_passed_images = min;
        self
    }

    pub fn with_max_replacement_rounds(mut self, rounds: u32) -> Self {
        self.max_replacement_rounds = rounds;
        self
    }

    pub fn with_generation_max_attempts(mut self, attempts: u32) -> Self {
        self.generation_max_attempts = attempts;
        self
    }

    pub fn with_lane_delays(mut self, primary: Duration, secondary: Duration) -> Self {
        self.primary_lane_delay = primary;
        self.secondary_lane_delay = secondary;
        self
    }

    pub fn with_eval_batch_size(mut self, size: usize) -> Self {
        self.eval_batch_size = size;
        self
    }

    pub fn with_min_eval_score(mut self, score: f64) -> Self {
        self.min_eval_score = score;
        self
    }

    pub fn with_max_training_attempts(mut self, attempts: u32) -> Self {
        self.max_training_attempts = attempts;
        self
    }

    pub fn with_training_poll(mut self, interval: Duration, max_polls: u32) -> Self {
        self.training_poll_interval = interval;
        self.training_max_polls = max_polls;
        self
    }

    pub fn with_max_archive_bytes(mut self, bytes: u64) -> Self {
        self.max_archive_bytes = bytes;
        self
    }

    pub fn with_validation_threshold(mut self, threshold: f64) -> Self {
        self.validation_threshold = threshold;
        self
    }

    pub fn with_min_validation_passes(mut self, passes: u32) -> Self {
        self.min_validation_passes = passes;
        self
    }

    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = url.into();
        self
    }

    pub fn with_blob_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.blob_root = root.into();
        self
    }

    pub fn with_blob_base_url(mut self, url: impl Into<String>) -> Self {
        self.blob_base_url = Some(url.into());
        self
    }

    pub fn with_catalog_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.catalog_path = Some(path.into());
        self
    }

    pub fn with_max_concurrent_runs(mut self, max: usize) -> Self {
        self.max_concurrent_runs = max;
        self
    }

    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }
}

fn env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

/// Parse an environment variable value into a type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}
