//! Prometheus metrics registration and export.
//!
//! Defines all Prometheus metrics used by persona-forge and provides
//! functions for initializing, registering, and exporting them.

use prometheus::{
    CounterVec, Encoder, Gauge, Histogram, HistogramOpts, HistogramVec, Opts, Registry,
    TextEncoder,
};
use std::sync::{Mutex, OnceLock};

static INIT_LOCK: Mutex<()> = Mutex::new(());

/// Global Prometheus registry for all persona-forge metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Runs that reached a terminal status, labeled by status.
pub static RUNS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Dataset generation outcomes, labeled by lane and outcome (`success`/`failure`).
pub static IMAGES_GENERATED_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Candidate evaluations, labeled by outcome (`passed`/`below_threshold`/`error`).
pub static EVALUATIONS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Distribution of mean candidate scores (0-10).
pub static EVALUATION_SCORE: OnceLock<Histogram> = OnceLock::new();

/// Training attempts, labeled by outcome (`validated`/`rejected`/`error`).
pub static TRAINING_ATTEMPTS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Distribution of validation mean scores (0-10).
pub static VALIDATION_SCORE: OnceLock<Histogram> = OnceLock::new();

/// Wall time per pipeline stage, labeled by stage.
pub static STAGE_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Runs currently executing.
pub static ACTIVE_RUNS: OnceLock<Gauge> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Call once at startup. Recording before this is a no-op.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let _guard = INIT_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    if REGISTRY.get().is_some() {
        return Ok(());
    }

    let registry = Registry::new();

    let runs_total = CounterVec::new(
        Opts::new(
            "persona_forge_runs_total",
            "Pipeline runs that reached a terminal status",
        ),
        &["status"],
    )?;

    let images_generated_total = CounterVec::new(
        Opts::new(
            "persona_forge_images_generated_total",
            "Dataset image generation outcomes",
        ),
        &["lane", "outcome"],
    )?;

    let evaluations_total = CounterVec::new(
        Opts::new(
            "persona_forge_evaluations_total",
            "Candidate image evaluations",
        ),
        &["outcome"],
    )?;

    let score_buckets = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0, 10.0];

    let evaluation_score = Histogram::with_opts(
        HistogramOpts::new(
            "persona_forge_evaluation_score",
            "Distribution of mean candidate scores",
        )
        .buckets(score_buckets.clone()),
    )?;

    let training_attempts_total = CounterVec::new(
        Opts::new(
            "persona_forge_training_attempts_total",
            "Training attempts by outcome",
        ),
        &["outcome"],
    )?;

    let validation_score = Histogram::with_opts(
        HistogramOpts::new(
            "persona_forge_validation_score",
            "Distribution of validation mean scores",
        )
        .buckets(score_buckets),
    )?;

    let stage_duration = HistogramVec::new(
        HistogramOpts::new(
            "persona_forge_stage_duration_seconds",
            "Pipeline stage duration in seconds",
        )
        .buckets(vec![10.0, 60.0, 300.0, 600.0, 1200.0, 1800.0, 3600.0, 7200.0]),
        &["stage"],
    )?;

    let active_runs = Gauge::new("persona_forge_active_runs", "Runs currently executing")?;

    registry.register(Box::new(runs_total.clone()))?;
    registry.register(Box::new(images_generated_total.clone()))?;
    registry.register(Box::new(evaluations_total.clone()))?;
    registry.register(Box::new(evaluation_score.clone()))?;
    registry.register(Box::new(training_attempts_total.clone()))?;
    registry.register(Box::new(validation_score.clone()))?;
    registry.register(Box::new(stage_duration.clone()))?;
    registry.register(Box::new(active_runs.clone()))?;

    let _ = REGISTRY.set(registry);
    let _ = RUNS_TOTAL.set(runs_total);
    let _ = IMAGES_GENERATED_TOTAL.set(images_generated_total);
    let _ = EVALUATIONS_TOTAL.set(evaluations_total);
    let _ = EVALUATION_SCORE.set(evaluation_score);
    let _ = TRAINING_ATTEMPTS_TOTAL.set(training_attempts_total);
    let _ = VALIDATION_SCORE.set(validation_score);
    let _ = STAGE_DURATION.set(stage_duration);
    let _ = ACTIVE_RUNS.set(active_runs);

    tracing::debug!("Prometheus metrics initialized");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_metrics() {
        let result = init_metrics();
        assert!(result.is_ok() || REGISTRY.get().is_some());
    }

    #[test]
    fn test_metrics_after_init() {
        let _ = init_metrics();
        let metrics = export_metrics();
        assert!(!metrics.is_empty());
        assert!(!metrics.starts_with("# Error"));
    }
}
