//! High-level recording interface over the Prometheus statics.

use crate::catalog::PromptLane;
use crate::models::RunStatus;

use super::prometheus::{
    ACTIVE_RUNS, EVALUATIONS_TOTAL, EVALUATION_SCORE, IMAGES_GENERATED_TOTAL, RUNS_TOTAL,
    STAGE_DURATION, TRAINING_ATTEMPTS_TOTAL, VALIDATION_SCORE,
};

/// How a candidate evaluation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvaluationOutcome {
    Passed,
    BelowThreshold,
    /// The service call or image fetch failed; scored as zero.
    Error,
}

impl EvaluationOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            EvaluationOutcome::Passed => "passed",
            EvaluationOutcome::BelowThreshold => "below_threshold",
            EvaluationOutcome::Error => "error",
        }
    }
}

/// How a training attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// Trained and passed validation.
    Validated,
    /// Trained but failed validation.
    Rejected,
    /// Training, staging or validation raised an error.
    Error,
}

impl AttemptOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptOutcome::Validated => "validated",
            AttemptOutcome::Rejected => "rejected",
            AttemptOutcome::Error => "error",
        }
    }
}

/// Metrics recorder. Every method is a no-op until
/// [`init_metrics`](super::init_metrics) has run.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    pub fn new() -> Self {
        Self
    }

    pub fn run_started(&self) {
        if let Some(active) = ACTIVE_RUNS.get() {
            active.inc();
        }
    }

    /// Records the terminal status a run ended in.
    pub fn run_finished(&self, status: RunStatus) {
        if let Some(active) = ACTIVE_RUNS.get() {
            active.dec();
        }
        if let Some(runs) = RUNS_TOTAL.get() {
            runs.with_label_values(&[status.as_str()]).inc();
        }
        tracing::trace!(status = %status, "Recorded run metric");
    }

    pub fn record_generation(&self, lane: PromptLane, success: bool) {
        if let Some(images) = IMAGES_GENERATED_TOTAL.get() {
            let outcome = if success { "success" } else { "failure" };
            images.with_label_values(&[lane.as_str(), outcome]).inc();
        }
    }

    pub fn record_evaluation(&self, outcome: EvaluationOutcome, mean_score: f64) {
        if let Some(evaluations) = EVALUATIONS_TOTAL.get() {
            evaluations.with_label_values(&[outcome.as_str()]).inc();
        }
        if outcome != EvaluationOutcome::Error {
            if let Some(score) = EVALUATION_SCORE.get() {
                score.observe(mean_score);
            }
        }
    }

    pub fn record_training_attempt(&self, outcome: AttemptOutcome) {
        if let Some(attempts) = TRAINING_ATTEMPTS_TOTAL.get() {
            attempts.with_label_values(&[outcome.as_str()]).inc();
        }
    }

    pub fn record_validation(&self, mean_score: f64) {
        if let Some(score) = VALIDATION_SCORE.get() {
            score.observe(mean_score);
        }
    }

    pub fn record_stage_duration(&self, stage: RunStatus, duration_secs: f64) {
        if let Some(durations) = STAGE_DURATION.get() {
            durations
                .with_label_values(&[stage.as_str()])
                .observe(duration_secs);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{export_metrics, init_metrics};

    #[test]
    fn test_outcome_labels() {
        assert_eq!(EvaluationOutcome::BelowThreshold.as_str(), "below_threshold");
        assert_eq!(AttemptOutcome::Validated.as_str(), "validated");
    }

    #[test]
    fn test_recording_shows_up_in_export() {
        let _ = init_metrics();
        let collector = MetricsCollector::new();

        collector.run_started();
        collector.record_generation(PromptLane::Secondary, true);
        collector.record_evaluation(EvaluationOutcome::Error, 0.0);
        collector.record_training_attempt(AttemptOutcome::Rejected);
        collector.record_validation(6.5);
        collector.record_stage_duration(RunStatus::Training, 42.0);
        collector.run_finished(RunStatus::Deployed);

        let text = export_metrics();
        assert!(text.contains("persona_forge_evaluations_total{outcome=\"error\"}"));
        assert!(text.contains("persona_forge_runs_total{status=\"deployed\"}"));
        assert!(text.contains("lane=\"secondary\""));
    }
}
