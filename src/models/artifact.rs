//! Training artifacts, adapter references and validation results.

use serde::{Deserialize, Serialize};

use crate::training::TrainingParams;

/// A trained adapter file and where it lives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingArtifact {
    pub url: String,
    pub filename: String,
    pub size_bytes: u64,
    pub training_job_id: String,
    pub params: TrainingParams,
}

/// An adapter file the generation worker downloads before rendering.
///
/// `filename` is the worker-side cache path, e.g.
/// `characters/char_ava_1a2b3c4d.safetensors`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterRef {
    pub filename: String,
    pub url: String,
}

impl AdapterRef {
    pub fn new(filename: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            url: url.into(),
        }
    }

    /// Worker cache filename for a subject's adapter from one run.
    pub fn filename_for(slug: &str, short_run_id: &str) -> String {
        format!("characters/char_{}_{}.safetensors", slug, short_run_id)
    }
}

/// Score for one validation prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptScore {
    pub prompt: String,
    pub score: f64,
    pub passed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PromptScore {
    pub fn failed(prompt: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            score: 0.0,
            passed: false,
            error: Some(error.into()),
        }
    }
}

/// Outcome of rendering the validation battery with one trained adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub attempt: u32,
    pub overall_pass: bool,
    pub mean_score: f64,
    pub pass_count: u32,
    pub results: Vec<PromptScore>,
}

impl ValidationResult {
    /// Aggregates prompt scores; overall pass needs `min_passes` passing prompts.
    pub fn from_scores(attempt: u32, results: Vec<PromptScore>, min_passes: u32) -> Self {
        let pass_count = results.iter().filter(|r| r.passed).count() as u32;
        let mean_score = if results.is_empty() {
            0.0
        } else {
            results.iter().map(|r| r.score).sum::<f64>() / results.len() as f64
        };

        Self {
            attempt,
            overall_pass: pass_count >= min_passes,
            mean_score,
            pass_count,
            results,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn score(score: f64, passed: bool) -> PromptScore {
        PromptScore {
            prompt: "p".into(),
            score,
            passed,
            error: None,
        }
    }

    #[test]
    fn test_five_of_six_passes() {
        let mut results: Vec<_> = (0..5).map(|_| score(8.0, true)).collect();
        results.push(PromptScore::failed("p6", "render failed"));

        let result = ValidationResult::from_scores(1, results, 5);
        assert!(result.overall_pass);
        assert_eq!(result.pass_count, 5);
        assert!((result.mean_score - 40.0 / 6.0).abs() < 1e-9);
    }

    #[test]
    fn test_four_of_six_fails() {
        let results: Vec<_> = (0..6).map(|i| score(8.0, i < 4)).collect();
        assert!(!ValidationResult::from_scores(2, results, 5).overall_pass);
    }

    #[test]
    fn test_empty_battery() {
        let result = ValidationResult::from_scores(1, Vec::new(), 5);
        assert!(!result.overall_pass);
        assert_eq!(result.mean_score, 0.0);
    }

    #[test]
    fn test_adapter_filename() {
        assert_eq!(
            AdapterRef::filename_for("ava", "1a2b3c4d"),
            "characters/char_ava_1a2b3c4d.safetensors"
        );
    }
}
