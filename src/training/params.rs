//! Training hyper-parameters and the per-attempt override table.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingParams {
    pub learning_rate: f64,
    pub steps: u32,
    /// LoRA rank.
    pub rank: u32,
    pub batch_size: u32,
    pub resolution: u32,
    /// Token the adapter binds the identity to. Defaults to the subject slug.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger_word: Option<String>,
}

impl Default for TrainingParams {
    fn default() -> Self {
        Self {
            learning_rate: 4e-4,
            steps: 1500,
            rank: 16,
            batch_size: 1,
            resolution: 1024,
            trigger_word: None,
        }
    }
}

impl TrainingParams {
    pub fn with_trigger_word(mut self, trigger_word: impl Into<String>) -> Self {
        self.trigger_word = Some(trigger_word.into());
        self
    }

    /// Defaults merged with `overrides`. Steps are rounded and never drop below one.
    pub fn with_overrides(&self, overrides: &ParamOverrides) -> Self {
        let mut merged = self.clone();
        merged.learning_rate = self.learning_rate * overrides.learning_rate_factor;
        merged.steps = ((self.steps as f64) * overrides.steps_factor).round().max(1.0) as u32;
        merged
    }
}

/// Multipliers applied to the default parameters for one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ParamOverrides {
    pub learning_rate_factor: f64,
    pub steps_factor: f64,
}

impl Default for ParamOverrides {
    fn default() -> Self {
        Self {
            learning_rate_factor: 1.0,
            steps_factor: 1.0,
        }
    }
}

impl ParamOverrides {
    pub fn is_identity(&self) -> bool {
        *self == Self::default()
    }
}

/// Override row for a 1-based training attempt.
///
/// Attempt 1 trains with defaults. Attempt 2 halves the learning rate and
/// trims steps (the first adapter likely overfit). Attempt 3 and later raise
/// the learning rate with fewer steps (the adapter likely underfit).
pub fn overrides_for_attempt(attempt: u32) -> ParamOverrides {
    match attempt {
        0 | 1 => ParamOverrides::default(),
        2 => ParamOverrides {
            learning_rate_factor: 0.5,
            steps_factor: 0.8,
        },
        _ => ParamOverrides {
            learning_rate_factor: 1.5,
            steps_factor: 0.75,
        },
    }
}
