//! Candidate training images and their evaluation state.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::catalog::PromptLane;

/// Evaluation state of a candidate image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvalStatus {
    Pending,
    Passed,
    Failed,
    /// Superseded by a regenerated image in a later replacement round.
    Replaced,
}

impl EvalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EvalStatus::Pending => "pending",
            EvalStatus::Passed => "passed",
            EvalStatus::Failed => "failed",
            EvalStatus::Replaced => "replaced",
        }
    }
}

impl fmt::Display for EvalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EvalStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(EvalStatus::Pending),
            "passed" => Ok(EvalStatus::Passed),
            "failed" => Ok(EvalStatus::Failed),
            "replaced" => Ok(EvalStatus::Replaced),
            other => Err(format!("unknown evaluation status '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Verdict {
    Pass,
    Fail,
}

/// Sub-scores for one candidate plus the locally derived verdict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationDetail {
    /// Facial identity fidelity against the reference, 0-10.
    pub identity: f64,
    /// Proportions and anatomy consistency, 0-10.
    pub structure: f64,
    /// Sharpness, artifacts and exposure, 0-10.
    pub technical: f64,
    pub verdict: Verdict,
    /// Whatever the vision service claimed. Audit only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reported_verdict: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl EvaluationDetail {
    pub const IDENTITY: &'static str = "identity";
    pub const STRUCTURE: &'static str = "structure";
    pub const TECHNICAL: &'static str = "technical";

    /// Builds a detail from raw service sub-scores.
    ///
    /// Missing keys count as zero. The verdict passes only when all three
    /// sub-scores reach `min_score`.
    pub fn from_subscores(
        subscores: &BTreeMap<String, f64>,
        reported_verdict: Option<String>,
        min_score: f64,
    ) -> Self {
        let get = |key: &str| {
            subscores
                .get(key)
                .copied()
                .filter(|v| v.is_finite())
                .unwrap_or(0.0)
        };
        let identity = get(Self::IDENTITY);
        let structure = get(Self::STRUCTURE);
        let technical = get(Self::TECHNICAL);

        let verdict = if identity >= min_score && structure >= min_score && technical >= min_score
        {
            Verdict::Pass
        } else {
            Verdict::Fail
        };

        Self {
            identity,
            structure,
            technical,
            verdict,
            reported_verdict,
            error: None,
        }
    }

    /// Zero-score failure carrying the error that prevented scoring.
    pub fn errored(error: impl Into<String>) -> Self {
        Self {
            identity: 0.0,
            structure: 0.0,
            technical: 0.0,
            verdict: Verdict::Fail,
            reported_verdict: None,
            error: Some(error.into()),
        }
    }

    pub fn passed(&self) -> bool {
        self.verdict == Verdict::Pass
    }

    /// Mean of the three sub-scores.
    pub fn score(&self) -> f64 {
        (self.identity + self.structure + self.technical) / 3.0
    }
}

/// A generated image belonging to one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateImage {
    /// Unique within the run. Replacements carry a `_replacement` suffix.
    pub id: String,
    pub run_id: Uuid,
    pub lane: PromptLane,
    pub prompt_id: String,
    pub storage_path: String,
    pub image_url: String,
    pub status: EvalStatus,
    pub score: Option<f64>,
    pub evaluation: Option<EvaluationDetail>,
    pub caption: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl CandidateImage {
    pub fn new(
        id: impl Into<String>,
        run_id: Uuid,
        lane: PromptLane,
        prompt_id: impl Into<String>,
        storage_path: impl Into<String>,
        image_url: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            run_id,
            lane,
            prompt_id: prompt_id.into(),
            storage_path: storage_path.into(),
            image_url: image_url.into(),
            status: EvalStatus::Pending,
            score: None,
            evaluation: None,
            caption: None,
            created_at: Utc::now(),
        }
    }
}

/// Predicate for counting images of a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImageQuery {
    pub status: Option<EvalStatus>,
    /// `Some(true)` = has a caption, `Some(false)` = no caption yet.
    pub captioned: Option<bool>,
}

impl ImageQuery {
    pub fn with_status(status: EvalStatus) -> Self {
        Self {
            status: Some(status),
            captioned: None,
        }
    }

    pub fn captioned(mut self, captioned: bool) -> Self {
        self.captioned = Some(captioned);
        self
    }
}

/// Progress snapshot for one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageCounts {
    pub total: u32,
    pub pending: u32,
    pub passed: u32,
    pub failed: u32,
    pub replaced: u32,
    pub captioned: u32,
}
