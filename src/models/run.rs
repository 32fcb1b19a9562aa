//! Pipeline run records.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::artifact::TrainingArtifact;

/// Stage of a pipeline run.
///
/// Runs move forward through the stages in declaration order. `Failed` can be
/// entered from any stage; `Archived` only when a later run of the same
/// subject is deployed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    GeneratingDataset,
    Evaluating,
    Captioning,
    Training,
    Validating,
    Deployed,
    Failed,
    Archived,
}

impl RunStatus {
    pub const ALL: [RunStatus; 9] = [
        RunStatus::Pending,
        RunStatus::GeneratingDataset,
        RunStatus::Evaluating,
        RunStatus::Captioning,
        RunStatus::Training,
        RunStatus::Validating,
        RunStatus::Deployed,
        RunStatus::Failed,
        RunStatus::Archived,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::GeneratingDataset => "generating_dataset",
            RunStatus::Evaluating => "evaluating",
            RunStatus::Captioning => "captioning",
            RunStatus::Training => "training",
            RunStatus::Validating => "validating",
            RunStatus::Deployed => "deployed",
            RunStatus::Failed => "failed",
            RunStatus::Archived => "archived",
        }
    }

    /// Terminal runs are never touched by resume.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Deployed | RunStatus::Failed | RunStatus::Archived
        )
    }

    /// Statuses a resumable run can be stuck in.
    pub fn active() -> impl Iterator<Item = RunStatus> {
        Self::ALL.into_iter().filter(|s| !s.is_terminal())
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown run status '{}'", s))
    }
}

/// The subject an adapter is trained for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubjectInput {
    pub subject_id: String,
    pub name: String,
    /// Filesystem-safe short name used in storage paths and adapter filenames.
    pub slug: String,
    /// Leading caption tag, e.g. `woman`, `man`, `person`.
    pub gender_tag: String,
    pub reference_image_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl SubjectInput {
    pub fn new(
        subject_id: impl Into<String>,
        name: impl Into<String>,
        gender_tag: impl Into<String>,
        reference_image_url: impl Into<String>,
    ) -> Self {
        let name = name.into();
        Self {
            subject_id: subject_id.into(),
            slug: slugify(&name),
            name,
            gender_tag: gender_tag.into(),
            reference_image_url: reference_image_url.into(),
            description: None,
        }
    }

    pub fn with_slug(mut self, slug: impl Into<String>) -> Self {
        self.slug = slug.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Lowercase alphanumerics joined by single underscores.
pub fn slugify(name: &str) -> String {
    name.split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|part| !part.is_empty())
        .map(|part| part.to_ascii_lowercase())
        .collect::<Vec<_>>()
        .join("_")
}

/// One end-to-end attempt at producing an adapter for a subject.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
    pub id: Uuid,
    pub subject: SubjectInput,
    pub status: RunStatus,
    pub training_attempts: u32,
    pub training_job_id: Option<String>,
    pub error_message: Option<String>,
    pub validation_score: Option<f64>,
    pub dataset_size: Option<u32>,
    pub artifact: Option<TrainingArtifact>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deployed_at: Option<DateTime<Utc>>,
}

impl PipelineRun {
    pub fn new(id: Uuid, subject: SubjectInput) -> Self {
        let now = Utc::now();
        Self {
            id,
            subject,
            status: RunStatus::Pending,
            training_attempts: 0,
            training_job_id: None,
            error_message: None,
            validation_score: None,
            dataset_size: None,
            artifact: None,
            created_at: now,
            updated_at: now,
            deployed_at: None,
        }
    }

    /// First eight hex characters of the id, used in adapter filenames.
    pub fn short_id(&self) -> String {
        short_run_id(self.id)
    }
}

pub fn short_run_id(id: Uuid) -> String {
    id.simple().to_string()[..8].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip() {
        for status in RunStatus::ALL {
            assert_eq!(status.as_str().parse::<RunStatus>().unwrap(), status);
        }
        assert!("unknown".parse::<RunStatus>().is_err());
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(RunStatus::Deployed.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(RunStatus::Archived.is_terminal());
        assert!(!RunStatus::Captioning.is_terminal());
        assert_eq!(RunStatus::active().count(), 6);
    }

    #[test]
    fn test_status_serde_matches_as_str() {
        let json = serde_json::to_string(&RunStatus::GeneratingDataset).unwrap();
        assert_eq!(json, "\"generating_dataset\"");
    }

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("Ava  Marie-Stone"), "ava_marie_stone");
        assert_eq!(slugify("  Zoë 2 "), "zo_2");
    }

    #[test]
    fn test_short_id() {
        let run = PipelineRun::new(Uuid::new_v4(), SubjectInput::new("s1", "Ava", "woman", "u"));
        assert_eq!(run.short_id().len(), 8);
        assert_eq!(run.status, RunStatus::Pending);
    }
}
