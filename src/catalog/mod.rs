//! Prompt catalog for dataset generation.
//!
//! The catalog is a fixed, read-only list of prompt templates. Each template
//! belongs to a [`PromptLane`] that decides which generation backend renders
//! it, and a category used as a coarse caption hint. Template text contains a
//! `{subject}` placeholder that is filled with the subject's description.
//!
//! A catalog is loaded from YAML:
//!
//! ```yaml
//! prompts:
//!   - id: portrait_front
//!     lane: primary
//!     category: portrait
//!     text: "close-up portrait of {subject}, looking at camera, soft studio lighting"
//! ```
//!
//! or taken from [`PromptCatalog::builtin`].

mod defaults;

use std::collections::HashSet;
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while loading a catalog.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse catalog '{path}': {message}")]
    Parse { path: String, message: String },

    #[error("Duplicate prompt id '{0}'")]
    DuplicateId(String),

    #[error("Prompt '{0}' is missing the {{subject}} placeholder")]
    MissingPlaceholder(String),

    #[error("Catalog is empty")]
    Empty,
}

/// Which generation backend renders a prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptLane {
    /// Reference-conditioned hosted API. Tight rate limit.
    Primary,
    /// Serverless render workers. Looser rate limit.
    Secondary,
}

impl PromptLane {
    pub fn as_str(&self) -> &'static str {
        match self {
            PromptLane::Primary => "primary",
            PromptLane::Secondary => "secondary",
        }
    }
}

impl fmt::Display for PromptLane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PromptLane {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "primary" => Ok(PromptLane::Primary),
            "secondary" => Ok(PromptLane::Secondary),
            other => Err(format!("unknown prompt lane '{}'", other)),
        }
    }
}

/// A single dataset prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptTemplate {
    pub id: String,
    pub lane: PromptLane,
    pub category: String,
    pub text: String,
}

impl PromptTemplate {
    pub const PLACEHOLDER: &'static str = "{subject}";

    pub fn new(
        id: impl Into<String>,
        lane: PromptLane,
        category: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            lane,
            category: category.into(),
            text: text.into(),
        }
    }

    /// Fills the subject placeholder.
    pub fn render(&self, subject: &str) -> String {
        self.text.replace(Self::PLACEHOLDER, subject)
    }
}

#[derive(Debug, Deserialize)]
struct CatalogFile {
    prompts: Vec<PromptTemplate>,
}

/// Read-only list of prompt templates.
#[derive(Debug, Clone)]
pub struct PromptCatalog {
    prompts: Vec<PromptTemplate>,
}

impl PromptCatalog {
    /// Builds a catalog, rejecting duplicate ids and templates without a placeholder.
    pub fn new(prompts: Vec<PromptTemplate>) -> Result<Self, CatalogError> {
        if prompts.is_empty() {
            return Err(CatalogError::Empty);
        }

        let mut seen = HashSet::new();
        for prompt in &prompts {
            if !seen.insert(prompt.id.as_str()) {
                return Err(CatalogError::DuplicateId(prompt.id.clone()));
            }
            if !prompt.text.contains(PromptTemplate::PLACEHOLDER) {
                return Err(CatalogError::MissingPlaceholder(prompt.id.clone()));
            }
        }

        Ok(Self { prompts })
    }

    /// The catalog compiled into the binary.
    pub fn builtin() -> Self {
        Self {
            prompts: defaults::builtin_prompts(),
        }
    }

    pub fn from_yaml_str(content: &str) -> Result<Self, CatalogError> {
        let file: CatalogFile = serde_yaml::from_str(content).map_err(|e| CatalogError::Parse {
            path: "<inline>".to_string(),
            message: e.to_string(),
        })?;
        Self::new(file.prompts)
    }

    pub fn load_file<P: AsRef<Path>>(path: P) -> Result<Self, CatalogError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let file: CatalogFile = serde_yaml::from_str(&content).map_err(|e| CatalogError::Parse {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        Self::new(file.prompts)
    }

    pub fn prompts(&self) -> &[PromptTemplate] {
        &self.prompts
    }

    pub fn len(&self) -> usize {
        self.prompts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prompts.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&PromptTemplate> {
        self.prompts.iter().find(|p| p.id == id)
    }

    /// Templates of one lane, in catalog order.
    pub fn lane(&self, lane: PromptLane) -> impl Iterator<Item = &PromptTemplate> {
        self.prompts.iter().filter(move |p| p.lane == lane)
    }
}

impl Default for PromptCatalog {
    fn default() -> Self {
        Self::builtin()
    }
}
