//! Training service client.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::error::ServiceError;
use crate::training::TrainingParams;

use super::http::{build_client, check_status, require_env};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrainingState {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl TrainingState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrainingState::Queued => "queued",
            TrainingState::Running => "running",
            TrainingState::Succeeded => "succeeded",
            TrainingState::Failed => "failed",
            TrainingState::Cancelled => "cancelled",
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            TrainingState::Succeeded | TrainingState::Failed | TrainingState::Cancelled
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrainingJobStatus {
    pub state: TrainingState,
    /// Set once the job succeeded.
    pub artifact_url: Option<String>,
    pub error: Option<String>,
}

impl TrainingJobStatus {
    pub fn pending(state: TrainingState) -> Self {
        Self {
            state,
            artifact_url: None,
            error: None,
        }
    }

    pub fn succeeded(artifact_url: impl Into<String>) -> Self {
        Self {
            state: TrainingState::Succeeded,
            artifact_url: Some(artifact_url.into()),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            state: TrainingState::Failed,
            artifact_url: None,
            error: Some(error.into()),
        }
    }
}

#[async_trait]
pub trait TrainingService: Send + Sync {
    /// Submits a packaged dataset and returns the job id.
    async fn submit_training(
        &self,
        dataset_url: &str,
        params: &TrainingParams,
    ) -> Result<String, ServiceError>;

    async fn get_training_status(&self, job_id: &str) -> Result<TrainingJobStatus, ServiceError>;

    async fn download_artifact(&self, url: &str) -> Result<Vec<u8>, ServiceError>;
}

const TRAINING_SERVICE: &str = "Training service";

#[derive(Debug, Clone)]
pub struct HttpTrainingConfig {
    pub base_url: String,
    pub api_key: String,
    /// Base model the adapter is trained against.
    pub base_model: String,
    pub timeout: Duration,
}

impl HttpTrainingConfig {
    /// Reads `TRAINING_API_BASE`, `TRAINING_API_KEY` and optional `TRAINING_BASE_MODEL`.
    pub fn from_env() -> Result<Self, ServiceError> {
        Ok(Self {
            base_url: require_env(TRAINING_SERVICE, "TRAINING_API_BASE")?
                .trim_end_matches('/')
                .to_string(),
            api_key: require_env(TRAINING_SERVICE, "TRAINING_API_KEY")?,
            base_model: std::env::var("TRAINING_BASE_MODEL")
                .unwrap_or_else(|_| "flux-dev".to_string()),
            timeout: Duration::from_secs(120),
        })
    }
}

/// REST training API: `POST /trainings`, `GET /trainings/{id}`.
pub struct HttpTrainingClient {
    client: Client,
    config: HttpTrainingConfig,
}

#[derive(Debug, Serialize)]
struct SubmitRequest<'a> {
    base_model: &'a str,
    dataset_url: &'a str,
    #[serde(flatten)]
    params: &'a TrainingParams,
}

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    id: String,
}

/// Status payload, tagged by `status`.
#[derive(Debug, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum ApiJobStatus {
    #[serde(alias = "starting", alias = "pending")]
    Queued,
    #[serde(alias = "processing")]
    Running,
    #[serde(alias = "completed")]
    Succeeded { output: ApiOutput },
    Failed {
        #[serde(default)]
        error: Option<String>,
    },
    #[serde(alias = "canceled")]
    Cancelled,
}

#[derive(Debug, Deserialize)]
struct ApiOutput {
    #[serde(alias = "weights", alias = "diffusers_lora_file")]
    weights_url: String,
}

impl From<ApiJobStatus> for TrainingJobStatus {
    fn from(status: ApiJobStatus) -> Self {
        match status {
            ApiJobStatus::Queued => TrainingJobStatus::pending(TrainingState::Queued),
            ApiJobStatus::Running => TrainingJobStatus::pending(TrainingState::Running),
            ApiJobStatus::Succeeded { output } => TrainingJobStatus::succeeded(output.weights_url),
            ApiJobStatus::Failed { error } => TrainingJobStatus::failed(
                error.unwrap_or_else(|| "training service reported failure".to_string()),
            ),
            ApiJobStatus::Cancelled => TrainingJobStatus {
                state: TrainingState::Cancelled,
                artifact_url: None,
                error: Some("job cancelled".to_string()),
            },
        }
    }
}

impl HttpTrainingClient {
    pub fn new(config: HttpTrainingConfig) -> Result<Self, ServiceError> {
        Ok(Self {
            client: build_client(config.timeout)?,
            config,
        })
    }

    pub fn from_env() -> Result<Self, ServiceError> {
        Self::new(HttpTrainingConfig::from_env()?)
    }
}

#[async_trait]
impl TrainingService for HttpTrainingClient {
    async fn submit_training(
        &self,
        dataset_url: &str,
        params: &TrainingParams,
    ) -> Result<String, ServiceError> {
        let body = SubmitRequest {
            base_model: &self.config.base_model,
            dataset_url,
            params,
        };

        let response = self
            .client
            .post(format!("{}/trainings", self.config.base_url))
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await
            .map_err(ServiceError::from_reqwest)?;
        let response = check_status(response).await?;

        let submitted: SubmitResponse = response
            .json()
            .await
            .map_err(|e| ServiceError::InvalidResponse(e.to_string()))?;
        Ok(submitted.id)
    }

    async fn get_training_status(&self, job_id: &str) -> Result<TrainingJobStatus, ServiceError> {
        let response = self
            .client
            .get(format!(
                "{}/trainings/{}",
                self.config.base_url,
                urlencoding::encode(job_id)
            ))
            .bearer_auth(&self.config.api_key)
            .send()
            .await
            .map_err(ServiceError::from_reqwest)?;
        let response = check_status(response).await?;

        let status: ApiJobStatus = response
            .json()
            .await
            .map_err(|e| ServiceError::InvalidResponse(e.to_string()))?;
        Ok(status.into())
    }

    async fn download_artifact(&self, url: &str) -> Result<Vec<u8>, ServiceError> {
        // Adapter files are large; use a per-request timeout well above the API one.
        let response = self
            .client
            .get(url)
            .timeout(Duration::from_secs(900))
            .send()
            .await
            .map_err(ServiceError::from_reqwest)?;
        let response = check_status(response).await?;
        let bytes = response.bytes().await.map_err(ServiceError::from_reqwest)?;
        Ok(bytes.to_vec())
    }
}
