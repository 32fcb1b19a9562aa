//! Image generation service clients.
//!
//! Two backends are supported:
//! - [`HostedGenerationClient`]: a synchronous image API that returns base64
//!   images in the response body. Used for reference-conditioned portraits.
//! - [`ServerlessGenerationClient`]: a serverless worker queue (`/run` plus
//!   `/status/{id}`). The worker downloads any adapter listed in
//!   `character_lora_downloads` before rendering, which is how validation
//!   renders with a freshly trained adapter.
//!
//! [`ImageGenerator`] hides the sync/async difference behind one call.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::error::ServiceError;
use crate::models::AdapterRef;
use crate::utils::{PollPolicy, Transient};

use super::http::{build_client, check_status, require_env};

/// One image to render.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerationRequest {
    pub prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub negative_prompt: Option<String>,
    /// Public URLs of identity reference images.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub reference_images: Vec<String>,
    /// Adapters the renderer must load.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub adapters: Vec<AdapterRef>,
    pub width: u32,
    pub height: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            negative_prompt: None,
            reference_images: Vec::new(),
            adapters: Vec::new(),
            width: 1024,
            height: 1024,
            seed: None,
        }
    }

    pub fn with_reference(mut self, url: impl Into<String>) -> Self {
        self.reference_images.push(url.into());
        self
    }

    pub fn with_adapter(mut self, adapter: AdapterRef) -> Self {
        self.adapters.push(adapter);
        self
    }

    pub fn with_negative_prompt(mut self, negative: impl Into<String>) -> Self {
        self.negative_prompt = Some(negative.into());
        self
    }

    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }
}

/// Handle of an asynchronous render job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobHandle {
    pub id: String,
}

/// What a submission returns.
#[derive(Debug)]
pub enum Submission {
    /// Rendered inline.
    Image(Vec<u8>),
    /// Queued; poll the handle.
    Job(JobHandle),
}

/// State of a queued render job.
#[derive(Debug)]
pub enum JobPoll {
    Ready(Vec<u8>),
    Pending,
    Failed(String),
}

#[async_trait]
pub trait ImageGenerationService: Send + Sync {
    /// Short backend name for logs and metrics.
    fn name(&self) -> &str;

    async fn submit(&self, request: &GenerationRequest) -> Result<Submission, ServiceError>;

    async fn poll(&self, handle: &JobHandle) -> Result<JobPoll, ServiceError>;
}

/// Renders one image through a generation service, polling queued jobs.
#[derive(Clone)]
pub struct ImageGenerator {
    service: Arc<dyn ImageGenerationService>,
    poll: PollPolicy,
}

impl ImageGenerator {
    pub fn new(service: Arc<dyn ImageGenerationService>, poll: PollPolicy) -> Self {
        Self { service, poll }
    }

    pub fn service_name(&self) -> &str {
        self.service.name()
    }

    /// Submits `request` and waits for the image.
    ///
    /// Transient poll errors are absorbed and count against the poll cap.
    pub async fn generate(&self, request: &GenerationRequest) -> Result<Vec<u8>, ServiceError> {
        let handle = match self.service.submit(request).await? {
            Submission::Image(bytes) => return Ok(bytes),
            Submission::Job(handle) => handle,
        };

        tracing::debug!(
            backend = self.service.name(),
            job_id = %handle.id,
            "Render job queued"
        );

        for poll in 1..=self.poll.max_polls {
            self.poll.wait().await;
            match self.service.poll(&handle).await {
                Ok(JobPoll::Ready(bytes)) => return Ok(bytes),
                Ok(JobPoll::Pending) => {}
                Ok(JobPoll::Failed(reason)) => {
                    return Err(ServiceError::JobFailed(format!(
                        "render job {} failed: {}",
                        handle.id, reason
                    )))
                }
                Err(err) if err.is_transient() => {
                    tracing::warn!(
                        backend = self.service.name(),
                        job_id = %handle.id,
                        poll = poll,
                        error = %err,
                        "Transient poll error"
                    );
                }
                Err(err) => return Err(err),
            }
        }

        Err(ServiceError::Timeout(format!(
            "render job {} not finished after {} polls",
            handle.id, self.poll.max_polls
        )))
    }
}

// ============================================================================
// Hosted synchronous API
// ============================================================================

const HOSTED_SERVICE: &str = "Hosted image generation";

#[derive(Debug, Clone)]
pub struct HostedGenerationConfig {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub timeout: Duration,
}

impl HostedGenerationConfig {
    /// Reads `IMAGE_GEN_HOSTED_URL`, `IMAGE_GEN_HOSTED_API_KEY` and the
    /// optional `IMAGE_GEN_HOSTED_MODEL`.
    pub fn from_env() -> Result<Self, ServiceError> {
        Ok(Self {
            base_url: require_env(HOSTED_SERVICE, "IMAGE_GEN_HOSTED_URL")?
                .trim_end_matches('/')
                .to_string(),
            api_key: require_env(HOSTED_SERVICE, "IMAGE_GEN_HOSTED_API_KEY")?,
            model: std::env::var("IMAGE_GEN_HOSTED_MODEL")
                .unwrap_or_else(|_| "identity-portrait-v2".to_string()),
            timeout: Duration::from_secs(180),
        })
    }
}

/// Synchronous image API returning base64 images.
pub struct HostedGenerationClient {
    client: Client,
    config: HostedGenerationConfig,
}

#[derive(Debug, Serialize)]
struct HostedRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    negative_prompt: Option<&'a str>,
    #[serde(skip_serializing_if = "<[String]>::is_empty")]
    image_urls: &'a [String],
    size: String,
    n: u32,
    response_format: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    seed: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct HostedResponse {
    #[serde(default)]
    data: Vec<HostedImage>,
}

#[derive(Debug, Deserialize)]
struct HostedImage {
    b64_json: Option<String>,
}

impl HostedGenerationClient {
    pub fn new(config: HostedGenerationConfig) -> Result<Self, ServiceError> {
        Ok(Self {
            client: build_client(config.timeout)?,
            config,
        })
    }

    pub fn from_env() -> Result<Self, ServiceError> {
        Self::new(HostedGenerationConfig::from_env()?)
    }
}

#[async_trait]
impl ImageGenerationService for HostedGenerationClient {
    fn name(&self) -> &str {
        "hosted"
    }

    async fn submit(&self, request: &GenerationRequest) -> Result<Submission, ServiceError> {
        let body = HostedRequest {
            model: &self.config.model,
            prompt: &request.prompt,
            negative_prompt: request.negative_prompt.as_deref(),
            image_urls: &request.reference_images,
            size: format!("{}x{}", request.width, request.height),
            n: 1,
            response_format: "b64_json",
            seed: request.seed,
        };

        let response = self
            .client
            .post(format!("{}/images/generations", self.config.base_url))
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await
            .map_err(ServiceError::from_reqwest)?;
        let response = check_status(response).await?;

        let parsed: HostedResponse = response
            .json()
            .await
            .map_err(|e| ServiceError::InvalidResponse(e.to_string()))?;

        let encoded = parsed
            .data
            .into_iter()
            .find_map(|image| image.b64_json)
            .ok_or_else(|| ServiceError::InvalidResponse("response contained no image".into()))?;

        let bytes = BASE64
            .decode(encoded.as_bytes())
            .map_err(|e| ServiceError::InvalidResponse(format!("bad base64 image: {}", e)))?;
        Ok(Submission::Image(bytes))
    }

    async fn poll(&self, handle: &JobHandle) -> Result<JobPoll, ServiceError> {
        Err(ServiceError::InvalidResponse(format!(
            "hosted backend has no job queue (job {})",
            handle.id
        )))
    }
}

// ============================================================================
// Serverless worker queue
// ============================================================================

const SERVERLESS_SERVICE: &str = "Serverless image generation";

#[derive(Debug, Clone)]
pub struct ServerlessGenerationConfig {
    /// Endpoint root, e.g. `https://api.runpod.ai/v2/<endpoint-id>`.
    pub endpoint_url: String,
    pub api_key: String,
    /// Strength applied to every adapter in a request.
    pub adapter_strength: f64,
    pub timeout: Duration,
}

impl ServerlessGenerationConfig {
    /// Reads `IMAGE_GEN_ENDPOINT_URL` and `IMAGE_GEN_API_KEY`.
    pub fn from_env() -> Result<Self, ServiceError> {
        Ok(Self {
            endpoint_url: require_env(SERVERLESS_SERVICE, "IMAGE_GEN_ENDPOINT_URL")?
                .trim_end_matches('/')
                .to_string(),
            api_key: require_env(SERVERLESS_SERVICE, "IMAGE_GEN_API_KEY")?,
            adapter_strength: std::env::var("IMAGE_GEN_ADAPTER_STRENGTH")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(0.9),
            timeout: Duration::from_secs(60),
        })
    }
}

pub struct ServerlessGenerationClient {
    client: Client,
    config: ServerlessGenerationConfig,
}

#[derive(Debug, Serialize)]
struct RunEnvelope<'a> {
    input: RunInput<'a>,
}

#[derive(Debug, Serialize)]
struct RunInput<'a> {
    prompt: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    negative_prompt: Option<&'a str>,
    width: u32,
    height: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    seed: Option<u64>,
    #[serde(skip_serializing_if = "<[String]>::is_empty")]
    reference_images: &'a [String],
    #[serde(skip_serializing_if = "Vec::is_empty")]
    loras: Vec<LoraInput<'a>>,
    #[serde(skip_serializing_if = "<[AdapterRef]>::is_empty")]
    character_lora_downloads: &'a [AdapterRef],
}

#[derive(Debug, Serialize)]
struct LoraInput<'a> {
    name: &'a str,
    strength: f64,
}

#[derive(Debug, Deserialize)]
struct RunAccepted {
    id: String,
}

/// Job status payload from `/status/{id}`.
#[derive(Debug, Deserialize)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
enum WorkerStatus {
    InQueue,
    InProgress,
    Completed {
        output: WorkerOutput,
    },
    Failed {
        #[serde(default)]
        error: Option<String>,
    },
    Cancelled,
    TimedOut,
}

#[derive(Debug, Deserialize)]
struct WorkerOutput {
    #[serde(default)]
    images: Vec<WorkerImage>,
}

#[derive(Debug, Deserialize)]
struct WorkerImage {
    #[serde(rename = "type", default)]
    kind: Option<String>,
    data: String,
}

impl ServerlessGenerationClient {
    pub fn new(config: ServerlessGenerationConfig) -> Result<Self, ServiceError> {
        Ok(Self {
            client: build_client(config.timeout)?,
            config,
        })
    }

    pub fn from_env() -> Result<Self, ServiceError> {
        Self::new(ServerlessGenerationConfig::from_env()?)
    }

    fn build_input<'a>(&self, request: &'a GenerationRequest) -> RunInput<'a> {
        RunInput {
            prompt: &request.prompt,
            negative_prompt: request.negative_prompt.as_deref(),
            width: request.width,
            height: request.height,
            seed: request.seed,
            reference_images: &request.reference_images,
            loras: request
                .adapters
                .iter()
                .map(|adapter| LoraInput {
                    name: &adapter.filename,
                    strength: self.config.adapter_strength,
                })
                .collect(),
            character_lora_downloads: &request.adapters,
        }
    }

    async fn image_bytes(&self, image: WorkerImage) -> Result<Vec<u8>, ServiceError> {
        match image.kind.as_deref() {
            Some("s3_url") | Some("url") => {
                let response = self
                    .client
                    .get(&image.data)
                    .send()
                    .await
                    .map_err(ServiceError::from_reqwest)?;
                let response = check_status(response).await?;
                let bytes = response.bytes().await.map_err(ServiceError::from_reqwest)?;
                Ok(bytes.to_vec())
            }
            _ => {
                // Some workers prefix a data URI header.
                let encoded = image
                    .data
                    .split_once("base64,")
                    .map(|(_, rest)| rest)
                    .unwrap_or(&image.data);
                BASE64
                    .decode(encoded.as_bytes())
                    .map_err(|e| ServiceError::InvalidResponse(format!("bad base64 image: {}", e)))
            }
        }
    }
}

#[async_trait]
impl ImageGenerationService for ServerlessGenerationClient {
    fn name(&self) -> &str {
        "serverless"
    }

    async fn submit(&self, request: &GenerationRequest) -> Result<Submission, ServiceError> {
        let body = RunEnvelope {
            input: self.build_input(request),
        };

        let response = self
            .client
            .post(format!("{}/run", self.config.endpoint_url))
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await
            .map_err(ServiceError::from_reqwest)?;
        let response = check_status(response).await?;

        let accepted: RunAccepted = response
            .json()
            .await
            .map_err(|e| ServiceError::InvalidResponse(e.to_string()))?;
        Ok(Submission::Job(JobHandle { id: accepted.id }))
    }

    async fn poll(&self, handle: &JobHandle) -> Result<JobPoll, ServiceError> {
        let response = self
            .client
            .get(format!(
                "{}/status/{}",
                self.config.endpoint_url,
                urlencoding::encode(&handle.id)
            ))
            .bearer_auth(&self.config.api_key)
            .send()
            .await
            .map_err(ServiceError::from_reqwest)?;
        let response = check_status(response).await?;

        let status: WorkerStatus = response
            .json()
            .await
            .map_err(|e| ServiceError::InvalidResponse(e.to_string()))?;

        match status {
            WorkerStatus::InQueue | WorkerStatus::InProgress => Ok(JobPoll::Pending),
            WorkerStatus::Completed { output } => {
                let image = output.images.into_iter().next().ok_or_else(|| {
                    ServiceError::InvalidResponse("completed job returned no images".into())
                })?;
                Ok(JobPoll::Ready(self.image_bytes(image).await?))
            }
            WorkerStatus::Failed { error } => Ok(JobPoll::Failed(
                error.unwrap_or_else(|| "worker reported failure".to_string()),
            )),
            WorkerStatus::Cancelled => Ok(JobPoll::Failed("job cancelled".to_string())),
            WorkerStatus::TimedOut => Ok(JobPoll::Failed("job timed out on worker".to_string())),
        }
    }
}
