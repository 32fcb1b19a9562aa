//! Vision evaluation service clients.
//!
//! The service is opaque: it receives a reference and a candidate image and
//! answers with numeric sub-scores (0-10) and, optionally, its own verdict.
//! Callers never trust that verdict; see
//! [`EvaluationDetail::from_subscores`](crate::models::EvaluationDetail::from_subscores).

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::error::ServiceError;
use crate::utils::extract_json_object;

use super::http::{build_client, check_status, require_env};

/// What the comparison should concentrate on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComparisonFocus {
    /// Identity, structure and technical quality (dataset screening).
    FullRubric,
    /// Identity only (adapter validation).
    IdentityOnly,
}

#[derive(Debug, Clone)]
pub struct EvaluationContext {
    pub subject_name: String,
    /// The prompt the candidate was rendered from.
    pub prompt: Option<String>,
    pub focus: ComparisonFocus,
}

impl EvaluationContext {
    pub fn new(subject_name: impl Into<String>, focus: ComparisonFocus) -> Self {
        Self {
            subject_name: subject_name.into(),
            prompt: None,
            focus,
        }
    }

    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = Some(prompt.into());
        self
    }
}

/// Raw service answer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VisionComparison {
    pub subscores: BTreeMap<String, f64>,
    pub verdict: Option<String>,
}

#[async_trait]
pub trait VisionEvaluationService: Send + Sync {
    async fn compare(
        &self,
        reference: &[u8],
        candidate: &[u8],
        context: &EvaluationContext,
    ) -> Result<VisionComparison, ServiceError>;
}

const VISION_SERVICE: &str = "Vision evaluation";

#[derive(Debug, Clone)]
pub struct ChatVisionConfig {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub timeout: Duration,
}

impl ChatVisionConfig {
    /// Reads `VISION_API_KEY`, optional `VISION_BASE_URL` and `VISION_MODEL`.
    pub fn from_env() -> Result<Self, ServiceError> {
        Ok(Self {
            base_url: std::env::var("VISION_BASE_URL")
                .unwrap_or_else(|_| "https://openrouter.ai/api/v1".to_string())
                .trim_end_matches('/')
                .to_string(),
            api_key: require_env(VISION_SERVICE, "VISION_API_KEY")?,
            model: std::env::var("VISION_MODEL")
                .unwrap_or_else(|_| "google/gemini-2.5-flash".to_string()),
            timeout: Duration::from_secs(120),
        })
    }
}

/// OpenAI-compatible chat completions client with inline images.
pub struct ChatVisionClient {
    client: Client,
    config: ChatVisionConfig,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    temperature: f64,
    max_tokens: u32,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: &'static str,
    content: Vec<ContentPart>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Serialize)]
struct ImageUrl {
    url: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Debug, Deserialize)]
struct ChatReply {
    #[serde(default)]
    content: Option<String>,
}

const RUBRIC_PROMPT: &str = "You compare a CANDIDATE image against a REFERENCE image of the same person. \
Score each criterion from 0 to 10:\n\
- identity: is this unmistakably the same person (face shape, features, proportions)?\n\
- structure: are anatomy and body proportions correct and consistent with the reference?\n\
- technical: sharpness, absence of artifacts, sensible exposure.\n\
Answer with a single JSON object: {\"identity\": n, \"structure\": n, \"technical\": n, \"verdict\": \"PASS\" or \"FAIL\"}";

const IDENTITY_PROMPT: &str = "You compare a CANDIDATE image against a REFERENCE image. \
Score from 0 to 10 how clearly the candidate shows the same person as the reference. \
Answer with a single JSON object: {\"identity\": n, \"verdict\": \"PASS\" or \"FAIL\"}";

/// Sniffs the MIME type from magic bytes. Defaults to PNG.
fn mime_type(bytes: &[u8]) -> &'static str {
    if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        "image/jpeg"
    } else if bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
        "image/webp"
    } else {
        "image/png"
    }
}

fn data_uri(bytes: &[u8]) -> String {
    format!("data:{};base64,{}", mime_type(bytes), BASE64.encode(bytes))
}

/// Maps the keys models commonly use onto the canonical sub-score names.
fn canonical_key(key: &str) -> Option<&'static str> {
    let key = key.to_ascii_lowercase();
    let key = key.trim_end_matches("_score");
    match key {
        "identity" | "identity_fidelity" | "face_match" | "likeness" => Some("identity"),
        "structure" | "structural_consistency" | "anatomy" => Some("structure"),
        "technical" | "technical_quality" | "quality" => Some("technical"),
        _ => None,
    }
}

/// Parses the model's answer into a comparison.
fn parse_comparison(content: &str) -> Result<VisionComparison, ServiceError> {
    let json = extract_json_object(content).ok_or_else(|| {
        ServiceError::InvalidResponse(format!(
            "no JSON object in vision reply: {}",
            content.chars().take(200).collect::<String>()
        ))
    })?;

    let value: serde_json::Value =
        serde_json::from_str(&json).map_err(|e| ServiceError::InvalidResponse(e.to_string()))?;
    let object = value
        .as_object()
        .ok_or_else(|| ServiceError::InvalidResponse("vision reply is not an object".into()))?;

    let mut comparison = VisionComparison::default();
    for (key, value) in object {
        if key.eq_ignore_ascii_case("verdict") {
            comparison.verdict = value.as_str().map(|s| s.trim().to_uppercase());
            continue;
        }
        if let Some(canonical) = canonical_key(key) {
            let score = match value {
                serde_json::Value::Number(n) => n.as_f64(),
                serde_json::Value::String(s) => s.trim().parse::<f64>().ok(),
                _ => None,
            };
            if let Some(score) = score {
                comparison.subscores.insert(canonical.to_string(), score);
            }
        }
    }

    if comparison.subscores.is_empty() {
        return Err(ServiceError::InvalidResponse(
            "vision reply contained no scores".into(),
        ));
    }
    Ok(comparison)
}

impl ChatVisionClient {
    pub fn new(config: ChatVisionConfig) -> Result<Self, ServiceError> {
        Ok(Self {
            client: build_client(config.timeout)?,
            config,
        })
    }

    pub fn from_env() -> Result<Self, ServiceError> {
        Self::new(ChatVisionConfig::from_env()?)
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }

    fn build_request(
        &self,
        reference: &[u8],
        candidate: &[u8],
        context: &EvaluationContext,
    ) -> ChatRequest<'_> {
        let system = match context.focus {
            ComparisonFocus::FullRubric => RUBRIC_PROMPT,
            ComparisonFocus::IdentityOnly => IDENTITY_PROMPT,
        };

        let mut intro = format!("Subject: {}.", context.subject_name);
        if let Some(prompt) = &context.prompt {
            intro.push_str(&format!(" The candidate was rendered from: \"{}\".", prompt));
        }

        ChatRequest {
            model: &self.config.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: vec![ContentPart::Text {
                        text: system.to_string(),
                    }],
                },
                ChatMessage {
                    role: "user",
                    content: vec![
                        ContentPart::Text { text: intro },
                        ContentPart::Text {
                            text: "REFERENCE:".to_string(),
                        },
                        ContentPart::ImageUrl {
                            image_url: ImageUrl {
                                url: data_uri(reference),
                            },
                        },
                        ContentPart::Text {
                            text: "CANDIDATE:".to_string(),
                        },
                        ContentPart::ImageUrl {
                            image_url: ImageUrl {
                                url: data_uri(candidate),
                            },
                        },
                    ],
                },
            ],
            temperature: 0.0,
            max_tokens: 400,
        }
    }
}

#[async_trait]
impl VisionEvaluationService for ChatVisionClient {
    async fn compare(
        &self,
        reference: &[u8],
        candidate: &[u8],
        context: &EvaluationContext,
    ) -> Result<VisionComparison, ServiceError> {
        let request = self.build_request(reference, candidate, context);

        let response = self
            .client
            .post(format!("{}/chat/completions", self.config.base_url))
            .bearer_auth(&self.config.api_key)
            .header("X-Title", "persona-forge")
            .json(&request)
            .send()
            .await
            .map_err(ServiceError::from_reqwest)?;
        let response = check_status(response).await?;

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| ServiceError::InvalidResponse(e.to_string()))?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| ServiceError::InvalidResponse("empty vision reply".into()))?;

        parse_comparison(&content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_fenced_scores() {
        let reply = "Looks close.\n```json\n{\"identity\": 8, \"structure\": 8, \"technical\": 6, \"verdict\": \"pass\"}\n```";
        let comparison = parse_comparison(reply).unwrap();
        assert_eq!(comparison.subscores["identity"], 8.0);
        assert_eq!(comparison.subscores["technical"], 6.0);
        assert_eq!(comparison.verdict.as_deref(), Some("PASS"));
    }

    #[test]
    fn test_parse_aliased_and_string_scores() {
        let reply = r#"{"identity_score": "7.5", "anatomy": 9, "technical_quality": 8}"#;
        let comparison = parse_comparison(reply).unwrap();
        assert_eq!(comparison.subscores["identity"], 7.5);
        assert_eq!(comparison.subscores["structure"], 9.0);
        assert_eq!(comparison.subscores["technical"], 8.0);
        assert!(comparison.verdict.is_none());
    }

    #[test]
    fn test_parse_without_scores_is_invalid() {
        assert!(matches!(
            parse_comparison(r#"{"verdict": "PASS"}"#),
            Err(ServiceError::InvalidResponse(_))
        ));
        assert!(parse_comparison("I cannot compare these images.").is_err());
    }

    #[test]
    fn test_mime_sniffing() {
        assert_eq!(mime_type(&[0xFF, 0xD8, 0xFF, 0xE0]), "image/jpeg");
        assert_eq!(mime_type(b"RIFF\0\0\0\0WEBPVP8 "), "image/webp");
        assert_eq!(mime_type(b"\x89PNG\r\n"), "image/png");
        assert!(data_uri(&[1, 2, 3]).starts_with("data:image/png;base64,"));
    }

    #[test]
    fn test_request_shape() {
        let client = ChatVisionClient::new(ChatVisionConfig {
            base_url: "https://vision.example.com/v1".into(),
            api_key: "k".into(),
            model: "vision-model".into(),
            timeout: Duration::from_secs(5),
        })
        .unwrap();
        let context =
            EvaluationContext::new("Ava", ComparisonFocus::IdentityOnly).with_prompt("portrait");
        let value = serde_json::to_value(client.build_request(b"ref", b"cand", &context)).unwrap();

        assert_eq!(value["model"], "vision-model");
        let parts = value["messages"][1]["content"].as_array().unwrap();
        assert_eq!(parts.len(), 5);
        assert_eq!(parts[2]["type"], "image_url");
        assert!(parts[0]["text"].as_str().unwrap().contains("portrait"));
    }
}
