//! Shared HTTP plumbing for the service clients.

use std::time::Duration;

use reqwest::{Client, Response};
use serde::Deserialize;

use crate::error::ServiceError;

pub(crate) fn build_client(timeout: Duration) -> Result<Client, ServiceError> {
    Client::builder()
        .timeout(timeout)
        .build()
        .map_err(ServiceError::from_reqwest)
}

/// Reads a required environment variable.
pub(crate) fn require_env(service: &str, var: &str) -> Result<String, ServiceError> {
    match std::env::var(var) {
        Ok(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(ServiceError::not_configured(
            service,
            format!("{} is not set", var),
        )),
    }
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ErrorBody {
    Message { message: String },
    Text(String),
}

/// Passes successful responses through and maps the rest to [`ServiceError`].
pub(crate) async fn check_status(response: Response) -> Result<Response, ServiceError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let text = response
        .text()
        .await
        .unwrap_or_else(|_| "Failed to read error response".to_string());

    let message = match serde_json::from_str::<ErrorEnvelope>(&text) {
        Ok(ErrorEnvelope {
            error: ErrorBody::Message { message },
        }) => message,
        Ok(ErrorEnvelope {
            error: ErrorBody::Text(message),
        }) => message,
        Err(_) => text,
    };

    Err(ServiceError::from_status(status.as_u16(), message))
}

/// Masks an API key for logging, keeping four characters at each end.
pub fn mask_key(key: &str) -> String {
    if key.len() <= 8 {
        "*".repeat(key.len())
    } else {
        format!("{}...{}", &key[..4], &key[key.len() - 4..])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_key() {
        assert_eq!(mask_key("abc"), "***");
        assert_eq!(mask_key("sk-1234567890abcdef"), "sk-1...cdef");
    }

    #[test]
    fn test_require_env_missing() {
        let err = require_env("Vision service", "PERSONA_FORGE_TEST_UNSET_VAR").unwrap_err();
        assert!(matches!(err, ServiceError::NotConfigured { .. }));
        assert!(err.to_string().contains("PERSONA_FORGE_TEST_UNSET_VAR"));
    }

    #[test]
    fn test_error_envelope_shapes() {
        let structured: ErrorEnvelope =
            serde_json::from_str(r#"{"error": {"message": "quota"}}"#).unwrap();
        assert!(matches!(structured.error, ErrorBody::Message { message } if message == "quota"));

        let flat: ErrorEnvelope = serde_json::from_str(r#"{"error": "bad input"}"#).unwrap();
        assert!(matches!(flat.error, ErrorBody::Text(text) if text == "bad input"));
    }
}
