//! Generation provider capability and its error taxonomy.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::config::ProviderEndpoint;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider returned HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("connection refused: {0}")]
    ConnectionRefused(String),

    #[error("provider request timed out")]
    Timeout,

    #[error("network error: {0}")]
    Network(String),

    #[error("invalid provider response: {0}")]
    InvalidResponse(String),

    #[error("provider not configured: {0}")]
    NotConfigured(String),

    #[error("generation cancelled")]
    Cancelled,
}

impl ProviderError {
    /// 429/500/502/503, connection refused, timeout or a generic network failure.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Http { status, .. } => matches!(status, 429 | 500 | 502 | 503),
            Self::ConnectionRefused(_) | Self::Timeout | Self::Network(_) => true,
            Self::InvalidResponse(msg) => is_transient_message(msg),
            Self::NotConfigured(_) | Self::Cancelled => false,
        }
    }

    pub fn from_reqwest(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout
        } else if e.is_connect() {
            Self::ConnectionRefused(e.to_string())
        } else if let Some(status) = e.status() {
            Self::Http {
                status: status.as_u16(),
                body: e.to_string(),
            }
        } else if e.is_decode() {
            Self::InvalidResponse(e.to_string())
        } else {
            Self::Network(e.to_string())
        }
    }
}

/// Classify an error that only arrives as text (wrapped or proxied failures).
pub fn is_transient_message(msg: &str) -> bool {
    let lower = msg.to_lowercase();
    ["429", "500", "502", "503"]
        .iter()
        .any(|code| lower.contains(code))
        || lower.contains("rate limit")
        || lower.contains("overloaded")
        || lower.contains("econnrefused")
        || lower.contains("connection refused")
        || lower.contains("timed out")
        || lower.contains("timeout")
        || lower.contains("network")
        || lower.contains("fetch failed")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct GenerationRequest {
    pub system: String,
    pub messages: Vec<ChatMessage>,
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone, Default)]
pub struct GenerationResponse {
    pub text: String,
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// What the session manager needs from a model endpoint.
#[async_trait]
pub trait GenerationProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn generate(
        &self,
        request: &GenerationRequest,
    ) -> Result<GenerationResponse, ProviderError>;
}

/// Build a provider for `endpoint`. The API key is read from `endpoint.api_key_env`.
pub fn create_provider(
    endpoint: &ProviderEndpoint,
    timeout: Duration,
) -> Result<Arc<dyn GenerationProvider>, ProviderError> {
    let api_key = std::env::var(&endpoint.api_key_env).unwrap_or_default();
    let http = reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| ProviderError::NotConfigured(e.to_string()))?;

    match endpoint.kind.as_str() {
        "anthropic" => Ok(Arc::new(super::anthropic::AnthropicProvider::new(
            endpoint, api_key, http,
        ))),
        "openai" | "openai-compatible" | "openrouter" => Ok(Arc::new(
            super::openai::OpenAiCompatibleProvider::new(endpoint, api_key, http),
        )),
        other => Err(ProviderError::NotConfigured(format!(
            "unknown provider kind: {other}. Supported: anthropic, openai-compatible"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        for status in [429, 500, 502, 503] {
            assert!(ProviderError::Http {
                status,
                body: String::new()
            }
            .is_transient());
        }
        for status in [400, 401, 404, 504] {
            assert!(!ProviderError::Http {
                status,
                body: String::new()
            }
            .is_transient());
        }
        assert!(ProviderError::Timeout.is_transient());
        assert!(ProviderError::ConnectionRefused("x".into()).is_transient());
        assert!(ProviderError::Network("reset".into()).is_transient());
        assert!(!ProviderError::NotConfigured("key".into()).is_transient());
        assert!(!ProviderError::Cancelled.is_transient());
    }

    #[test]
    fn message_classifier() {
        assert!(is_transient_message("upstream said 503 Service Unavailable"));
        assert!(is_transient_message("connect ECONNREFUSED 127.0.0.1:443"));
        assert!(is_transient_message("Request timed out"));
        assert!(!is_transient_message("invalid x-api-key"));
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let endpoint = ProviderEndpoint {
            kind: "carrier-pigeon".into(),
            ..Default::default()
        };
        assert!(create_provider(&endpoint, Duration::from_secs(1)).is_err());
    }
}
