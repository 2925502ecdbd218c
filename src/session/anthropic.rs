use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::provider::{
    ChatMessage, GenerationProvider, GenerationRequest, GenerationResponse, ProviderError, Role,
};
use crate::config::ProviderEndpoint;

const ANTHROPIC_VERSION: &str = "2023-06-01";

#[derive(Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    system: &'a str,
    messages: Vec<WireMessage<'a>>,
    max_tokens: u32,
}

#[derive(Serialize)]
struct WireMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
    model: String,
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: String,
}

#[derive(Deserialize)]
struct Usage {
    input_tokens: u64,
    output_tokens: u64,
}

/// Anthropic Messages API.
pub struct AnthropicProvider {
    model: String,
    url: String,
    api_key: String,
    max_tokens: u32,
    http: reqwest::Client,
}

impl AnthropicProvider {
    pub fn new(endpoint: &ProviderEndpoint, api_key: String, http: reqwest::Client) -> Self {
        Self {
            model: endpoint.model.clone(),
            url: format!("{}/v1/messages", endpoint.base_url.trim_end_matches('/')),
            api_key,
            max_tokens: endpoint.max_tokens,
            http,
        }
    }

    fn wire_messages(messages: &[ChatMessage]) -> Vec<WireMessage<'_>> {
        messages
            .iter()
            .map(|m| WireMessage {
                role: match m.role {
                    Role::User => "user",
                    Role::Assistant => "assistant",
                },
                content: &m.content,
            })
            .collect()
    }
}

#[async_trait]
impl GenerationProvider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    async fn generate(
        &self,
        request: &GenerationRequest,
    ) -> Result<GenerationResponse, ProviderError> {
        if self.api_key.is_empty() {
            return Err(ProviderError::NotConfigured("anthropic api key is empty".into()));
        }
        let body = MessagesRequest {
            model: &self.model,
            system: &request.system,
            messages: Self::wire_messages(&request.messages),
            max_tokens: request.max_tokens.unwrap_or(self.max_tokens),
        };

        let response = self
            .http
            .post(&self.url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(ProviderError::from_reqwest)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Http {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: MessagesResponse = response.json().await.map_err(ProviderError::from_reqwest)?;
        let text = parsed
            .content
            .into_iter()
            .filter(|c| c.kind == "text")
            .map(|c| c.text)
            .collect::<Vec<_>>()
            .join("");
        let (input_tokens, output_tokens) = parsed
            .usage
            .map(|u| (u.input_tokens, u.output_tokens))
            .unwrap_or_default();

        Ok(GenerationResponse {
            text,
            model: parsed.model,
            input_tokens,
            output_tokens,
        })
    }
}
