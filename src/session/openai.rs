use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::provider::{
    GenerationProvider, GenerationRequest, GenerationResponse, ProviderError, Role,
};
use crate::config::ProviderEndpoint;

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    max_tokens: u32,
}

#[derive(Serialize)]
struct WireMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
    #[serde(default)]
    model: String,
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct Usage {
    prompt_tokens: u64,
    completion_tokens: u64,
}

/// Any `/chat/completions` endpoint (OpenAI, OpenRouter, local gateways).
pub struct OpenAiCompatibleProvider {
    model: String,
    url: String,
    api_key: String,
    max_tokens: u32,
    http: reqwest::Client,
}

impl OpenAiCompatibleProvider {
    pub fn new(endpoint: &ProviderEndpoint, api_key: String, http: reqwest::Client) -> Self {
        Self {
            model: endpoint.model.clone(),
            url: format!("{}/chat/completions", endpoint.base_url.trim_end_matches('/')),
            api_key,
            max_tokens: endpoint.max_tokens,
            http,
        }
    }
}

#[async_trait]
impl GenerationProvider for OpenAiCompatibleProvider {
    fn name(&self) -> &str {
        "openai-compatible"
    }

    async fn generate(
        &self,
        request: &GenerationRequest,
    ) -> Result<GenerationResponse, ProviderError> {
        let mut messages = Vec::with_capacity(request.messages.len() + 1);
        messages.push(WireMessage {
            role: "system",
            content: &request.system,
        });
        messages.extend(request.messages.iter().map(|m| WireMessage {
            role: match m.role {
                Role::User => "user",
                Role::Assistant => "assistant",
            },
            content: &m.content,
        }));

        let body = ChatRequest {
            model: &self.model,
            messages,
            max_tokens: request.max_tokens.unwrap_or(self.max_tokens),
        };

        let mut builder = self.http.post(&self.url).json(&body);
        if !self.api_key.is_empty() {
            builder = builder.bearer_auth(&self.api_key);
        }
        let response = builder.send().await.map_err(ProviderError::from_reqwest)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Http {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: ChatResponse = response.json().await.map_err(ProviderError::from_reqwest)?;
        let text = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| ProviderError::InvalidResponse("no choices in response".into()))?;
        let (input_tokens, output_tokens) = parsed
            .usage
            .map(|u| (u.prompt_tokens, u.completion_tokens))
            .unwrap_or_default();

        Ok(GenerationResponse {
            text,
            model: if parsed.model.is_empty() { self.model.clone() } else { parsed.model },
            input_tokens,
            output_tokens,
        })
    }
}
