//! HTTP provider speaking the OpenAI-style chat-completions wire format.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SwitchboardError};

use super::{Generation, Provider};

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct Usage {
    total_tokens: Option<u64>,
}

/// Provider backed by an OpenAI-compatible chat-completions endpoint.
#[derive(Clone)]
pub struct HttpProvider {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
}

impl HttpProvider {
    /// Create a provider for the given base endpoint and API key.
    ///
    /// The endpoint is the base URL (e.g. "https://api.openai.com"); the
    /// chat-completions path is appended per call.
    pub fn new(endpoint: &str, api_key: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        }
    }
}

#[async_trait]
impl Provider for HttpProvider {
    #[tracing::instrument(skip(self, prompt), fields(model = %model, prompt_len = prompt.len()))]
    async fn generate(
        &self,
        model: &str,
        prompt: &str,
        temperature: Option<f32>,
    ) -> Result<Generation> {
        let url = format!("{}/v1/chat/completions", self.endpoint);
        let body = ChatRequest {
            model,
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
            temperature,
        };

        tracing::debug!(url = %url, "executing provider request");

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            tracing::warn!(model = %model, status = %status, "provider returned an error");
            return Err(SwitchboardError::ProviderExecution {
                model: model.to_string(),
                message: format!("upstream returned {status}: {}", truncate(&detail, 200)),
            });
        }

        let parsed: ChatResponse = response.json().await?;
        let text = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| SwitchboardError::ProviderExecution {
                model: model.to_string(),
                message: "upstream returned an empty completion".to_string(),
            })?;

        let tokens_used = parsed.usage.and_then(|u| u.total_tokens);

        tracing::info!(
            model = %model,
            response_len = text.len(),
            tokens_used = ?tokens_used,
            "provider request completed"
        );

        Ok(Generation { text, tokens_used })
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
