use super::{Completion, CompletionOptions, LLMError, LLMProvider, Message};
use crate::config::OpenAIConfig;
use async_trait::async_trait;
use serde_json::json;

/// OpenAI-compatible chat completions provider.
///
/// The API key is read from the environment variable named in the config at
/// call time, so rotating the key does not require a restart.
pub struct OpenAIProvider {
    config: OpenAIConfig,
    client: reqwest::Client,
}

impl OpenAIProvider {
    pub fn new(config: OpenAIConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    fn api_key(&self) -> super::Result<String> {
        std::env::var(&self.config.api_key_env).map_err(|_| {
            LLMError::AuthenticationFailed(format!("{} is not set", self.config.api_key_env))
        })
    }
}

#[async_trait]
impl LLMProvider for OpenAIProvider {
    fn name(&self) -> &str {
        "openai"
    }

    fn is_local(&self) -> bool {
        false
    }

    async fn complete(
        &self,
        messages: &[Message],
        options: &CompletionOptions,
    ) -> super::Result<Completion> {
        let api_key = self.api_key()?;
        let url = format!("{}/chat/completions", self.config.base_url);

        let api_messages: Vec<_> = messages
            .iter()
            .map(|msg| {
                json!({
                    "role": msg.role.to_string(),
                    "content": msg.content
                })
            })
            .collect();

        let payload = json!({
            "model": self.config.model,
            "messages": api_messages,
            "temperature": options.temperature,
            "max_tokens": options.max_tokens,
        });

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", api_key))
            .header("Content-Type", "application/json")
            .json(&payload)
            .send()
            .await
            .map_err(|e| LLMError::from_reqwest(e, &self.config.base_url))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let text = response.text().await.unwrap_or_default();
            return Err(LLMError::from_status(status, text));
        }

        let data: serde_json::Value = response
            .json()
            .await
            .map_err(|e| LLMError::ParseError(e.to_string()))?;

        let content = data
            .get("choices")
            .and_then(|c| c.as_array())
            .and_then(|c| c.first())
            .and_then(|choice| choice.get("message"))
            .and_then(|message| message.get("content"))
            .and_then(|c| c.as_str())
            .ok_or_else(|| LLMError::ParseError("No message content in response".to_string()))?;

        let tokens = data
            .get("usage")
            .and_then(|u| u.get("total_tokens"))
            .and_then(|t| t.as_u64())
            .unwrap_or(0);

        Ok(Completion {
            text: content.to_string(),
            tokens,
        })
    }
}
