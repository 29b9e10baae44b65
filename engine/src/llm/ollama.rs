//! Ollama Completion Provider
//!
//! Implements `LLMProvider` for Ollama, a local model server typically
//! listening at http://localhost:11434. Non-streaming `/api/chat` calls only.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{Completion, CompletionOptions, LLMError, LLMProvider, Message, Result};

/// Ollama provider configuration
#[derive(Debug, Clone)]
pub struct OllamaProvider {
    /// Base URL for Ollama API (typically http://localhost:11434)
    base_url: String,

    /// Model name to use (e.g., "llama3.1:8b")
    model: String,

    /// HTTP client for API requests
    client: Client,
}

impl OllamaProvider {
    /// Create a new Ollama provider
    ///
    /// # Arguments
    /// * `base_url` - Base URL for Ollama API (e.g., "http://localhost:11434")
    /// * `model` - Model name to use (e.g., "llama3.1:8b")
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            model: model.into(),
            client: Client::builder()
                .timeout(Duration::from_secs(300))
                .build()
                .unwrap_or_else(|_| Client::new()),
        }
    }

    fn convert_messages(&self, messages: &[Message]) -> Vec<OllamaMessage> {
        messages
            .iter()
            .map(|msg| OllamaMessage {
                role: msg.role.to_string(),
                content: msg.content.clone(),
            })
            .collect()
    }
}

#[async_trait]
impl LLMProvider for OllamaProvider {
    fn name(&self) -> &str {
        "ollama"
    }

    fn is_local(&self) -> bool {
        true
    }

    async fn complete(
        &self,
        messages: &[Message],
        options: &CompletionOptions,
    ) -> Result<Completion> {
        let ollama_messages = self.convert_messages(messages);

        tracing::debug!(
            "Ollama request: model={}, messages={}, total_chars={}",
            self.model,
            ollama_messages.len(),
            ollama_messages
                .iter()
                .map(|m| m.content.len())
                .sum::<usize>()
        );

        let request = OllamaRequest {
            model: self.model.clone(),
            messages: ollama_messages,
            stream: false,
            options: OllamaOptions {
                temperature: options.temperature,
                num_predict: options.max_tokens,
            },
        };

        let url = format!("{}/api/chat", self.base_url);
        let start = std::time::Instant::now();
        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| LLMError::from_reqwest(e, &self.base_url))?;

        tracing::info!(
            "Ollama response received in {:.1}s",
            start.elapsed().as_secs_f64()
        );

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let error_text = response.text().await.unwrap_or_default();
            return Err(LLMError::from_status(status, error_text));
        }

        let ollama_response: OllamaResponse = response
            .json()
            .await
            .map_err(|e| LLMError::ParseError(format!("Failed to parse Ollama response: {}", e)))?;

        Ok(Completion {
            text: ollama_response.message.content,
            tokens: ollama_response.prompt_eval_count + ollama_response.eval_count,
        })
    }
}

/// Ollama API request format
#[derive(Debug, Serialize)]
struct OllamaRequest {
    model: String,
    messages: Vec<OllamaMessage>,
    stream: bool,
    options: OllamaOptions,
}

#[derive(Debug, Serialize)]
struct OllamaOptions {
    temperature: f32,
    num_predict: u32,
}

/// Ollama message format
#[derive(Debug, Serialize, Deserialize)]
struct OllamaMessage {
    role: String,
    content: String,
}

/// Ollama API response format
#[derive(Debug, Deserialize)]
struct OllamaResponse {
    message: OllamaMessage,
    #[serde(default)]
    prompt_eval_count: u64,
    #[serde(default)]
    eval_count: u64,
}
