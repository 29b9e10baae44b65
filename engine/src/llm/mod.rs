//! Completion Provider Abstraction Layer
//!
//! This module provides a common interface for text-completion backends
//! (Ollama, OpenAI-compatible APIs, and a scripted provider for offline runs
//! and replay). The planner only ever sees the `LLMProvider` trait.
//!
//! Provider errors are classified as transient or permanent. Transient errors
//! are retried with backoff by `retry::complete_with_retry`; permanent errors
//! surface as `EngineError::Provider` and abort the current planning call.

use async_trait::async_trait;
use sdk::errors::EngineError;
use serde::{Deserialize, Serialize};
use std::fmt;

pub mod ollama;
pub mod openai;
pub mod retry;
pub mod scripted;

/// Result type for provider operations
pub type Result<T> = std::result::Result<T, LLMError>;

/// Errors that can occur during completion calls
#[derive(Debug, thiserror::Error)]
pub enum LLMError {
    #[error("Provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Rate limit exceeded")]
    RateLimitExceeded,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Timeout")]
    Timeout,

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Script exhausted after {0} completions")]
    ScriptExhausted(usize),
}

impl LLMError {
    /// Whether a retry has a chance of succeeding
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            LLMError::ProviderUnavailable(_)
                | LLMError::RateLimitExceeded
                | LLMError::NetworkError(_)
                | LLMError::Timeout
        )
    }

    /// Map a non-success HTTP status to an error
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            401 | 403 => LLMError::AuthenticationFailed(body),
            429 => LLMError::RateLimitExceeded,
            500..=599 => LLMError::ProviderUnavailable(format!("HTTP {}: {}", status, body)),
            _ => LLMError::InvalidRequest(format!("HTTP {}: {}", status, body)),
        }
    }

    /// Map a reqwest transport error
    pub fn from_reqwest(err: reqwest::Error, base_url: &str) -> Self {
        if err.is_timeout() {
            LLMError::Timeout
        } else if err.is_connect() {
            LLMError::ProviderUnavailable(format!("Cannot connect to {}", base_url))
        } else {
            LLMError::NetworkError(err.to_string())
        }
    }
}

impl From<LLMError> for EngineError {
    fn from(err: LLMError) -> Self {
        EngineError::Provider {
            transient: err.is_transient(),
            message: err.to_string(),
        }
    }
}

/// Message in a completion prompt
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    /// Role of the message sender
    pub role: MessageRole,

    /// Content of the message
    pub content: String,
}

impl Message {
    /// Create a new user message
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }

    /// Create a new assistant message
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
        }
    }

    /// Create a new system message
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
        }
    }
}

/// Role of a message sender
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

impl fmt::Display for MessageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageRole::User => write!(f, "user"),
            MessageRole::Assistant => write!(f, "assistant"),
            MessageRole::System => write!(f, "system"),
        }
    }
}

/// Sampling options passed to every completion call
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionOptions {
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Default for CompletionOptions {
    fn default() -> Self {
        Self {
            temperature: 0.2,
            max_tokens: 2000,
        }
    }
}

/// Raw completion returned by a provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Completion {
    /// Completion text, verbatim
    pub text: String,

    /// Tokens consumed (prompt + completion) when the provider reports them
    #[serde(default)]
    pub tokens: u64,
}

impl Completion {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            tokens: 0,
        }
    }
}

/// Completion provider trait that all backends implement
#[async_trait]
pub trait LLMProvider: Send + Sync {
    /// Returns the name of the provider (e.g., "ollama", "openai")
    fn name(&self) -> &str;

    /// Returns true if this provider runs on the local machine
    fn is_local(&self) -> bool;

    /// Complete a prompt
    ///
    /// # Arguments
    /// * `messages` - Prompt as a sequence of role-tagged messages
    /// * `options` - Sampling options
    async fn complete(&self, messages: &[Message], options: &CompletionOptions)
        -> Result<Completion>;
}
