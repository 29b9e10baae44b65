//! Retry policy for completion calls
//!
//! Each attempt runs under its own timeout. Transient errors (timeouts,
//! rate limits, network and availability failures) are retried with
//! exponential backoff; permanent errors are returned immediately.

use super::{Completion, CompletionOptions, LLMError, LLMProvider, Message};
use crate::config::LLMConfig;
use sdk::errors::EngineError;
use std::time::Duration;

/// Timeout and backoff settings for one logical completion call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,

    /// Timeout applied to every attempt
    pub attempt_timeout: Duration,

    /// Delay before the second attempt; doubles after each failure
    pub initial_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            attempt_timeout: Duration::from_secs(120),
            initial_backoff: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &LLMConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            attempt_timeout: Duration::from_secs(config.timeout_secs),
            initial_backoff: Duration::from_millis(config.backoff_ms),
        }
    }

    /// Backoff before attempt `attempt` (1-based, attempt 1 has none)
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let factor = 1u32 << (attempt - 2).min(16);
        self.initial_backoff.saturating_mul(factor)
    }
}

/// Call `provider` under `policy`, retrying transient failures.
///
/// The error returned after the last attempt keeps its transient flag so the
/// caller can tell an outage from a rejected request.
pub async fn complete_with_retry(
    provider: &dyn LLMProvider,
    messages: &[Message],
    options: &CompletionOptions,
    policy: &RetryPolicy,
) -> Result<Completion, EngineError> {
    let mut attempt = 0;

    loop {
        attempt += 1;
        let backoff = policy.backoff_for(attempt);
        if !backoff.is_zero() {
            tokio::time::sleep(backoff).await;
        }

        tracing::debug!(
            "Completion attempt {}/{} via {} (timeout: {}s)",
            attempt,
            policy.max_attempts,
            provider.name(),
            policy.attempt_timeout.as_secs()
        );

        let result =
            tokio::time::timeout(policy.attempt_timeout, provider.complete(messages, options))
                .await
                .unwrap_or(Err(LLMError::Timeout));

        match result {
            Ok(completion) => {
                tracing::info!(
                    "Provider {} succeeded on attempt {} ({} tokens)",
                    provider.name(),
                    attempt,
                    completion.tokens
                );
                return Ok(completion);
            }
            Err(e) if e.is_transient() && attempt < policy.max_attempts => {
                tracing::warn!(
                    "Provider {} failed transiently (attempt {}): {}",
                    provider.name(),
                    attempt,
                    e
                );
            }
            Err(e) => {
                tracing::error!("Provider {} failed: {}", provider.name(), e);
                return Err(e.into());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::scripted::ScriptedProvider;

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            attempt_timeout: Duration::from_secs(5),
            initial_backoff: Duration::from_millis(1),
        }
    }

    #[test]
    fn test_backoff_doubles() {
        let policy = RetryPolicy {
            initial_backoff: Duration::from_millis(100),
            ..RetryPolicy::default()
        };
        assert_eq!(policy.backoff_for(1), Duration::ZERO);
        assert_eq!(policy.backoff_for(2), Duration::from_millis(100));
        assert_eq!(policy.backoff_for(3), Duration::from_millis(200));
        assert_eq!(policy.backoff_for(4), Duration::from_millis(400));
    }

    #[tokio::test]
    async fn test_transient_error_is_retried() {
        let provider = ScriptedProvider::new(["plan"]).fail_next(LLMError::RateLimitExceeded);

        let completion = complete_with_retry(
            &provider,
            &[Message::user("goal")],
            &CompletionOptions::default(),
            &fast_policy(3),
        )
        .await
        .unwrap();

        assert_eq!(completion.text, "plan");
        assert_eq!(provider.calls(), 2);
    }

    #[tokio::test]
    async fn test_permanent_error_is_not_retried() {
        let provider = ScriptedProvider::new(["plan"])
            .fail_next(LLMError::AuthenticationFailed("bad key".into()));

        let err = complete_with_retry(
            &provider,
            &[Message::user("goal")],
            &CompletionOptions::default(),
            &fast_policy(3),
        )
        .await
        .unwrap_err();

        assert!(!err.is_transient());
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test]
    async fn test_attempts_exhausted_keeps_transient_flag() {
        let provider = ScriptedProvider::new(Vec::<String>::new())
            .fail_next(LLMError::Timeout)
            .fail_next(LLMError::Timeout);

        let err = complete_with_retry(
            &provider,
            &[Message::user("goal")],
            &CompletionOptions::default(),
            &fast_policy(2),
        )
        .await
        .unwrap_err();

        assert!(err.is_transient());
        assert_eq!(provider.calls(), 2);
    }
}
