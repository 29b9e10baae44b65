//! Scripted Completion Provider
//!
//! Returns queued completions in order without any network access. Serves as
//! the offline provider, as the replay provider (fed with completions
//! recovered from a trace), and as the test double for planner tests.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;

use super::{Completion, CompletionOptions, LLMError, LLMProvider, Message, Result};

/// One queued reply
#[derive(Debug)]
enum Reply {
    Text(String),
    Error(LLMError),
}

/// Provider that replays a fixed script of replies
#[derive(Debug)]
pub struct ScriptedProvider {
    name: String,
    replies: Mutex<VecDeque<Reply>>,
    prompts: Mutex<Vec<Vec<Message>>>,
}

impl ScriptedProvider {
    /// Create a provider that answers with `completions` in order
    pub fn new<I, S>(completions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::named("scripted", completions)
    }

    /// Create a provider with a custom name, e.g. "replay"
    pub fn named<I, S>(name: impl Into<String>, completions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            replies: Mutex::new(
                completions
                    .into_iter()
                    .map(|c| Reply::Text(c.into()))
                    .collect(),
            ),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Queue an error ahead of the remaining replies
    pub fn fail_next(self, err: LLMError) -> Self {
        if let Ok(mut replies) = self.replies.lock() {
            replies.push_front(Reply::Error(err));
        }
        self
    }

    /// Number of prompts received so far
    pub fn calls(&self) -> usize {
        self.prompts.lock().map(|p| p.len()).unwrap_or(0)
    }

    /// Prompts received so far, in order
    pub fn prompts(&self) -> Vec<Vec<Message>> {
        self.prompts.lock().map(|p| p.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl LLMProvider for ScriptedProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_local(&self) -> bool {
        true
    }

    async fn complete(
        &self,
        messages: &[Message],
        _options: &CompletionOptions,
    ) -> Result<Completion> {
        let served = {
            let mut prompts = self
                .prompts
                .lock()
                .map_err(|_| LLMError::ProviderUnavailable("script lock poisoned".into()))?;
            prompts.push(messages.to_vec());
            prompts.len() - 1
        };

        let reply = self
            .replies
            .lock()
            .map_err(|_| LLMError::ProviderUnavailable("script lock poisoned".into()))?
            .pop_front();

        match reply {
            Some(Reply::Text(text)) => {
                let tokens = (text.len() / 4) as u64;
                Ok(Completion { text, tokens })
            }
            Some(Reply::Error(err)) => Err(err),
            None => Err(LLMError::ScriptExhausted(served)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_replies_in_order_then_exhausts() {
        let provider = ScriptedProvider::new(["first", "second"]);
        let opts = CompletionOptions::default();

        let a = provider.complete(&[Message::user("a")], &opts).await.unwrap();
        let b = provider.complete(&[Message::user("b")], &opts).await.unwrap();
        let c = provider.complete(&[Message::user("c")], &opts).await;

        assert_eq!(a.text, "first");
        assert_eq!(b.text, "second");
        assert!(matches!(c, Err(LLMError::ScriptExhausted(2))));
        assert_eq!(provider.calls(), 3);
        assert_eq!(provider.prompts()[1][0].content, "b");
    }

    #[tokio::test]
    async fn test_fail_next_precedes_script() {
        let provider = ScriptedProvider::new(["ok"]).fail_next(LLMError::Timeout);
        let opts = CompletionOptions::default();

        assert!(provider.complete(&[], &opts).await.is_err());
        assert_eq!(provider.complete(&[], &opts).await.unwrap().text, "ok");
    }
}
