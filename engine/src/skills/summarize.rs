//! `text.summarize`: deterministic extractive summary
//!
//! Keeps the leading sentences of the input. No model call is involved, so
//! the same text always yields the same summary.

use async_trait::async_trait;
use sdk::errors::EngineError;
use sdk::skill::{Skill, SkillContext};
use sdk::types::{SideEffectClass, SkillContract};
use serde_json::{json, Value};

const DEFAULT_SENTENCES: usize = 3;

/// First `max_sentences` sentences of `text`, whitespace collapsed
pub fn summarize(text: &str, max_sentences: usize) -> String {
    let normalized = text.split_whitespace().collect::<Vec<_>>().join(" ");

    let mut sentences = Vec::new();
    let mut start = 0;
    let chars: Vec<(usize, char)> = normalized.char_indices().collect();
    for (i, &(idx, c)) in chars.iter().enumerate() {
        let at_boundary = matches!(c, '.' | '!' | '?')
            && chars.get(i + 1).map_or(true, |&(_, next)| next == ' ');
        if at_boundary {
            let end = idx + c.len_utf8();
            let sentence = normalized[start..end].trim();
            if !sentence.is_empty() {
                sentences.push(sentence.to_string());
            }
            start = end;
            if sentences.len() == max_sentences {
                break;
            }
        }
    }

    if sentences.len() < max_sentences {
        let rest = normalized[start..].trim();
        if !rest.is_empty() {
            sentences.push(rest.to_string());
        }
    }

    sentences.join(" ")
}

pub struct SummarizeSkill {
    contract: SkillContract,
}

impl Default for SummarizeSkill {
    fn default() -> Self {
        Self::new()
    }
}

impl SummarizeSkill {
    pub fn new() -> Self {
        Self {
            contract: SkillContract::new(
                "text.summarize",
                "Summarize text by keeping its leading sentences",
                json!({
                    "type": "object",
                    "properties": {
                        "text": {"type": "string"},
                        "max_sentences": {"type": "integer", "minimum": 1, "maximum": 20}
                    },
                    "required": ["text"],
                    "additionalProperties": false
                }),
                json!({
                    "type": "object",
                    "properties": {"summary": {"type": "string", "minLength": 1}},
                    "required": ["summary"]
                }),
                SideEffectClass::ReadOnly,
            ),
        }
    }
}

#[async_trait]
impl Skill for SummarizeSkill {
    fn contract(&self) -> &SkillContract {
        &self.contract
    }

    async fn invoke(&self, _ctx: &SkillContext, args: Value) -> Result<Value, EngineError> {
        let text = args
            .get("text")
            .and_then(Value::as_str)
            .ok_or_else(|| EngineError::Validation("text must be a string".into()))?;
        let max_sentences = args
            .get("max_sentences")
            .and_then(Value::as_u64)
            .map(|n| n as usize)
            .unwrap_or(DEFAULT_SENTENCES);

        Ok(json!({ "summary": summarize(text, max_sentences) }))
    }
}
