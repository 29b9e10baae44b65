//! `rag.search`: retrieve long-term memory entries relevant to a query

use async_trait::async_trait;
use sdk::errors::EngineError;
use sdk::skill::{Skill, SkillContext};
use sdk::types::{SideEffectClass, SkillContract};
use serde_json::{json, Value};
use std::sync::Arc;

use crate::memory::MemoryStore;

pub struct RagSearchSkill {
    contract: SkillContract,
    memory: Arc<dyn MemoryStore>,
    default_k: usize,
}

impl RagSearchSkill {
    pub fn new(memory: Arc<dyn MemoryStore>, default_k: usize) -> Self {
        Self {
            contract: SkillContract::new(
                "rag.search",
                "Search long-term memory for entries relevant to a query",
                json!({
                    "type": "object",
                    "properties": {
                        "query": {"type": "string", "minLength": 1},
                        "k": {"type": "integer", "minimum": 1, "maximum": 50}
                    },
                    "required": ["query"],
                    "additionalProperties": false
                }),
                json!({
                    "type": "object",
                    "properties": {
                        "query": {"type": "string"},
                        "results": {
                            "type": "array",
                            "items": {
                                "type": "object",
                                "properties": {
                                    "key": {"type": "string"},
                                    "content": {"type": "string"},
                                    "score": {"type": "number"}
                                },
                                "required": ["key", "content", "score"]
                            }
                        },
                        "count": {"type": "integer", "minimum": 0}
                    },
                    "required": ["query", "results", "count"]
                }),
                SideEffectClass::ReadOnly,
            ),
            memory,
            default_k: default_k.max(1),
        }
    }
}

#[async_trait]
impl Skill for RagSearchSkill {
    fn contract(&self) -> &SkillContract {
        &self.contract
    }

    async fn invoke(&self, _ctx: &SkillContext, args: Value) -> Result<Value, EngineError> {
        let query = args
            .get("query")
            .and_then(Value::as_str)
            .ok_or_else(|| EngineError::Validation("query must be a string".into()))?;
        let k = args
            .get("k")
            .and_then(Value::as_u64)
            .map(|k| k as usize)
            .unwrap_or(self.default_k);

        let hits = self.memory.query_long_term(query, k).await?;
        tracing::debug!("rag.search '{}' returned {} hits", query, hits.len());

        Ok(json!({
            "query": query,
            "count": hits.len(),
            "results": hits,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{InMemoryStore, LongTermEntry};
    use sdk::types::ResourceLimits;
    use std::path::PathBuf;
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn test_search_returns_ranked_hits() {
        let store = Arc::new(InMemoryStore::new());
        store
            .upsert_long_term(LongTermEntry {
                key: "tokio".into(),
                content: "tokio is an async runtime".into(),
                metadata: json!({}),
                updated_at: 1,
            })
            .await
            .unwrap();

        let skill = RagSearchSkill::new(store, 5);
        let ctx = SkillContext::new(
            "run_1",
            "step_1",
            PathBuf::from("/tmp"),
            ResourceLimits::default(),
            CancellationToken::new(),
        );

        let out = skill
            .invoke(&ctx, json!({"query": "async runtime"}))
            .await
            .unwrap();

        assert_eq!(out["count"], 1);
        assert_eq!(out["results"][0]["key"], "tokio");
    }
}
