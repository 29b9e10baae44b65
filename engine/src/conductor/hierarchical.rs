//! Hierarchical planning
//!
//! Plans form a strict tree: each delegate step of a plan is expanded into a
//! child plan for its sub-goal, pre-order, until the depth ceiling.

use async_trait::async_trait;
use futures::future::BoxFuture;
use sdk::errors::EngineError;
use std::sync::Arc;

use super::planner::{PlanScope, Planner};
use super::types::{Goal, Plan, StepAction, StepRecord};
use crate::memory::MemorySnapshot;
use crate::skills::SkillRegistry;

pub struct HierarchicalPlanner {
    inner: Arc<dyn Planner>,
    max_depth: usize,
}

impl HierarchicalPlanner {
    pub fn new(inner: Arc<dyn Planner>, max_depth: usize) -> Self {
        Self { inner, max_depth }
    }

    fn expand<'a>(
        &'a self,
        goal: &'a Goal,
        memory: &'a MemorySnapshot,
        registry: &'a SkillRegistry,
        prior: &'a [StepRecord],
        scope: PlanScope,
    ) -> BoxFuture<'a, Result<Plan, EngineError>> {
        Box::pin(async move {
            if scope.depth > self.max_depth {
                return Err(EngineError::PlanDepthExceeded {
                    depth: scope.depth,
                    limit: self.max_depth,
                });
            }

            let mut plan = self.inner.propose(goal, memory, registry, prior, &scope).await?;

            let delegations: Vec<(String, String)> = plan
                .steps
                .iter()
                .filter_map(|step| match &step.action {
                    StepAction::Delegate { goal } => Some((step.id.clone(), goal.clone())),
                    StepAction::Invoke { .. } => None,
                })
                .collect();

            for (step_id, sub_goal) in delegations {
                let child_goal = goal.delegate(sub_goal);
                tracing::debug!(
                    "Expanding {} at depth {}: {}",
                    step_id,
                    scope.depth + 1,
                    child_goal.text
                );
                let child = self
                    .expand(&child_goal, memory, registry, &[], scope.child(&step_id))
                    .await?;
                plan.children.insert(step_id, child);
            }

            Ok(plan)
        })
    }
}

#[async_trait]
impl Planner for HierarchicalPlanner {
    async fn propose(
        &self,
        goal: &Goal,
        memory: &MemorySnapshot,
        registry: &SkillRegistry,
        prior: &[StepRecord],
        scope: &PlanScope,
    ) -> Result<Plan, EngineError> {
        self.expand(goal, memory, registry, prior, scope.clone()).await
    }

    fn tokens_used(&self) -> u64 {
        self.inner.tokens_used()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conductor::planner::LlmPlanner;
    use crate::llm::retry::RetryPolicy;
    use crate::llm::scripted::ScriptedProvider;
    use crate::llm::CompletionOptions;
    use crate::skills::summarize::SummarizeSkill;

    fn registry() -> SkillRegistry {
        let mut registry = SkillRegistry::new();
        registry.register(Arc::new(SummarizeSkill::new())).unwrap();
        registry
    }

    fn planner(replies: Vec<&str>, max_depth: usize) -> HierarchicalPlanner {
        let provider = Arc::new(ScriptedProvider::new(replies));
        let inner = LlmPlanner::new(provider, CompletionOptions::default(), RetryPolicy::default())
            .with_delegation();
        HierarchicalPlanner::new(Arc::new(inner), max_depth)
    }

    const MANAGER: &str = r#"[{"id": "part", "delegate": "summarize part one"},
        {"id": "final", "skill": "text.summarize", "arguments": {"text": "{{part.text}}"}, "depends_on": ["part"]}]"#;
    const WORKER: &str = r#"[{"id": "s", "skill": "text.summarize", "arguments": {"text": "one. two."}}]"#;

    #[tokio::test]
    async fn test_delegations_expand_into_child_plans() {
        let plan = planner(vec![MANAGER, WORKER], 2)
            .propose(&Goal::new("summarize"), &MemorySnapshot::default(), &registry(), &[], &PlanScope::root(1))
            .await
            .unwrap();

        let child = &plan.children["part"];
        assert_eq!(child.id, "plan-1/part");
        assert_eq!(child.depth, 1);
        assert_eq!(child.goal, "summarize part one");
        assert_eq!(plan.walk().len(), 2);
    }

    #[tokio::test]
    async fn test_depth_ceiling_is_enforced() {
        let recursive = r#"[{"id": "deeper", "delegate": "go deeper"}]"#;
        let err = planner(vec![recursive; 5], 1)
            .propose(&Goal::new("loop"), &MemorySnapshot::default(), &registry(), &[], &PlanScope::root(1))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::PlanDepthExceeded { depth: 2, limit: 1 }));
    }
}
