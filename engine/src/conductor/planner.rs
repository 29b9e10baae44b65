//! Conductor Planner
//!
//! Asks the completion provider to decompose a goal into a DAG of skill
//! calls. The provider's reply is kept verbatim in the plan so replay can
//! rebuild the exact same plan without calling the provider again.

use async_trait::async_trait;
use sdk::errors::EngineError;
use serde::Deserialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::conductor::types::{Goal, Plan, Step, StepAction, StepRecord};
use crate::llm::retry::{complete_with_retry, RetryPolicy};
use crate::llm::{CompletionOptions, LLMProvider, Message};
use crate::memory::MemorySnapshot;
use crate::skills::SkillRegistry;

/// Where a plan sits in the run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanScope {
    pub plan_id: String,
    pub iteration: u32,
    pub depth: usize,
}

impl PlanScope {
    pub fn root(iteration: u32) -> Self {
        Self {
            plan_id: Plan::root_id(iteration),
            iteration,
            depth: 0,
        }
    }

    /// Scope of the child plan expanding `step_id` of this plan
    pub fn child(&self, step_id: &str) -> Self {
        Self {
            plan_id: Plan::child_id(&self.plan_id, step_id),
            iteration: self.iteration,
            depth: self.depth + 1,
        }
    }
}

#[async_trait]
pub trait Planner: Send + Sync {
    /// Propose a plan for `goal`.
    ///
    /// `prior` holds the previous iteration's step records when replanning.
    async fn propose(
        &self,
        goal: &Goal,
        memory: &MemorySnapshot,
        registry: &SkillRegistry,
        prior: &[StepRecord],
        scope: &PlanScope,
    ) -> Result<Plan, EngineError>;

    /// Provider tokens consumed so far
    fn tokens_used(&self) -> u64 {
        0
    }
}

/// Step as the model writes it
#[derive(Debug, Deserialize)]
struct RawPlanStep {
    id: Option<String>,
    skill: Option<String>,
    #[serde(default)]
    arguments: Option<Value>,
    #[serde(default, alias = "dependencies")]
    depends_on: Vec<String>,
    #[serde(default)]
    best_effort: Vec<String>,
    #[serde(default)]
    description: String,
    delegate: Option<String>,
}

pub struct LlmPlanner {
    provider: Arc<dyn LLMProvider>,
    options: CompletionOptions,
    retry: RetryPolicy,
    allow_delegation: bool,
    tokens: AtomicU64,
}

impl LlmPlanner {
    pub fn new(provider: Arc<dyn LLMProvider>, options: CompletionOptions, retry: RetryPolicy) -> Self {
        Self {
            provider,
            options,
            retry,
            allow_delegation: false,
            tokens: AtomicU64::new(0),
        }
    }

    /// Let the model emit `delegate` steps (hierarchical mode)
    pub fn with_delegation(mut self) -> Self {
        self.allow_delegation = true;
        self
    }

    fn system_prompt(&self, registry: &SkillRegistry) -> String {
        let mut prompt = String::from(
            "You are the Cairn planner. Decompose the user's goal into steps that call the skills below.\n\
            Output ONLY a JSON array of steps. Each step object has:\n\
            - \"id\": short unique identifier\n\
            - \"skill\": name of one skill from the list\n\
            - \"arguments\": object matching the skill's input schema\n\
            - \"depends_on\": ids of steps that must succeed first\n\
            - \"best_effort\": subset of depends_on whose failure may be ignored\n\
            - \"description\": one line explaining the step\n\
            A string argument may use the result of a dependency as \"{{step_id.field}}\".\n",
        );
        if self.allow_delegation {
            prompt.push_str(
                "Instead of \"skill\" and \"arguments\", a step may set \"delegate\" to a sub-goal \
                that is planned separately.\n",
            );
        }

        prompt.push_str("\nAvailable skills:\n");
        for contract in registry.list() {
            prompt.push_str(&format!(
                "- {} ({}): {}\n  input schema: {}\n",
                contract.name, contract.side_effect, contract.description, contract.input_schema
            ));
        }
        prompt.push_str(
            "\nExample output:\n\
            [{\"id\":\"fetch\",\"skill\":\"web.fetch\",\"arguments\":{\"url\":\"https://example.com\"},\"depends_on\":[]},\
            {\"id\":\"summary\",\"skill\":\"text.summarize\",\"arguments\":{\"text\":\"{{fetch.content}}\"},\"depends_on\":[\"fetch\"]}]\n\n\
            Output ONLY the JSON array, no markdown.",
        );
        prompt
    }

    fn user_prompt(&self, goal: &Goal, memory: &MemorySnapshot, prior: &[StepRecord]) -> String {
        let mut prompt = format!("Goal: {}\n", goal.text);

        if let Some(allowed) = &goal.constraints.allowed_skills {
            prompt.push_str(&format!("Only use these skills: {}\n", allowed.join(", ")));
        }
        if let Some(max_steps) = goal.constraints.max_steps {
            prompt.push_str(&format!("Use at most {} steps.\n", max_steps));
        }

        if !memory.long_term.is_empty() {
            prompt.push_str("\nRelevant knowledge:\n");
            for hit in &memory.long_term {
                prompt.push_str(&format!("- [{}] {}\n", hit.key, hit.content));
            }
        }
        if !memory.short_term.is_empty() {
            prompt.push_str("\nEarlier in this run:\n");
            for note in &memory.short_term {
                prompt.push_str(&format!("- ({}) {}\n", note.kind, note.content));
            }
        }

        if !prior.is_empty() {
            prompt.push_str("\nThe previous plan produced these results; plan around its failures:\n");
            for record in prior {
                let outcome = match &record.error {
                    Some(err) => format!("{} ({})", record.status, err),
                    None => record.status.to_string(),
                };
                prompt.push_str(&format!(
                    "- {} [{}]: {}\n",
                    record.step_id,
                    record.skill.as_deref().unwrap_or("delegate"),
                    outcome
                ));
            }
        }
        prompt
    }

    /// Build a plan from a completion
    pub fn parse_plan(
        &self,
        text: &str,
        goal: &Goal,
        registry: &SkillRegistry,
        scope: &PlanScope,
    ) -> Result<Plan, EngineError> {
        let trimmed = text.trim();
        let (start, end) = match (trimmed.find('['), trimmed.rfind(']')) {
            (Some(start), Some(end)) if start < end => (start, end),
            _ => {
                return Err(EngineError::Planning(
                    "completion contains no JSON array of steps".to_string(),
                ))
            }
        };

        let raw_steps: Vec<RawPlanStep> = serde_json::from_str(&trimmed[start..=end])
            .map_err(|e| EngineError::Planning(format!("unparseable plan: {}", e)))?;
        if raw_steps.is_empty() {
            return Err(EngineError::Planning(format!(
                "no viable decomposition for '{}'",
                goal.text
            )));
        }

        let steps = raw_steps
            .into_iter()
            .enumerate()
            .map(|(i, raw)| self.convert_step(i, raw, registry))
            .collect::<Result<Vec<_>, _>>()?;

        let rationale = format!("{} {}", &trimmed[..start], &trimmed[end + 1..])
            .trim()
            .to_string();

        let plan = Plan {
            id: scope.plan_id.clone(),
            goal: goal.text.clone(),
            iteration: scope.iteration,
            depth: scope.depth,
            steps,
            rationale,
            raw_completions: vec![text.to_string()],
            children: BTreeMap::new(),
        };
        plan.topological_order()?;
        Ok(plan)
    }

    fn convert_step(
        &self,
        index: usize,
        raw: RawPlanStep,
        registry: &SkillRegistry,
    ) -> Result<Step, EngineError> {
        let id = raw
            .id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| format!("step_{}", index + 1));

        let action = match (raw.skill, raw.delegate) {
            (Some(_), Some(_)) => {
                return Err(EngineError::Planning(format!(
                    "step {} both calls a skill and delegates",
                    id
                )))
            }
            (None, Some(goal)) if self.allow_delegation => StepAction::Delegate { goal },
            (None, Some(_)) => {
                return Err(EngineError::Planning(format!(
                    "step {} delegates, but delegation is disabled in flat mode",
                    id
                )))
            }
            (Some(skill), None) => {
                registry.get(&skill)?;
                let arguments = raw.arguments.unwrap_or_else(|| Value::Object(Default::default()));
                if !arguments.is_object() {
                    return Err(EngineError::Planning(format!(
                        "arguments of step {} must be an object",
                        id
                    )));
                }
                StepAction::Invoke { skill, arguments }
            }
            (None, None) => {
                return Err(EngineError::Planning(format!(
                    "step {} names neither a skill nor a delegation",
                    id
                )))
            }
        };

        Ok(Step {
            id,
            action,
            depends_on: raw.depends_on,
            best_effort: raw.best_effort.into_iter().collect::<BTreeSet<_>>(),
            description: raw.description,
        })
    }
}

#[async_trait]
impl Planner for LlmPlanner {
    async fn propose(
        &self,
        goal: &Goal,
        memory: &MemorySnapshot,
        registry: &SkillRegistry,
        prior: &[StepRecord],
        scope: &PlanScope,
    ) -> Result<Plan, EngineError> {
        if registry.is_empty() {
            return Err(EngineError::Planning("no skills are available".to_string()));
        }

        let messages = [
            Message::system(self.system_prompt(registry)),
            Message::user(self.user_prompt(goal, memory, prior)),
        ];

        let completion = complete_with_retry(self.provider.as_ref(), &messages, &self.options, &self.retry)
            .await
            .map_err(|e| match e {
                EngineError::Provider { transient, message } => EngineError::Planning(format!(
                    "completion provider failed ({}): {}",
                    if transient { "transient" } else { "permanent" },
                    message
                )),
                other => other,
            })?;
        self.tokens.fetch_add(completion.tokens, Ordering::SeqCst);

        let plan = self.parse_plan(&completion.text, goal, registry, scope)?;
        tracing::info!(
            "Planner {} proposed {} with {} steps via {}",
            if prior.is_empty() { "initially" } else { "on replan" },
            plan.id,
            plan.steps.len(),
            self.provider.name()
        );
        Ok(plan)
    }

    fn tokens_used(&self) -> u64 {
        self.tokens.load(Ordering::SeqCst)
    }
}
