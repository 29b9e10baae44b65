//! Orchestration loop
//!
//! One run is a sequence of plan → act → reflect iterations. Only one plan
//! is active at a time; the loop ends on a stop decision, an exhausted
//! budget, a cancel signal or an unrecoverable error, and always leaves a
//! `run_terminated` event behind.

use sdk::errors::EngineError;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::budget::{Budget, BudgetLimits, BudgetSnapshot};
use super::executor::{cancel_reason, Executor, Halt, WalkContext};
use super::planner::{PlanScope, Planner};
use super::reflector::{Decision, GoalOutcome, Reflection, ReflectionContext, ReflectionScope, Reflector};
use super::types::{
    new_run_id, Goal, Plan, Run, RunState, StepError, StepRecord, TerminationReason,
};
use crate::config::{AgentConfig, MemoryConfig};
use crate::memory::{self, MemoryStore};
use crate::skills::SkillRegistry;
use crate::trace::{TracePayload, TraceRecorder, TraceStore};

/// Loop ceilings and run budget defaults
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopSettings {
    pub max_iterations: u32,
    pub max_replans: u32,
    pub retrieval_k: usize,
    pub limits: BudgetLimits,
}

impl LoopSettings {
    pub fn from_config(agent: &AgentConfig, memory: &MemoryConfig) -> Self {
        Self {
            max_iterations: agent.max_iterations.max(1),
            max_replans: agent.max_replans,
            retrieval_k: memory.retrieval_k,
            limits: BudgetLimits {
                max_steps: agent.max_steps,
                max_cost: agent.max_cost,
                max_duration: Duration::from_secs(agent.max_duration_secs),
            },
        }
    }

    /// Budget for `goal`: its constraints override the defaults
    pub fn limits_for(&self, goal: &Goal) -> BudgetLimits {
        BudgetLimits {
            max_steps: goal.constraints.max_steps.unwrap_or(self.limits.max_steps),
            max_cost: goal.constraints.max_cost.unwrap_or(self.limits.max_cost),
            max_duration: self.limits.max_duration,
        }
    }
}

/// Final state of a run
#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    pub run_id: String,
    pub goal: Goal,
    pub state: RunState,
    pub reason: TerminationReason,
    pub iterations: u32,
    pub plans: Vec<Plan>,
    /// Records of every plan, child plans included
    pub records: Vec<StepRecord>,
    pub reflections: Vec<Reflection>,
    pub budget: BudgetSnapshot,
    pub error: Option<StepError>,
}

impl RunOutcome {
    pub fn succeeded(&self) -> bool {
        self.state == RunState::Succeeded
    }
}

#[derive(Default)]
struct Progress {
    iterations: u32,
    plans: Vec<Plan>,
    records: Vec<StepRecord>,
    reflections: Vec<Reflection>,
}

pub struct Orchestrator {
    planner: Arc<dyn Planner>,
    executor: Executor,
    reflector: Reflector,
    memory: Arc<dyn MemoryStore>,
    traces: Arc<dyn TraceStore>,
    registry: SkillRegistry,
    settings: LoopSettings,
}

impl Orchestrator {
    pub fn new(
        planner: Arc<dyn Planner>,
        executor: Executor,
        memory: Arc<dyn MemoryStore>,
        traces: Arc<dyn TraceStore>,
        registry: SkillRegistry,
        settings: LoopSettings,
    ) -> Self {
        Self {
            planner,
            executor,
            reflector: Reflector::new(),
            memory,
            traces,
            registry,
            settings,
        }
    }

    pub fn registry(&self) -> &SkillRegistry {
        &self.registry
    }

    pub fn settings(&self) -> &LoopSettings {
        &self.settings
    }

    /// Run `goal` under a fresh run id
    pub async fn run(&self, goal: Goal, cancel: &CancellationToken) -> RunOutcome {
        self.run_with_id(new_run_id(), goal, cancel).await
    }

    /// Run `goal` to a terminal state. Never fails: errors end the run as
    /// `failed` with the error attached.
    pub async fn run_with_id(
        &self,
        run_id: String,
        goal: Goal,
        cancel: &CancellationToken,
    ) -> RunOutcome {
        let registry = match &goal.constraints.allowed_skills {
            Some(allowed) => self.registry.restricted(allowed),
            None => self.registry.clone(),
        };
        let limits = self.settings.limits_for(&goal);
        let run = Run::new(run_id, goal, Budget::new(limits));
        let recorder = TraceRecorder::new(run.id.clone(), Arc::clone(&self.traces));

        info!(
            "Run {} started: '{}' (steps {}, cost {}, {}s)",
            run.id,
            run.goal.text,
            limits.max_steps,
            limits.max_cost,
            limits.max_duration.as_secs()
        );

        // The wall-clock budget cancels in-flight work like an external cancel
        let cancel = cancel.child_token();
        let watchdog = {
            let cancel = cancel.clone();
            let deadline = run.budget.deadline();
            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => cancel.cancel(),
                    _ = cancel.cancelled() => {}
                }
            })
        };

        let mut progress = Progress::default();
        let result = self
            .drive(&run, &registry, &recorder, &cancel, &mut progress)
            .await;
        watchdog.abort();

        let (state, reason, error) = match result {
            Ok((state, reason)) => (state, reason, None),
            Err(e) => {
                error!("Run {} failed: {}", run.id, e);
                (RunState::Failed, TerminationReason::Error, Some(StepError::from(&e)))
            }
        };
        run.finish(state);

        let budget = run.budget.snapshot();
        if let Err(e) = recorder
            .record(TracePayload::RunTerminated {
                state,
                reason,
                error: error.clone(),
                budget,
            })
            .await
        {
            error!("Could not record termination of {}: {}", run.id, e);
        }

        info!(
            "Run {} {} ({}) after {} iteration(s), {} step(s), cost {}",
            run.id, state, reason, progress.iterations, budget.steps_used, budget.cost_used
        );

        RunOutcome {
            run_id: run.id.clone(),
            goal: run.goal.clone(),
            state,
            reason,
            iterations: progress.iterations,
            plans: progress.plans,
            records: progress.records,
            reflections: progress.reflections,
            budget,
            error,
        }
    }

    async fn drive(
        &self,
        run: &Run,
        registry: &SkillRegistry,
        recorder: &TraceRecorder,
        cancel: &CancellationToken,
        progress: &mut Progress,
    ) -> Result<(RunState, TerminationReason), EngineError> {
        let mut prior: Vec<StepRecord> = Vec::new();
        let mut replans_used = 0u32;
        let mut tokens_seen = self.planner.tokens_used();

        for iteration in 1..=self.settings.max_iterations {
            if cancel.is_cancelled() {
                return Ok(halted(cancel_reason(run)));
            }
            if let Some(exhaustion) = run.budget.exhausted() {
                info!("Run {} stops before iteration {}: {}", run.id, iteration, exhaustion);
                return Ok(halted(Halt::Budget(exhaustion)));
            }
            progress.iterations = iteration;

            let snapshot = memory::snapshot(
                self.memory.as_ref(),
                &run.id,
                &run.goal.text,
                self.settings.retrieval_k,
            )
            .await;

            let scope = PlanScope::root(iteration);
            let plan = tokio::select! {
                _ = cancel.cancelled() => return Ok(halted(cancel_reason(run))),
                plan = self.planner.propose(&run.goal, &snapshot, registry, &prior, &scope) => plan?,
            };

            let tokens = self.planner.tokens_used();
            run.budget.add_tokens(tokens.saturating_sub(tokens_seen));
            tokens_seen = tokens;

            recorder
                .record(TracePayload::PlanCreated {
                    goal: run.goal.clone(),
                    plan: plan.clone(),
                    memory: snapshot.clone(),
                })
                .await?;
            progress.plans.push(plan.clone());

            let walk_ctx = WalkContext {
                run,
                registry,
                recorder,
                memory: &snapshot,
                cancel,
            };
            let report = self.executor.walk(&plan, &walk_ctx).await?;
            progress.records.extend(report.records.iter().cloned());
            progress.records.extend(report.descendants.iter().cloned());

            let context = ReflectionContext {
                run_id: run.id.clone(),
                goal: run.goal.text.clone(),
                plan_id: plan.id.clone(),
                iteration,
                scope: ReflectionScope::Root,
                replans_left: self.settings.max_replans.saturating_sub(replans_used),
            };
            let reflection = self.reflector.reflect(&report.records, &snapshot, &context);
            info!("Reflection on {}: {}", plan.id, reflection.summary);
            recorder
                .record(TracePayload::Reflection {
                    context,
                    reflection: reflection.clone(),
                })
                .await?;

            let mut delta = report.memory_delta;
            delta.merge(reflection.memory_delta.clone());
            memory::apply_delta(self.memory.as_ref(), &run.id, &delta)
                .await
                .map_err(|e| match e {
                    e @ EngineError::Memory(_) => e,
                    other => EngineError::Memory(other.to_string()),
                })?;

            let decision = reflection.decision;
            let outcome = reflection.outcome;
            progress.reflections.push(reflection);

            if let Some(halt) = report.halt {
                return Ok(halted(halt));
            }

            match decision {
                Decision::Replan => {
                    replans_used += 1;
                    warn!("Run {} replans after iteration {}", run.id, iteration);
                    prior = report.records;
                }
                Decision::Stop | Decision::Continue => {
                    return Ok(if outcome == GoalOutcome::Satisfied {
                        (RunState::Succeeded, TerminationReason::GoalSatisfied)
                    } else {
                        (RunState::Failed, TerminationReason::GoalBlocked)
                    });
                }
            }
        }

        info!(
            "Run {} reached the iteration ceiling ({})",
            run.id, self.settings.max_iterations
        );
        Ok((RunState::Aborted, TerminationReason::BudgetExhausted))
    }
}

fn halted(halt: Halt) -> (RunState, TerminationReason) {
    match halt {
        Halt::Budget(_) => (RunState::Aborted, TerminationReason::BudgetExhausted),
        Halt::Cancelled => (RunState::Aborted, TerminationReason::Cancelled),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conductor::types::GoalConstraints;

    fn settings() -> LoopSettings {
        LoopSettings::from_config(&AgentConfig::default(), &MemoryConfig::default())
    }

    #[test]
    fn test_goal_constraints_override_defaults() {
        let goal = Goal::new("g").with_constraints(GoalConstraints {
            max_steps: Some(1),
            max_cost: None,
            allowed_skills: None,
        });
        let limits = settings().limits_for(&goal);
        assert_eq!(limits.max_steps, 1);
        assert_eq!(limits.max_cost, AgentConfig::default().max_cost);
    }

    use crate::conductor::approval::{ApprovalGate, PolicyApprovals};
    use crate::conductor::planner::LlmPlanner;
    use crate::conductor::reflector::goal_key;
    use crate::llm::retry::RetryPolicy;
    use crate::llm::scripted::ScriptedProvider;
    use crate::llm::CompletionOptions;
    use crate::memory::InMemoryStore;
    use crate::sandbox::LocalSandbox;
    use crate::skills::summarize::SummarizeSkill;
    use crate::trace::{EventKind, InMemoryTraceStore};
    use sdk::types::ResourceLimits;

    struct Fixture {
        orchestrator: Orchestrator,
        memory: Arc<InMemoryStore>,
        traces: Arc<InMemoryTraceStore>,
    }

    fn fixture(replies: Vec<&str>, settings: LoopSettings) -> Fixture {
        let mut registry = SkillRegistry::new();
        registry.register(Arc::new(SummarizeSkill::new())).unwrap();

        let provider = Arc::new(ScriptedProvider::new(replies));
        let planner = LlmPlanner::new(provider, CompletionOptions::default(), RetryPolicy::default());
        let executor = Executor::new(
            Arc::new(LocalSandbox::default()),
            ApprovalGate::new(Arc::new(PolicyApprovals::auto_deny()), Duration::from_secs(1)),
            ResourceLimits::default(),
            std::env::temp_dir(),
            2,
        );
        let memory = Arc::new(InMemoryStore::new());
        let traces = Arc::new(InMemoryTraceStore::new());
        Fixture {
            orchestrator: Orchestrator::new(
                Arc::new(planner),
                executor,
                memory.clone(),
                traces.clone(),
                registry,
                settings,
            ),
            memory,
            traces,
        }
    }

    const SUMMARIZE: &str =
        r#"[{"id": "s", "skill": "text.summarize", "arguments": {"text": "Tokio is a runtime. It schedules tasks."}}]"#;

    #[tokio::test]
    async fn test_successful_run_writes_memory_and_trace() {
        let f = fixture(vec![SUMMARIZE], settings());
        let outcome = f
            .orchestrator
            .run_with_id("run_ok".into(), Goal::new("Summarize tokio"), &CancellationToken::new())
            .await;

        assert!(outcome.succeeded(), "{:?}", outcome.error);
        assert_eq!(outcome.reason, TerminationReason::GoalSatisfied);
        assert_eq!(outcome.iterations, 1);
        assert_eq!(outcome.budget.steps_used, 1);
        assert!(f.memory.long_term(&goal_key("Summarize tokio")).await.is_some());

        let events = f.traces.stream("run_ok").await.unwrap();
        let kinds: Vec<EventKind> = events.iter().map(|e| e.kind()).collect();
        assert_eq!(kinds.first(), Some(&EventKind::PlanCreated));
        assert_eq!(kinds.last(), Some(&EventKind::RunTerminated));
        assert!(events.windows(2).all(|w| w[1].seq == w[0].seq + 1));
    }

    #[tokio::test]
    async fn test_planner_failure_fails_the_run() {
        let f = fixture(vec!["I cannot help with that."], settings());
        let outcome = f
            .orchestrator
            .run_with_id("run_bad".into(), Goal::new("anything"), &CancellationToken::new())
            .await;

        assert_eq!(outcome.state, RunState::Failed);
        assert_eq!(outcome.reason, TerminationReason::Error);
        assert_eq!(
            outcome.error.map(|e| e.kind),
            Some(sdk::errors::ErrorKind::Planning)
        );
        let events = f.traces.stream("run_bad").await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind(), EventKind::RunTerminated);
    }

    #[tokio::test]
    async fn test_failed_plan_is_replanned_with_prior_records() {
        let failing = r#"[{"id": "s", "skill": "text.summarize", "arguments": {}}]"#;
        let f = fixture(vec![failing, SUMMARIZE], settings());
        let outcome = f
            .orchestrator
            .run_with_id("run_replan".into(), Goal::new("Summarize tokio"), &CancellationToken::new())
            .await;

        assert!(outcome.succeeded());
        assert_eq!(outcome.iterations, 2);
        assert_eq!(outcome.plans[1].id, "plan-2");
        assert_eq!(outcome.reflections[0].decision, Decision::Replan);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let f = fixture(vec![SUMMARIZE], settings());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome = f.orchestrator.run(Goal::new("Summarize tokio"), &cancel).await;

        assert_eq!(outcome.state, RunState::Aborted);
        assert_eq!(outcome.reason, TerminationReason::Cancelled);
        assert!(outcome.plans.is_empty());
    }

    #[tokio::test]
    async fn test_disallowed_skill_cannot_be_planned() {
        let f = fixture(vec![SUMMARIZE], settings());
        let goal = Goal::new("Summarize tokio").with_constraints(GoalConstraints {
            allowed_skills: Some(vec!["fs.read".into()]),
            ..Default::default()
        });
        let outcome = f.orchestrator.run(goal, &CancellationToken::new()).await;
        assert_eq!(outcome.reason, TerminationReason::Error);
    }

    #[test]
    fn test_halt_mapping() {
        assert_eq!(
            halted(Halt::Cancelled),
            (RunState::Aborted, TerminationReason::Cancelled)
        );
        assert_eq!(
            halted(Halt::Budget(crate::conductor::budget::Exhaustion::Cost)),
            (RunState::Aborted, TerminationReason::BudgetExhausted)
        );
    }
}
