//! Trace replay
//!
//! Rebuilds a run from its trace without touching the outside world. Plans
//! are re-derived from the completions recorded in them, reflector decisions
//! from the recorded step records. Step records and approval decisions are
//! facts and are never re-solicited.

use sdk::errors::{EngineError, ErrorKind};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use super::{TracePayload, TraceStore};
use crate::conductor::approval::ApprovalState;
use crate::conductor::hierarchical::HierarchicalPlanner;
use crate::conductor::planner::{LlmPlanner, PlanScope, Planner};
use crate::conductor::reflector::{Decision, Reflection, Reflector};
use crate::conductor::template::TemplatePlanner;
use crate::conductor::types::{
    Goal, Plan, RunState, StepRecord, StepStatus, TerminationReason, ValidationOutcome,
};
use crate::llm::retry::RetryPolicy;
use crate::llm::scripted::ScriptedProvider;
use crate::llm::CompletionOptions;
use crate::memory::MemorySnapshot;
use crate::skills::SkillRegistry;

/// Delegation depth used when re-deriving recorded plans; the recorded
/// completions bound the actual depth.
const REPLAY_MAX_DEPTH: usize = 64;

/// A point where the trace and the re-derivation disagree
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Divergence {
    SequenceGap { expected: u64, found: u64 },
    PlanRederivationFailed { plan_id: String, message: String },
    PlanMismatch { plan_id: String },
    ReflectionMismatch {
        plan_id: String,
        recorded: Decision,
        derived: Decision,
    },
    UnknownPlan { plan_id: String },
    UnapprovedSensitiveStep { plan_id: String, step_id: String },
}

impl fmt::Display for Divergence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Divergence::SequenceGap { expected, found } => {
                write!(f, "sequence gap: expected #{}, found #{}", expected, found)
            }
            Divergence::PlanRederivationFailed { plan_id, message } => {
                write!(f, "{} could not be re-derived: {}", plan_id, message)
            }
            Divergence::PlanMismatch { plan_id } => {
                write!(f, "{} differs from its re-derivation", plan_id)
            }
            Divergence::ReflectionMismatch {
                plan_id,
                recorded,
                derived,
            } => write!(
                f,
                "reflection on {}: recorded {}, re-derived {}",
                plan_id, recorded, derived
            ),
            Divergence::UnknownPlan { plan_id } => {
                write!(f, "event refers to unknown plan {}", plan_id)
            }
            Divergence::UnapprovedSensitiveStep { plan_id, step_id } => {
                write!(f, "{}/{} ran without a recorded approval", plan_id, step_id)
            }
        }
    }
}

/// Run state reconstructed from a trace
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReplayReport {
    pub run_id: String,
    pub events: usize,
    /// Root plans in creation order
    pub plans: Vec<Plan>,
    pub records: Vec<StepRecord>,
    pub reflections: Vec<Reflection>,
    /// Recorded approval decisions, keyed `plan_id/step_id`
    pub approvals: Vec<(String, ApprovalState)>,
    pub terminal: Option<(RunState, TerminationReason)>,
    pub divergences: Vec<Divergence>,
}

impl ReplayReport {
    /// True when the re-derivation reproduced every plan and decision
    pub fn is_faithful(&self) -> bool {
        self.divergences.is_empty()
    }

    /// Reflector decisions in trace order
    pub fn decisions(&self) -> Vec<Decision> {
        self.reflections.iter().map(|r| r.decision).collect()
    }
}

/// Folds a stored trace back into run state
pub struct Replayer {
    traces: Arc<dyn TraceStore>,
    registry: SkillRegistry,
    reflector: Reflector,
}

impl Replayer {
    /// Replay against `registry`, the skills currently installed
    pub fn new(traces: Arc<dyn TraceStore>, registry: SkillRegistry) -> Self {
        Self {
            traces,
            registry,
            reflector: Reflector::new(),
        }
    }

    pub async fn replay(&self, run_id: &str) -> Result<ReplayReport, EngineError> {
        let events = self.traces.stream(run_id).await?;
        let mut report = ReplayReport {
            run_id: run_id.to_string(),
            events: events.len(),
            ..Default::default()
        };

        // Every plan of the run, children included, with the snapshot its
        // root planning phase saw
        let mut plans: HashMap<String, (Plan, MemorySnapshot)> = HashMap::new();
        let mut records: HashMap<String, Vec<StepRecord>> = HashMap::new();
        let mut approvals: HashMap<(String, String), ApprovalState> = HashMap::new();
        let mut expected = 0u64;

        for event in events {
            if event.seq != expected {
                report.divergences.push(Divergence::SequenceGap {
                    expected,
                    found: event.seq,
                });
            }
            expected = event.seq + 1;

            match event.payload {
                TracePayload::PlanCreated { goal, plan, memory } => {
                    if let Some(divergence) = self.rederive(&goal, &plan, &memory).await {
                        report.divergences.push(divergence);
                    }
                    for node in plan.walk() {
                        plans.insert(node.id.clone(), (node.clone(), memory.clone()));
                    }
                    report.plans.push(plan);
                }
                TracePayload::StepStarted { .. } | TracePayload::ApprovalRequested { .. } => {}
                TracePayload::ApprovalResolved {
                    plan_id,
                    step_id,
                    state,
                    ..
                } => {
                    report.approvals.push((format!("{}/{}", plan_id, step_id), state));
                    approvals.insert((plan_id, step_id), state);
                }
                TracePayload::StepCompleted { record } => {
                    if self.is_sensitive(&record) && invoked(&record) {
                        let key = (record.plan_id.clone(), record.step_id.clone());
                        if approvals.get(&key) != Some(&ApprovalState::Approved) {
                            report.divergences.push(Divergence::UnapprovedSensitiveStep {
                                plan_id: record.plan_id.clone(),
                                step_id: record.step_id.clone(),
                            });
                        }
                    }
                    records
                        .entry(record.plan_id.clone())
                        .or_default()
                        .push(record.clone());
                    report.records.push(record);
                }
                TracePayload::Reflection {
                    context,
                    reflection,
                } => {
                    match plans.get(&context.plan_id) {
                        Some((plan, memory)) => {
                            let ordered = in_plan_order(plan, records.get(&plan.id));
                            let derived = self.reflector.reflect(&ordered, memory, &context);
                            if derived != reflection {
                                report.divergences.push(Divergence::ReflectionMismatch {
                                    plan_id: context.plan_id.clone(),
                                    recorded: reflection.decision,
                                    derived: derived.decision,
                                });
                            }
                        }
                        None => report.divergences.push(Divergence::UnknownPlan {
                            plan_id: context.plan_id.clone(),
                        }),
                    }
                    report.reflections.push(reflection);
                }
                TracePayload::RunTerminated { state, reason, .. } => {
                    report.terminal = Some((state, reason));
                }
            }
        }

        tracing::info!(
            "Replayed {}: {} event(s), {} plan(s), {} divergence(s)",
            run_id,
            report.events,
            report.plans.len(),
            report.divergences.len()
        );
        Ok(report)
    }

    /// Re-derive a recorded root plan from its own completions, against the
    /// skills the run was allowed to use
    async fn rederive(
        &self,
        goal: &Goal,
        recorded: &Plan,
        memory: &MemorySnapshot,
    ) -> Option<Divergence> {
        let completions: Vec<String> = recorded
            .walk()
            .into_iter()
            .flat_map(|plan| plan.raw_completions.iter().cloned())
            .collect();

        let planner: Arc<dyn Planner> = if completions.is_empty() {
            Arc::new(TemplatePlanner::new())
        } else {
            let provider = Arc::new(ScriptedProvider::named("replay", completions));
            let retry = RetryPolicy {
                max_attempts: 1,
                ..RetryPolicy::default()
            };
            let inner = LlmPlanner::new(provider, CompletionOptions::default(), retry).with_delegation();
            Arc::new(HierarchicalPlanner::new(Arc::new(inner), REPLAY_MAX_DEPTH))
        };

        let registry = match &goal.constraints.allowed_skills {
            Some(allowed) => self.registry.restricted(allowed),
            None => self.registry.clone(),
        };
        let scope = PlanScope::root(recorded.iteration);
        match planner.propose(goal, memory, &registry, &[], &scope).await {
            Ok(derived) if derived == *recorded => None,
            Ok(_) => Some(Divergence::PlanMismatch {
                plan_id: recorded.id.clone(),
            }),
            Err(e) => Some(Divergence::PlanRederivationFailed {
                plan_id: recorded.id.clone(),
                message: e.to_string(),
            }),
        }
    }

    fn is_sensitive(&self, record: &StepRecord) -> bool {
        record
            .skill
            .as_deref()
            .and_then(|skill| self.registry.get(skill).ok())
            .is_some_and(|contract| contract.is_sensitive())
    }
}

/// Whether the sandbox was reached for this step
fn invoked(record: &StepRecord) -> bool {
    match (record.status, record.validation) {
        (StepStatus::Succeeded, _) | (_, ValidationOutcome::OutputRejected) => true,
        (StepStatus::Failed, ValidationOutcome::InputOnly) => !matches!(
            record.error.as_ref().map(|e| e.kind),
            Some(
                ErrorKind::ApprovalDenied
                    | ErrorKind::ApprovalTimeout
                    | ErrorKind::Cancelled
                    | ErrorKind::BudgetExhausted
            )
        ),
        _ => false,
    }
}

/// Records of `plan` in the order the executor reports them
fn in_plan_order(plan: &Plan, records: Option<&Vec<StepRecord>>) -> Vec<StepRecord> {
    let mut ordered: Vec<StepRecord> = records.cloned().unwrap_or_default();
    let order = plan.topological_order().unwrap_or_default();
    ordered.sort_by_key(|r| {
        order
            .iter()
            .position(|id| *id == r.step_id)
            .unwrap_or(usize::MAX)
    });
    ordered
}
