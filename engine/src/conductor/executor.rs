//! Conductor Executor
//!
//! Walks a plan in dependency order. Independent steps run concurrently up
//! to a worker ceiling; a step waiting for approval holds no worker slot.
//! Every step ends in exactly one immutable [`StepRecord`], including steps
//! that never ran because a dependency failed or the budget ran out.

use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use sdk::errors::{EngineError, ErrorKind};
use sdk::skill::SkillContext;
use sdk::types::ResourceLimits;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::approval::{ApprovalGate, ApprovalRequest, ApprovalState};
use super::budget::Exhaustion;
use super::references::resolve_arguments;
use super::reflector::{result_text, Decision, ReflectionContext, ReflectionScope, Reflector};
use super::types::{
    Plan, Run, Step, StepAction, StepError, StepRecord, StepStatus, ValidationOutcome,
};
use crate::memory::{MemoryDelta, MemorySnapshot};
use crate::sandbox::SandboxRunner;
use crate::skills::SkillRegistry;
use crate::trace::{TracePayload, TraceRecorder};

/// Why a walk stopped launching steps
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Halt {
    Budget(Exhaustion),
    Cancelled,
}

impl Halt {
    fn step_error(&self) -> StepError {
        match self {
            Halt::Budget(exhaustion) => StepError::new(ErrorKind::BudgetExhausted, exhaustion.to_string()),
            Halt::Cancelled => StepError::new(ErrorKind::Cancelled, "run cancelled"),
        }
    }
}

/// Readiness of a pending step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    /// A dependency has not finished yet
    Waiting,
    Ready,
    /// A required dependency failed or was skipped
    Blocked(String),
}

/// A step is ready once every dependency succeeded, or finished at all when
/// the edge is best-effort.
pub fn readiness(step: &Step, statuses: &HashMap<&str, StepStatus>) -> Readiness {
    let mut waiting = false;
    for dep in &step.depends_on {
        match statuses.get(dep.as_str()).copied().unwrap_or(StepStatus::Pending) {
            StepStatus::Succeeded => {}
            StepStatus::Failed | StepStatus::Skipped if step.best_effort.contains(dep) => {}
            StepStatus::Failed | StepStatus::Skipped => return Readiness::Blocked(dep.clone()),
            _ => waiting = true,
        }
    }
    if waiting {
        Readiness::Waiting
    } else {
        Readiness::Ready
    }
}

/// Everything a walk needs from the run
pub struct WalkContext<'r> {
    pub run: &'r Run,
    pub registry: &'r SkillRegistry,
    pub recorder: &'r TraceRecorder,
    pub memory: &'r MemorySnapshot,
    pub cancel: &'r CancellationToken,
}

/// Outcome of walking one plan
#[derive(Debug, Default)]
pub struct WalkReport {
    /// Records of this plan's steps, in plan order
    pub records: Vec<StepRecord>,
    /// Records of all child plans
    pub descendants: Vec<StepRecord>,
    /// Memory changes from child plan reflections
    pub memory_delta: MemoryDelta,
    pub halt: Option<Halt>,
}

impl WalkReport {
    pub fn budget_exhausted(&self) -> Option<Exhaustion> {
        match self.halt {
            Some(Halt::Budget(exhaustion)) => Some(exhaustion),
            _ => None,
        }
    }

    pub fn cancelled(&self) -> bool {
        self.halt == Some(Halt::Cancelled)
    }
}

struct StepOutcome {
    record: StepRecord,
    halt: Option<Halt>,
    descendants: Vec<StepRecord>,
    delta: MemoryDelta,
}

impl StepOutcome {
    fn of(record: StepRecord, run: &Run) -> Self {
        let halt = match record.error.as_ref().map(|e| e.kind) {
            Some(ErrorKind::Cancelled | ErrorKind::BudgetExhausted) => Some(cancel_reason(run)),
            _ => None,
        };
        Self {
            record,
            halt,
            descendants: Vec::new(),
            delta: MemoryDelta::default(),
        }
    }
}

pub struct Executor {
    sandbox: Arc<dyn SandboxRunner>,
    gate: ApprovalGate,
    reflector: Reflector,
    limits: ResourceLimits,
    workspace: PathBuf,
    permits: Arc<Semaphore>,
}

impl Executor {
    pub fn new(
        sandbox: Arc<dyn SandboxRunner>,
        gate: ApprovalGate,
        limits: ResourceLimits,
        workspace: PathBuf,
        max_concurrency: usize,
    ) -> Self {
        Self {
            sandbox,
            gate,
            reflector: Reflector::new(),
            limits,
            workspace,
            permits: Arc::new(Semaphore::new(max_concurrency.max(1))),
        }
    }

    /// Run every step of `plan` to a terminal status.
    ///
    /// Fails only for plans that cannot be walked (cycles, unknown
    /// dependencies) and for trace failures; step failures are recorded.
    pub fn walk<'a>(
        &'a self,
        plan: &'a Plan,
        ctx: &'a WalkContext<'a>,
    ) -> BoxFuture<'a, Result<WalkReport, EngineError>> {
        Box::pin(async move {
            let order = plan.topological_order()?;
            let position: HashMap<&str, usize> = order
                .iter()
                .enumerate()
                .map(|(i, id)| (id.as_str(), i))
                .collect();

            let mut statuses: HashMap<&str, StepStatus> = order
                .iter()
                .map(|id| (id.as_str(), StepStatus::Pending))
                .collect();
            for id in &order {
                ctx.run.set_step_status(&plan.id, id, StepStatus::Pending);
            }
            let mut results: HashMap<String, Value> = HashMap::new();
            let mut errors: HashMap<String, StepError> = HashMap::new();
            let mut report = WalkReport::default();
            let mut running = FuturesUnordered::new();

            debug!("Walking {} ({} steps)", plan.id, order.len());

            loop {
                // Settle every pending step that can be decided now
                for id in &order {
                    if statuses.get(id.as_str()) != Some(&StepStatus::Pending) {
                        continue;
                    }
                    let Some(step) = plan.step(id) else { continue };

                    let blocked = match readiness(step, &statuses) {
                        Readiness::Blocked(dep) => Some(dep),
                        Readiness::Waiting if report.halt.is_none() => continue,
                        _ => None,
                    };

                    if let Some(dep) = blocked {
                        let message = match errors.get(&dep) {
                            Some(err) => format!("dependency {} did not succeed: {}", dep, err.message),
                            None => format!("dependency {} did not succeed", dep),
                        };
                        let record = self.skipped(ctx, plan, step, StepError::new(ErrorKind::DependencyFailed, message));
                        self.finish(ctx, &record).await?;
                        statuses.insert(id.as_str(), StepStatus::Skipped);
                        if let Some(err) = &record.error {
                            errors.insert(id.clone(), err.clone());
                        }
                        report.records.push(record);
                        continue;
                    }

                    if report.halt.is_none() && ctx.cancel.is_cancelled() {
                        report.halt = Some(cancel_reason(ctx.run));
                    }

                    if report.halt.is_none() {
                        ctx.run.set_step_status(&plan.id, id, StepStatus::Ready);
                        let reserved = match &step.action {
                            StepAction::Invoke { skill, .. } => {
                                let cost = ctx.registry.get(skill).map(|c| c.cost).unwrap_or(0);
                                match ctx.run.budget.try_reserve(cost) {
                                    Ok(()) => Some(cost),
                                    Err(exhaustion) => {
                                        info!("{}: {} not launched", exhaustion, step.id);
                                        report.halt = Some(Halt::Budget(exhaustion));
                                        None
                                    }
                                }
                            }
                            // Delegations are bookkeeping; their child steps are charged
                            StepAction::Delegate { .. } => Some(0),
                        };

                        if let Some(reserved) = reserved {
                            let inputs: HashMap<String, Value> = step
                                .depends_on
                                .iter()
                                .filter_map(|d| results.get(d).map(|v| (d.clone(), v.clone())))
                                .collect();
                            statuses.insert(id.as_str(), StepStatus::Running);
                            ctx.run.set_step_status(&plan.id, id, StepStatus::Running);
                            running.push(self.run_step(ctx, plan, step, inputs, reserved));
                            continue;
                        }
                    }

                    if let Some(halt) = report.halt {
                        let record = self.skipped(ctx, plan, step, halt.step_error());
                        self.finish(ctx, &record).await?;
                        statuses.insert(id.as_str(), StepStatus::Skipped);
                        report.records.push(record);
                    }
                }

                let Some(outcome) = running.next().await else { break };
                let outcome: StepOutcome = outcome?;

                let record = outcome.record;
                if let Some((key, _)) = position.get_key_value(record.step_id.as_str()) {
                    statuses.insert(*key, record.status);
                }
                if let Some(result) = &record.result {
                    if record.succeeded() {
                        results.insert(record.step_id.clone(), result.clone());
                    }
                }
                if let Some(err) = &record.error {
                    errors.insert(record.step_id.clone(), err.clone());
                }
                if report.halt.is_none() {
                    report.halt = outcome.halt;
                }
                report.descendants.extend(outcome.descendants);
                report.memory_delta.merge(outcome.delta);
                report.records.push(record);
            }

            report
                .records
                .sort_by_key(|r| position.get(r.step_id.as_str()).copied().unwrap_or(usize::MAX));
            Ok(report)
        })
    }

    fn run_step<'a>(
        &'a self,
        ctx: &'a WalkContext<'a>,
        plan: &'a Plan,
        step: &'a Step,
        inputs: HashMap<String, Value>,
        reserved: u64,
    ) -> BoxFuture<'a, Result<StepOutcome, EngineError>> {
        Box::pin(async move {
            ctx.recorder
                .record(TracePayload::StepStarted {
                    plan_id: plan.id.clone(),
                    step_id: step.id.clone(),
                    skill: step.skill().map(str::to_string),
                })
                .await?;

            let outcome = match &step.action {
                StepAction::Invoke { skill, arguments } => {
                    let started = Instant::now();
                    let (mut record, invoked) = self
                        .invoke_step(ctx, plan, step, skill, arguments, &inputs)
                        .await?;
                    let charged = if invoked { reserved } else { 0 };
                    ctx.run.budget.settle(reserved, charged);
                    record.cost = charged;
                    record.duration_ms = started.elapsed().as_millis() as u64;
                    StepOutcome::of(record, ctx.run)
                }
                StepAction::Delegate { .. } => self.delegate_step(ctx, plan, step).await?,
            };

            self.finish(ctx, &outcome.record).await?;
            Ok(outcome)
        })
    }

    /// Returns the record and whether the sandbox was invoked
    async fn invoke_step(
        &self,
        ctx: &WalkContext<'_>,
        plan: &Plan,
        step: &Step,
        skill: &str,
        planned: &Value,
        inputs: &HashMap<String, Value>,
    ) -> Result<(StepRecord, bool), EngineError> {
        let mut record = self.base_record(ctx, plan, step);
        record.arguments = planned.clone();

        let entry = match ctx.registry.entry(skill) {
            Ok(entry) => Arc::clone(entry),
            Err(e) => return Ok((failed(record, &e, ValidationOutcome::NotChecked), false)),
        };

        let arguments = match resolve_arguments(step, planned, inputs) {
            Ok(arguments) => arguments,
            Err(e) => return Ok((failed(record, &e, ValidationOutcome::InputRejected), false)),
        };
        record.arguments = arguments.clone();

        if let Err(e) = entry.validate_input(&arguments) {
            return Ok((failed(record, &e, ValidationOutcome::InputRejected), false));
        }

        if entry.contract().is_sensitive() {
            let err = match self.await_approval(ctx, plan, step, skill, &arguments).await? {
                Some(ApprovalState::Approved) => None,
                Some(ApprovalState::TimedOut) => Some(EngineError::ApprovalTimeout(step.id.clone())),
                Some(_) => Some(EngineError::ApprovalDenied(step.id.clone())),
                None => Some(interruption(ctx.run)),
            };
            if let Some(err) = err {
                return Ok((failed(record, &err, ValidationOutcome::InputOnly), false));
            }
        }

        let _permit = tokio::select! {
            _ = ctx.cancel.cancelled() => {
                return Ok((failed(record, &interruption(ctx.run), ValidationOutcome::InputOnly), false));
            }
            permit = Arc::clone(&self.permits).acquire_owned() => {
                permit.map_err(|_| EngineError::Cancelled)?
            }
        };

        let mut limits = self.limits;
        if let Some(ms) = entry.contract().timeout_ms {
            limits.timeout = Duration::from_millis(ms);
        }
        let deadline = (Instant::now() + limits.timeout).min(ctx.run.budget.deadline());
        let skill_ctx = SkillContext::new(
            ctx.run.id.clone(),
            step.id.clone(),
            self.workspace.clone(),
            limits,
            ctx.cancel.clone(),
        );

        let result = match self
            .sandbox
            .invoke(entry.skill(), arguments, &skill_ctx, deadline)
            .await
        {
            Ok(result) => result,
            Err(e) => {
                let err = match EngineError::from(e) {
                    EngineError::Cancelled => interruption(ctx.run),
                    err => err,
                };
                // A skill rejecting its own arguments still counts as an input mismatch
                let validation = if err.kind() == ErrorKind::Validation {
                    ValidationOutcome::InputRejected
                } else {
                    ValidationOutcome::InputOnly
                };
                return Ok((failed(record, &err, validation), true));
            }
        };

        if let Err(e) = entry.validate_output(&result) {
            record.result = Some(result);
            return Ok((failed(record, &e, ValidationOutcome::OutputRejected), true));
        }

        record.status = StepStatus::Succeeded;
        record.validation = ValidationOutcome::Passed;
        record.result = Some(result);
        Ok((record, true))
    }

    async fn await_approval(
        &self,
        ctx: &WalkContext<'_>,
        plan: &Plan,
        step: &Step,
        skill: &str,
        arguments: &Value,
    ) -> Result<Option<ApprovalState>, EngineError> {
        let request = ApprovalRequest::new(
            ctx.run.id.clone(),
            plan.id.clone(),
            step.id.clone(),
            skill,
            arguments.clone(),
        );

        ctx.run.enter_approval_wait(&plan.id, &step.id);
        let decided = async {
            ctx.recorder
                .record(TracePayload::ApprovalRequested {
                    request: request.clone(),
                })
                .await?;
            self.gate.decide(&request, ctx.cancel).await
        }
        .await;
        ctx.run.leave_approval_wait(&plan.id, &step.id);

        let state = match decided {
            Ok(state) => state,
            Err(EngineError::Cancelled) => return Ok(None),
            Err(e) => return Err(e),
        };

        ctx.recorder
            .record(TracePayload::ApprovalResolved {
                request_id: request.id.clone(),
                plan_id: plan.id.clone(),
                step_id: step.id.clone(),
                state,
            })
            .await?;
        Ok(Some(state))
    }

    async fn delegate_step(
        &self,
        ctx: &WalkContext<'_>,
        plan: &Plan,
        step: &Step,
    ) -> Result<StepOutcome, EngineError> {
        let started = Instant::now();
        let mut record = self.base_record(ctx, plan, step);

        let Some(child) = plan.children.get(&step.id) else {
            let err = EngineError::Planning(format!("delegate step {} has no child plan", step.id));
            return Ok(StepOutcome::of(
                failed(record, &err, ValidationOutcome::NotChecked),
                ctx.run,
            ));
        };

        let child_report = self.walk(child, ctx).await?;

        let reflection_ctx = ReflectionContext {
            run_id: ctx.run.id.clone(),
            goal: child.goal.clone(),
            plan_id: child.id.clone(),
            iteration: child.iteration,
            scope: ReflectionScope::Child,
            replans_left: 0,
        };
        let reflection = self
            .reflector
            .reflect(&child_report.records, ctx.memory, &reflection_ctx);
        ctx.recorder
            .record(TracePayload::Reflection {
                context: reflection_ctx,
                reflection: reflection.clone(),
            })
            .await?;

        record.duration_ms = started.elapsed().as_millis() as u64;
        if reflection.decision == Decision::Continue {
            record.status = StepStatus::Succeeded;
            record.validation = ValidationOutcome::Passed;
            record.result = Some(json!({
                "plan_id": child.id,
                "summary": reflection.summary,
                "text": result_text(&child_report.records).unwrap_or_default(),
            }));
        } else {
            record.status = StepStatus::Failed;
            record.error = Some(StepError::new(
                ErrorKind::DependencyFailed,
                format!("child plan {} ended {:?}: {}", child.id, reflection.outcome, reflection.summary),
            ));
        }

        let mut descendants = child_report.records;
        descendants.extend(child_report.descendants);
        let mut delta = reflection.memory_delta;
        delta.merge(child_report.memory_delta);

        Ok(StepOutcome {
            record,
            halt: child_report.halt,
            descendants,
            delta,
        })
    }

    fn base_record(&self, ctx: &WalkContext<'_>, plan: &Plan, step: &Step) -> StepRecord {
        StepRecord {
            run_id: ctx.run.id.clone(),
            plan_id: plan.id.clone(),
            step_id: step.id.clone(),
            skill: step.skill().map(str::to_string),
            status: StepStatus::Failed,
            arguments: match &step.action {
                StepAction::Invoke { arguments, .. } => arguments.clone(),
                StepAction::Delegate { goal } => json!({ "goal": goal }),
            },
            result: None,
            validation: ValidationOutcome::NotChecked,
            duration_ms: 0,
            cost: 0,
            error: None,
        }
    }

    fn skipped(&self, ctx: &WalkContext<'_>, plan: &Plan, step: &Step, error: StepError) -> StepRecord {
        let mut record = self.base_record(ctx, plan, step);
        record.status = StepStatus::Skipped;
        record.error = Some(error);
        record
    }

    /// Append the step_completed event and the audit line
    async fn finish(&self, ctx: &WalkContext<'_>, record: &StepRecord) -> Result<(), EngineError> {
        ctx.run
            .set_step_status(&record.plan_id, &record.step_id, record.status);
        ctx.recorder
            .record(TracePayload::StepCompleted {
                record: record.clone(),
            })
            .await?;

        let error = record.error.as_ref().map(|e| e.to_string()).unwrap_or_default();
        if record.status == StepStatus::Failed {
            warn!(
                target: "cairn::audit",
                run_id = %record.run_id,
                plan_id = %record.plan_id,
                step_id = %record.step_id,
                skill = record.skill.as_deref().unwrap_or("delegate"),
                status = %record.status,
                duration_ms = record.duration_ms,
                error = %error,
                "step finished"
            );
        } else {
            info!(
                target: "cairn::audit",
                run_id = %record.run_id,
                plan_id = %record.plan_id,
                step_id = %record.step_id,
                skill = record.skill.as_deref().unwrap_or("delegate"),
                status = %record.status,
                duration_ms = record.duration_ms,
                error = %error,
                "step finished"
            );
        }
        Ok(())
    }
}

fn failed(mut record: StepRecord, err: &EngineError, validation: ValidationOutcome) -> StepRecord {
    record.status = StepStatus::Failed;
    record.validation = validation;
    record.error = Some(StepError::from(err));
    record
}

/// Cancellation at or past the deadline is the wall-clock budget running out
pub(crate) fn cancel_reason(run: &Run) -> Halt {
    if Instant::now() >= run.budget.deadline() {
        Halt::Budget(Exhaustion::Time)
    } else {
        Halt::Cancelled
    }
}

/// Error for a step interrupted by the run's cancel token
fn interruption(run: &Run) -> EngineError {
    match cancel_reason(run) {
        Halt::Budget(exhaustion) => EngineError::BudgetExhausted(exhaustion.to_string()),
        Halt::Cancelled => EngineError::Cancelled,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conductor::approval::{InMemoryApprovals, PolicyApprovals};
    use crate::conductor::budget::{Budget, BudgetLimits};
    use crate::conductor::types::Goal;
    use crate::sandbox::LocalSandbox;
    use crate::trace::{EventKind, InMemoryTraceStore, TraceStore};
    use async_trait::async_trait;
    use sdk::skill::Skill;
    use sdk::types::{SideEffectClass, SkillContract};
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Echoes `value`, fails when `fail` is set, tracks concurrency
    struct Probe {
        contract: SkillContract,
        active: AtomicUsize,
        peak: AtomicUsize,
        calls: AtomicUsize,
    }

    impl Probe {
        fn new(name: &str, side_effect: SideEffectClass) -> Arc<Self> {
            Arc::new(Self {
                contract: SkillContract::new(
                    name,
                    "probe",
                    json!({
                        "type": "object",
                        "properties": {"value": {"type": "string"}, "fail": {"type": "boolean"}},
                        "required": ["value"]
                    }),
                    json!({
                        "type": "object",
                        "properties": {"text": {"type": "string"}},
                        "required": ["text"]
                    }),
                    side_effect,
                ),
                active: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Skill for Probe {
        fn contract(&self) -> &SkillContract {
            &self.contract
        }

        async fn invoke(&self, _ctx: &SkillContext, args: Value) -> Result<Value, EngineError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.active.fetch_sub(1, Ordering::SeqCst);

            if args["fail"] == json!(true) {
                return Err(EngineError::Sandbox("probe asked to fail".into()));
            }
            Ok(json!({ "text": args["value"] }))
        }
    }

    /// Ignores its timeout and answers late
    struct Overrun {
        contract: SkillContract,
    }

    #[async_trait]
    impl Skill for Overrun {
        fn contract(&self) -> &SkillContract {
            &self.contract
        }

        async fn invoke(&self, _ctx: &SkillContext, _args: Value) -> Result<Value, EngineError> {
            tokio::time::sleep(Duration::from_millis(300)).await;
            Ok(json!({}))
        }
    }

    struct Harness {
        probe: Arc<Probe>,
        writer: Arc<Probe>,
        registry: SkillRegistry,
        store: Arc<InMemoryTraceStore>,
        recorder: TraceRecorder,
        run: Run,
        cancel: CancellationToken,
        memory: MemorySnapshot,
    }

    impl Harness {
        fn new(max_steps: u64) -> Self {
            let probe = Probe::new("test.probe", SideEffectClass::ReadOnly);
            let writer = Probe::new("test.write", SideEffectClass::Sensitive);
            let mut registry = SkillRegistry::new();
            registry.register(probe.clone()).unwrap();
            registry.register(writer.clone()).unwrap();
            registry
                .register(Arc::new(Overrun {
                    contract: SkillContract::new(
                        "test.overrun",
                        "Answers after its timeout",
                        json!({"type": "object"}),
                        json!({"type": "object"}),
                        SideEffectClass::ReadOnly,
                    )
                    .with_timeout(Duration::from_millis(50)),
                }))
                .unwrap();

            let store = Arc::new(InMemoryTraceStore::new());
            let recorder = TraceRecorder::new("run_t", store.clone());
            let run = Run::new(
                "run_t",
                Goal::new("test"),
                Budget::new(BudgetLimits {
                    max_steps,
                    max_cost: 100,
                    max_duration: Duration::from_secs(30),
                }),
            );
            Self {
                probe,
                writer,
                registry,
                store,
                recorder,
                run,
                cancel: CancellationToken::new(),
                memory: MemorySnapshot::default(),
            }
        }

        fn ctx(&self) -> WalkContext<'_> {
            WalkContext {
                run: &self.run,
                registry: &self.registry,
                recorder: &self.recorder,
                memory: &self.memory,
                cancel: &self.cancel,
            }
        }
    }

    fn executor(concurrency: usize, approvals: PolicyApprovals) -> Executor {
        Executor::new(
            Arc::new(LocalSandbox::default()),
            ApprovalGate::new(Arc::new(approvals), Duration::from_secs(1)),
            ResourceLimits::default(),
            std::env::temp_dir(),
            concurrency,
        )
    }

    fn plan(steps: Vec<Step>) -> Plan {
        Plan {
            id: "plan-1".into(),
            goal: "test".into(),
            iteration: 1,
            depth: 0,
            steps,
            rationale: String::new(),
            raw_completions: vec![],
            children: BTreeMap::new(),
        }
    }

    fn status_of(report: &WalkReport, id: &str) -> StepStatus {
        report.records.iter().find(|r| r.step_id == id).map(|r| r.status).unwrap()
    }

    #[tokio::test]
    async fn test_chain_passes_results_through_references() {
        let h = Harness::new(10);
        let plan = plan(vec![
            Step::invoke("a", "test.probe", json!({"value": "hello"})),
            Step::invoke("b", "test.probe", json!({"value": "{{a.text}} world"})).after(&["a"]),
        ]);

        let report = executor(2, PolicyApprovals::auto_approve()).walk(&plan, &h.ctx()).await.unwrap();
        assert_eq!(report.records[1].result, Some(json!({"text": "hello world"})));
        assert_eq!(h.run.budget.snapshot().steps_used, 2);
    }

    #[tokio::test]
    async fn test_failure_skips_dependents_but_not_siblings() {
        let h = Harness::new(10);
        let plan = plan(vec![
            Step::invoke("bad", "test.probe", json!({"value": "x", "fail": true})),
            Step::invoke("sibling", "test.probe", json!({"value": "y"})),
            Step::invoke("child", "test.probe", json!({"value": "z"})).after(&["bad"]),
            Step::invoke("grandchild", "test.probe", json!({"value": "w"})).after(&["child"]),
        ]);

        let report = executor(4, PolicyApprovals::auto_approve()).walk(&plan, &h.ctx()).await.unwrap();
        assert_eq!(status_of(&report, "bad"), StepStatus::Failed);
        assert_eq!(status_of(&report, "sibling"), StepStatus::Succeeded);
        assert_eq!(status_of(&report, "child"), StepStatus::Skipped);
        assert_eq!(status_of(&report, "grandchild"), StepStatus::Skipped);

        let child = report.records.iter().find(|r| r.step_id == "child").unwrap();
        let err = child.error.as_ref().unwrap();
        assert_eq!(err.kind, ErrorKind::DependencyFailed);
        assert!(err.message.contains("bad"));
    }

    #[tokio::test]
    async fn test_best_effort_edge_keeps_dependent_eligible() {
        let h = Harness::new(10);
        let plan = plan(vec![
            Step::invoke("optional", "test.probe", json!({"value": "x", "fail": true})),
            Step::invoke("after", "test.probe", json!({"value": "y"})).best_effort_on("optional"),
        ]);

        let report = executor(2, PolicyApprovals::auto_approve()).walk(&plan, &h.ctx()).await.unwrap();
        assert_eq!(status_of(&report, "after"), StepStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_invalid_arguments_never_reach_sandbox() {
        let h = Harness::new(10);
        let plan = plan(vec![Step::invoke("a", "test.probe", json!({"nope": 1}))]);

        let report = executor(1, PolicyApprovals::auto_approve()).walk(&plan, &h.ctx()).await.unwrap();
        assert_eq!(report.records[0].validation, ValidationOutcome::InputRejected);
        assert_eq!(report.records[0].error.as_ref().unwrap().kind, ErrorKind::Validation);
        assert_eq!(h.probe.calls.load(Ordering::SeqCst), 0);
        assert_eq!(report.records[0].cost, 0);
    }

    #[tokio::test]
    async fn test_concurrency_ceiling() {
        let h = Harness::new(10);
        let steps = (0..6)
            .map(|i| Step::invoke(format!("s{}", i), "test.probe", json!({"value": "v"})))
            .collect();

        executor(2, PolicyApprovals::auto_approve()).walk(&plan(steps), &h.ctx()).await.unwrap();
        assert_eq!(h.probe.calls.load(Ordering::SeqCst), 6);
        assert!(h.probe.peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_step_budget_skips_remaining_steps() {
        let h = Harness::new(1);
        let plan = plan(vec![
            Step::invoke("first", "test.probe", json!({"value": "a"})),
            Step::invoke("second", "test.probe", json!({"value": "b"})).after(&["first"]),
        ]);

        let report = executor(1, PolicyApprovals::auto_approve()).walk(&plan, &h.ctx()).await.unwrap();
        assert_eq!(status_of(&report, "first"), StepStatus::Succeeded);
        assert_eq!(status_of(&report, "second"), StepStatus::Skipped);
        assert_eq!(report.records[1].error.as_ref().unwrap().kind, ErrorKind::BudgetExhausted);
        assert_eq!(report.budget_exhausted(), Some(Exhaustion::Steps));
    }

    #[tokio::test]
    async fn test_denied_sensitive_step_is_not_invoked() {
        let h = Harness::new(10);
        let plan = plan(vec![Step::invoke("save", "test.write", json!({"value": "x"}))]);

        let report = executor(1, PolicyApprovals::auto_deny()).walk(&plan, &h.ctx()).await.unwrap();
        assert_eq!(report.records[0].error.as_ref().unwrap().kind, ErrorKind::ApprovalDenied);
        assert_eq!(h.writer.calls.load(Ordering::SeqCst), 0);

        let kinds: Vec<EventKind> = h.store.stream("run_t").await.unwrap().iter().map(|e| e.kind()).collect();
        assert_eq!(
            kinds,
            vec![
                EventKind::StepStarted,
                EventKind::ApprovalRequested,
                EventKind::ApprovalResolved,
                EventKind::StepCompleted
            ]
        );
    }

    #[tokio::test]
    async fn test_skill_overrunning_its_timeout_fails() {
        let h = Harness::new(10);
        let plan = plan(vec![Step::invoke("slow", "test.overrun", json!({}))]);

        let report = executor(1, PolicyApprovals::auto_approve()).walk(&plan, &h.ctx()).await.unwrap();
        let record = &report.records[0];
        assert_eq!(record.status, StepStatus::Failed);
        assert_eq!(record.error.as_ref().unwrap().kind, ErrorKind::ResourceLimitExceeded);
        assert!(record.result.is_none());
        assert!(report.halt.is_none());
    }

    #[tokio::test]
    async fn test_step_status_while_awaiting_approval() {
        let h = Harness::new(10);
        let approvals = Arc::new(InMemoryApprovals::new());
        let executor = Executor::new(
            Arc::new(LocalSandbox::default()),
            ApprovalGate::new(approvals.clone(), Duration::from_secs(5)),
            ResourceLimits::default(),
            std::env::temp_dir(),
            1,
        );
        let plan = plan(vec![
            Step::invoke("save", "test.write", json!({"value": "x"})),
            Step::invoke("after", "test.probe", json!({"value": "y"})).after(&["save"]),
        ]);
        let ctx = h.ctx();

        let approver = async {
            let request = loop {
                if let Some(request) = approvals.pending().await.into_iter().next() {
                    break request;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            };
            assert_eq!(h.run.step_status("plan-1", "save"), Some(StepStatus::AwaitingApproval));
            assert_eq!(h.run.step_status("plan-1", "after"), Some(StepStatus::Pending));
            assert_eq!(h.writer.calls.load(Ordering::SeqCst), 0);
            approvals.approve(&request.id).await.unwrap();
        };
        let (report, ()) = tokio::join!(executor.walk(&plan, &ctx), approver);

        assert!(report.unwrap().records.iter().all(|r| r.succeeded()));
        assert_eq!(h.run.step_status("plan-1", "save"), Some(StepStatus::Succeeded));
        assert_eq!(h.run.step_status("plan-1", "after"), Some(StepStatus::Succeeded));
    }

    #[tokio::test]
    async fn test_deadline_cancel_counts_as_budget_exhaustion() {
        let mut h = Harness::new(10);
        h.run = Run::new(
            "run_t",
            Goal::new("test"),
            Budget::new(BudgetLimits {
                max_steps: 10,
                max_cost: 100,
                max_duration: Duration::from_millis(50),
            }),
        );
        let approvals = Arc::new(InMemoryApprovals::new());
        let executor = Executor::new(
            Arc::new(LocalSandbox::default()),
            ApprovalGate::new(approvals, Duration::from_secs(5)),
            ResourceLimits::default(),
            std::env::temp_dir(),
            1,
        );
        let plan = plan(vec![Step::invoke("save", "test.write", json!({"value": "x"}))]);
        let deadline = h.run.budget.deadline();
        let cancel = h.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            cancel.cancel();
        });

        let report = executor.walk(&plan, &h.ctx()).await.unwrap();
        assert_eq!(report.budget_exhausted(), Some(Exhaustion::Time));
        assert_eq!(report.records[0].error.as_ref().unwrap().kind, ErrorKind::BudgetExhausted);
        assert_eq!(h.writer.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cyclic_plan_is_rejected() {
        let h = Harness::new(10);
        let plan = plan(vec![
            Step::invoke("a", "test.probe", json!({"value": "a"})).after(&["b"]),
            Step::invoke("b", "test.probe", json!({"value": "b"})).after(&["a"]),
        ]);

        let err = executor(1, PolicyApprovals::auto_approve()).walk(&plan, &h.ctx()).await.unwrap_err();
        assert!(matches!(err, EngineError::CyclicPlan(_)));
    }

    #[tokio::test]
    async fn test_cancelled_walk_skips_everything() {
        let h = Harness::new(10);
        h.cancel.cancel();
        let plan = plan(vec![Step::invoke("a", "test.probe", json!({"value": "a"}))]);

        let report = executor(1, PolicyApprovals::auto_approve()).walk(&plan, &h.ctx()).await.unwrap();
        assert!(report.cancelled());
        assert_eq!(report.records[0].status, StepStatus::Skipped);
    }

    #[test]
    fn test_readiness_rules() {
        let step = Step::invoke("c", "x", json!({})).after(&["a"]).best_effort_on("b");
        let mut statuses = HashMap::new();
        statuses.insert("a", StepStatus::Succeeded);
        statuses.insert("b", StepStatus::Running);
        assert_eq!(readiness(&step, &statuses), Readiness::Waiting);

        statuses.insert("b", StepStatus::Failed);
        assert_eq!(readiness(&step, &statuses), Readiness::Ready);

        statuses.insert("a", StepStatus::Skipped);
        assert_eq!(readiness(&step, &statuses), Readiness::Blocked("a".into()));
    }
}
