//! Conductor Types
//!
//! Goals, plans, step records and run state shared by the planner, executor,
//! reflector and trace.

use sdk::errors::{EngineError, ErrorKind};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use super::budget::Budget;

pub type StepId = String;

/// Optional structured limits attached to a goal
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GoalConstraints {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_steps: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_cost: Option<u64>,
    /// Skills the run may use; `None` allows every registered skill
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_skills: Option<Vec<String>>,
}

/// Immutable goal of a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Goal {
    pub text: String,
    #[serde(default)]
    pub constraints: GoalConstraints,
}

impl Goal {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            constraints: GoalConstraints::default(),
        }
    }

    pub fn with_constraints(mut self, constraints: GoalConstraints) -> Self {
        self.constraints = constraints;
        self
    }

    /// Sub-goal for a child plan; constraints are inherited
    pub fn delegate(&self, text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            constraints: self.constraints.clone(),
        }
    }
}

/// What a step does
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepAction {
    /// Call a registered skill
    Invoke { skill: String, arguments: Value },
    /// Expand into a child plan for a sub-goal (hierarchical mode)
    Delegate { goal: String },
}

/// One node of a plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub id: StepId,
    pub action: StepAction,
    #[serde(default)]
    pub depends_on: Vec<StepId>,
    /// Dependencies whose failure does not block this step
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub best_effort: BTreeSet<StepId>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

impl Step {
    pub fn invoke(id: impl Into<String>, skill: impl Into<String>, arguments: Value) -> Self {
        Self {
            id: id.into(),
            action: StepAction::Invoke {
                skill: skill.into(),
                arguments,
            },
            depends_on: Vec::new(),
            best_effort: BTreeSet::new(),
            description: String::new(),
        }
    }

    pub fn delegate(id: impl Into<String>, goal: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            action: StepAction::Delegate { goal: goal.into() },
            depends_on: Vec::new(),
            best_effort: BTreeSet::new(),
            description: String::new(),
        }
    }

    pub fn after(mut self, deps: &[&str]) -> Self {
        self.depends_on
            .extend(deps.iter().map(|d| d.to_string()));
        self
    }

    /// Mark the edge to `dep` as best-effort
    pub fn best_effort_on(mut self, dep: &str) -> Self {
        if !self.depends_on.iter().any(|d| d == dep) {
            self.depends_on.push(dep.to_string());
        }
        self.best_effort.insert(dep.to_string());
        self
    }

    pub fn skill(&self) -> Option<&str> {
        match &self.action {
            StepAction::Invoke { skill, .. } => Some(skill),
            StepAction::Delegate { .. } => None,
        }
    }
}

/// A plan: steps forming a DAG, plus rationale and the raw completions that
/// produced it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub id: String,
    pub goal: String,
    /// Loop iteration that proposed the plan (1-based)
    pub iteration: u32,
    /// 0 for top-level plans, parent depth + 1 for child plans
    pub depth: usize,
    pub steps: Vec<Step>,
    pub rationale: String,
    /// Provider output captured verbatim, in request order
    #[serde(default)]
    pub raw_completions: Vec<String>,
    /// Child plans keyed by the delegating step id
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub children: BTreeMap<StepId, Plan>,
}

impl Plan {
    /// Id of the top-level plan proposed in `iteration`
    pub fn root_id(iteration: u32) -> String {
        format!("plan-{}", iteration)
    }

    /// Id of the child plan expanding `step_id` of plan `parent_id`
    pub fn child_id(parent_id: &str, step_id: &str) -> String {
        format!("{}/{}", parent_id, step_id)
    }

    pub fn step(&self, id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// Check ids and edges and return a topological order.
    ///
    /// Fails with `Planning` on duplicate ids or unknown dependencies and with
    /// `CyclicPlan` when the dependency graph has a cycle.
    pub fn topological_order(&self) -> Result<Vec<StepId>, EngineError> {
        let mut indegree: HashMap<&str, usize> = HashMap::new();
        for step in &self.steps {
            if indegree.insert(step.id.as_str(), 0).is_some() {
                return Err(EngineError::Planning(format!(
                    "duplicate step id {} in {}",
                    step.id, self.id
                )));
            }
        }

        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
        for step in &self.steps {
            for dep in &step.depends_on {
                if !indegree.contains_key(dep.as_str()) {
                    return Err(EngineError::Planning(format!(
                        "step {} depends on unknown step {}",
                        step.id, dep
                    )));
                }
                if dep == &step.id {
                    return Err(EngineError::CyclicPlan(step.id.clone()));
                }
                dependents.entry(dep.as_str()).or_default().push(&step.id);
                *indegree.entry(step.id.as_str()).or_insert(0) += 1;
            }
            if let Some(extra) = step.best_effort.iter().find(|d| !step.depends_on.contains(*d)) {
                return Err(EngineError::Planning(format!(
                    "step {} marks {} best-effort without depending on it",
                    step.id, extra
                )));
            }
        }

        // Kahn's algorithm, seeded in declaration order for a stable result
        let mut queue: VecDeque<&str> = self
            .steps
            .iter()
            .filter(|s| indegree[s.id.as_str()] == 0)
            .map(|s| s.id.as_str())
            .collect();
        let mut order = Vec::with_capacity(self.steps.len());

        while let Some(id) = queue.pop_front() {
            order.push(id.to_string());
            for &next in dependents.get(id).map(Vec::as_slice).unwrap_or_default() {
                if let Some(d) = indegree.get_mut(next) {
                    *d -= 1;
                    if *d == 0 {
                        queue.push_back(next);
                    }
                }
            }
        }

        if order.len() != self.steps.len() {
            let stuck = self
                .steps
                .iter()
                .find(|s| !order.contains(&s.id))
                .map(|s| s.id.clone())
                .unwrap_or_default();
            return Err(EngineError::CyclicPlan(stuck));
        }

        Ok(order)
    }

    /// This plan and every descendant, pre-order, children in step order
    pub fn walk(&self) -> Vec<&Plan> {
        let mut plans = vec![self];
        for step in &self.steps {
            if let Some(child) = self.children.get(&step.id) {
                plans.extend(child.walk());
            }
        }
        plans
    }
}

/// Status of a step during a walk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Ready,
    Running,
    AwaitingApproval,
    Succeeded,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StepStatus::Succeeded | StepStatus::Failed | StepStatus::Skipped
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Ready => "ready",
            StepStatus::Running => "running",
            StepStatus::AwaitingApproval => "awaiting_approval",
            StepStatus::Succeeded => "succeeded",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
        }
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How far contract validation got for a step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationOutcome {
    /// Arguments and result both matched the contract
    Passed,
    InputRejected,
    /// Arguments passed; the result did not match
    OutputRejected,
    /// Arguments passed; the step failed before a result existed
    InputOnly,
    /// The step never reached validation
    NotChecked,
}

/// Serializable error attached to records and trace payloads
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepError {
    pub kind: ErrorKind,
    pub message: String,
}

impl StepError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl From<&EngineError> for StepError {
    fn from(err: &EngineError) -> Self {
        Self::new(err.kind(), err.to_string())
    }
}

impl fmt::Display for StepError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Immutable outcome of one step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub run_id: String,
    pub plan_id: String,
    pub step_id: StepId,
    /// `None` for delegate steps
    #[serde(default)]
    pub skill: Option<String>,
    pub status: StepStatus,
    /// Arguments after reference resolution (what was validated)
    #[serde(default)]
    pub arguments: Value,
    #[serde(default)]
    pub result: Option<Value>,
    pub validation: ValidationOutcome,
    pub duration_ms: u64,
    pub cost: u64,
    #[serde(default)]
    pub error: Option<StepError>,
}

impl StepRecord {
    pub fn succeeded(&self) -> bool {
        self.status == StepStatus::Succeeded
    }
}

/// Lifecycle state of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Running,
    AwaitingApproval,
    Succeeded,
    Failed,
    Aborted,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunState::Succeeded | RunState::Failed | RunState::Aborted
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Running => "running",
            RunState::AwaitingApproval => "awaiting_approval",
            RunState::Succeeded => "succeeded",
            RunState::Failed => "failed",
            RunState::Aborted => "aborted",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "running" => Some(RunState::Running),
            "awaiting_approval" => Some(RunState::AwaitingApproval),
            "succeeded" => Some(RunState::Succeeded),
            "failed" => Some(RunState::Failed),
            "aborted" => Some(RunState::Aborted),
            _ => None,
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a run reached its terminal state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    GoalSatisfied,
    GoalBlocked,
    Error,
    BudgetExhausted,
    Cancelled,
}

impl TerminationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            TerminationReason::GoalSatisfied => "goal_satisfied",
            TerminationReason::GoalBlocked => "goal_blocked",
            TerminationReason::Error => "error",
            TerminationReason::BudgetExhausted => "budget_exhausted",
            TerminationReason::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "goal_satisfied" => Some(TerminationReason::GoalSatisfied),
            "goal_blocked" => Some(TerminationReason::GoalBlocked),
            "error" => Some(TerminationReason::Error),
            "budget_exhausted" => Some(TerminationReason::BudgetExhausted),
            "cancelled" => Some(TerminationReason::Cancelled),
            _ => None,
        }
    }
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// New run id: `run_{unix_ts}_{uuid8}`
pub fn new_run_id() -> String {
    let uuid = uuid::Uuid::new_v4().simple().to_string();
    format!("run_{}_{}", chrono::Utc::now().timestamp(), &uuid[..8])
}

/// A run in progress
///
/// Threaded explicitly through planner, executor and reflector calls. The
/// terminal state is set once; later transitions are ignored.
#[derive(Debug)]
pub struct Run {
    pub id: String,
    pub goal: Goal,
    pub budget: Budget,
    pub started_at: i64,
    state: Mutex<RunState>,
    awaiting: AtomicUsize,
    /// Live status per `plan_id/step_id`
    steps: Mutex<HashMap<String, StepStatus>>,
}

impl Run {
    pub fn new(id: impl Into<String>, goal: Goal, budget: Budget) -> Self {
        Self {
            id: id.into(),
            goal,
            budget,
            started_at: chrono::Utc::now().timestamp_millis(),
            state: Mutex::new(RunState::Running),
            awaiting: AtomicUsize::new(0),
            steps: Mutex::new(HashMap::new()),
        }
    }

    pub fn state(&self) -> RunState {
        *self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn step_status(&self, plan_id: &str, step_id: &str) -> Option<StepStatus> {
        let steps = self.steps.lock().unwrap_or_else(|p| p.into_inner());
        steps.get(&format!("{}/{}", plan_id, step_id)).copied()
    }

    pub fn set_step_status(&self, plan_id: &str, step_id: &str, status: StepStatus) {
        let mut steps = self.steps.lock().unwrap_or_else(|p| p.into_inner());
        steps.insert(format!("{}/{}", plan_id, step_id), status);
    }

    /// A step started waiting for approval
    pub fn enter_approval_wait(&self, plan_id: &str, step_id: &str) {
        self.set_step_status(plan_id, step_id, StepStatus::AwaitingApproval);
        self.awaiting.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        if *state == RunState::Running {
            *state = RunState::AwaitingApproval;
        }
    }

    /// A step's approval resolved; it goes back to running until its record
    /// is final
    pub fn leave_approval_wait(&self, plan_id: &str, step_id: &str) {
        self.set_step_status(plan_id, step_id, StepStatus::Running);
        let remaining = self.awaiting.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        if remaining == 0 && *state == RunState::AwaitingApproval {
            *state = RunState::Running;
        }
    }

    /// Move to a terminal state. Returns false if the run already ended.
    pub fn finish(&self, terminal: RunState) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        if state.is_terminal() || !terminal.is_terminal() {
            return false;
        }
        *state = terminal;
        true
    }
}
