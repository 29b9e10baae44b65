//! Conductor System
//!
//! Plans goals, executes plan DAGs under budget and approval control, and
//! reflects on the outcome of each iteration.

pub mod approval;
pub mod budget;
pub mod executor;
pub mod hierarchical;
pub mod orchestrator;
pub mod planner;
pub mod references;
pub mod reflector;
pub mod template;
pub mod types;

pub use approval::{ApprovalChannel, ApprovalGate, ApprovalRequest, ApprovalState};
pub use budget::{Budget, BudgetLimits, BudgetSnapshot};
pub use executor::Executor;
pub use hierarchical::HierarchicalPlanner;
pub use orchestrator::{LoopSettings, Orchestrator, RunOutcome};
pub use planner::{LlmPlanner, PlanScope, Planner};
pub use reflector::{Reflection, Reflector};
pub use template::TemplatePlanner;
pub use types::{Goal, Plan, RunState, Step, StepRecord, StepStatus, TerminationReason};
