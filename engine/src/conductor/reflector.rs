//! Reflector
//!
//! Judges a finished plan from its step records and decides whether the run
//! continues. The reflector never calls a provider: the same records and
//! memory snapshot always produce the same decision and memory delta, which
//! is what lets replay re-derive decisions from a trace.

use sdk::errors::ErrorKind;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::fmt;

use super::types::{StepRecord, StepStatus};
use crate::memory::{LongTermWrite, MemoryDelta, MemoryNote, MemorySnapshot};

/// Result keys tried, in order, when extracting a step's text output
const TEXT_FIELDS: &[&str] = &["summary", "content", "text", "stdout"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    /// Resume the parent plan (child plans only)
    Continue,
    /// Feed the records back into the planner
    Replan,
    Stop,
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Decision::Continue => write!(f, "continue"),
            Decision::Replan => write!(f, "replan"),
            Decision::Stop => write!(f, "stop"),
        }
    }
}

/// How much of the goal the plan achieved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GoalOutcome {
    Satisfied,
    Partial,
    Blocked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReflectionScope {
    /// Top-level plan of an iteration
    Root,
    /// Child plan of a delegate step
    Child,
}

/// Inputs of a reflection besides the records and memory. Recorded with the
/// reflection so replay can call the reflector with identical inputs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReflectionContext {
    pub run_id: String,
    pub goal: String,
    pub plan_id: String,
    pub iteration: u32,
    pub scope: ReflectionScope,
    pub replans_left: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reflection {
    pub decision: Decision,
    pub outcome: GoalOutcome,
    pub summary: String,
    pub memory_delta: MemoryDelta,
}

/// Long-term memory key under which a satisfied goal's result is stored
pub fn goal_key(goal: &str) -> String {
    let digest = Sha256::digest(goal.trim().to_lowercase().as_bytes());
    format!("goal:{}", &hex::encode(digest)[..16])
}

/// Text output of the last record that produced one
///
/// `records` are expected in plan order, so the last match is the most
/// downstream result.
pub fn result_text(records: &[StepRecord]) -> Option<String> {
    records
        .iter()
        .rev()
        .filter(|r| r.succeeded())
        .filter_map(|r| r.result.as_ref())
        .find_map(|result| match result {
            Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
            Value::Object(map) => TEXT_FIELDS
                .iter()
                .filter_map(|field| map.get(*field).and_then(Value::as_str))
                .find(|s| !s.trim().is_empty())
                .map(str::to_string),
            _ => None,
        })
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Reflector;

impl Reflector {
    pub fn new() -> Self {
        Self
    }

    pub fn reflect(
        &self,
        records: &[StepRecord],
        memory: &MemorySnapshot,
        ctx: &ReflectionContext,
    ) -> Reflection {
        let tally = Tally::of(records);
        let (decision, outcome) = self.judge(records, &tally, ctx);

        let mut summary = format!(
            "{} {}: {} succeeded, {} failed, {} skipped -> {} ({:?})",
            match ctx.scope {
                ReflectionScope::Root => "iteration",
                ReflectionScope::Child => "child plan of iteration",
            },
            ctx.iteration,
            tally.succeeded,
            tally.failed,
            tally.skipped,
            decision,
            outcome
        );
        if let Some(failure) = records.iter().find(|r| r.status == StepStatus::Failed) {
            if let Some(err) = &failure.error {
                summary.push_str(&format!("; {} failed with {}", failure.step_id, err));
            }
        }

        let mut memory_delta = MemoryDelta::default();
        memory_delta.short_term.push(MemoryNote {
            kind: "reflection".to_string(),
            content: format!("[{}] {}: {}", ctx.plan_id, ctx.goal, summary),
        });

        if ctx.scope == ReflectionScope::Root && outcome == GoalOutcome::Satisfied {
            if let Some(text) = result_text(records) {
                let key = goal_key(&ctx.goal);
                let unchanged = memory
                    .long_term_entry(&key)
                    .is_some_and(|hit| hit.content == text);
                if !unchanged {
                    memory_delta.long_term.push(LongTermWrite {
                        key,
                        content: text,
                        metadata: json!({
                            "goal": ctx.goal,
                            "run_id": ctx.run_id,
                            "plan_id": ctx.plan_id,
                        }),
                    });
                }
            }
        }

        Reflection {
            decision,
            outcome,
            summary,
            memory_delta,
        }
    }

    fn judge(
        &self,
        records: &[StepRecord],
        tally: &Tally,
        ctx: &ReflectionContext,
    ) -> (Decision, GoalOutcome) {
        if records.is_empty() {
            return (Decision::Stop, GoalOutcome::Blocked);
        }

        // Skipped for the halt, or interrupted while running or awaiting approval
        let halted = records.iter().any(|r| {
            r.error.as_ref().is_some_and(|e| {
                matches!(e.kind, ErrorKind::BudgetExhausted | ErrorKind::Cancelled)
            })
        });
        if halted {
            return (Decision::Stop, GoalOutcome::Partial);
        }

        if tally.succeeded == records.len() {
            return match ctx.scope {
                ReflectionScope::Root => (Decision::Stop, GoalOutcome::Satisfied),
                ReflectionScope::Child => (Decision::Continue, GoalOutcome::Satisfied),
            };
        }

        let gated = records.iter().any(|r| {
            r.error.as_ref().is_some_and(|e| {
                matches!(e.kind, ErrorKind::ApprovalDenied | ErrorKind::ApprovalTimeout)
            })
        });
        let partial = if tally.succeeded > 0 {
            GoalOutcome::Partial
        } else {
            GoalOutcome::Blocked
        };

        match ctx.scope {
            // A child plan never replans on its own; its parent decides
            ReflectionScope::Child => (Decision::Stop, partial),
            ReflectionScope::Root if gated => (Decision::Stop, GoalOutcome::Blocked),
            ReflectionScope::Root if ctx.replans_left > 0 => (Decision::Replan, partial),
            ReflectionScope::Root => (Decision::Stop, GoalOutcome::Blocked),
        }
    }
}

#[derive(Debug, Default)]
struct Tally {
    succeeded: usize,
    failed: usize,
    skipped: usize,
}

impl Tally {
    fn of(records: &[StepRecord]) -> Self {
        let mut tally = Tally::default();
        for record in records {
            match record.status {
                StepStatus::Succeeded => tally.succeeded += 1,
                StepStatus::Failed => tally.failed += 1,
                StepStatus::Skipped => tally.skipped += 1,
                _ => {}
            }
        }
        tally
    }
}
