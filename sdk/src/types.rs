//! Skill contract types

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::Duration;

/// Side-effect class of a skill
///
/// Drives how the executor treats a step: `Sensitive` skills must pass the
/// approval gate before they are invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SideEffectClass {
    /// Observes the world without changing it
    ReadOnly,
    /// Changes state that is scoped to the sandbox
    Mutating,
    /// Changes durable state and needs human approval
    Sensitive,
}

impl SideEffectClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            SideEffectClass::ReadOnly => "read_only",
            SideEffectClass::Mutating => "mutating",
            SideEffectClass::Sensitive => "sensitive",
        }
    }
}

impl fmt::Display for SideEffectClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable contract of a registered skill
///
/// Input and output schemas are JSON Schema documents. The executor validates
/// arguments before invocation and results after it; contract compliance is
/// authoritative over whatever the skill itself reports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkillContract {
    /// Unique skill name, e.g. `web.fetch`
    pub name: String,

    /// Human-readable description shown to planners
    pub description: String,

    /// JSON Schema for arguments
    pub input_schema: Value,

    /// JSON Schema for results
    pub output_schema: Value,

    /// Side-effect class
    pub side_effect: SideEffectClass,

    /// Cost units charged to the run per invocation
    #[serde(default = "default_cost")]
    pub cost: u64,

    /// Per-invocation timeout override in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

fn default_cost() -> u64 {
    1
}

impl SkillContract {
    /// Create a contract with default cost and no timeout override
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        input_schema: Value,
        output_schema: Value,
        side_effect: SideEffectClass,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema,
            output_schema,
            side_effect,
            cost: default_cost(),
            timeout_ms: None,
        }
    }

    /// Set the cost units charged per invocation
    pub fn with_cost(mut self, cost: u64) -> Self {
        self.cost = cost;
        self
    }

    /// Set a per-invocation timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn is_sensitive(&self) -> bool {
        self.side_effect == SideEffectClass::Sensitive
    }
}

/// Resource ceilings applied to a single invocation
///
/// Limits never leak between invocations: each step gets its own copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Wall-clock deadline for the invocation
    pub timeout: Duration,

    /// Maximum serialized size of the result
    pub max_output_bytes: usize,

    /// CPU-seconds ceiling for child processes
    pub cpu_seconds: u64,

    /// Address-space ceiling for child processes
    pub memory_bytes: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_output_bytes: 100_000,
            cpu_seconds: 30,
            memory_bytes: 512 * 1024 * 1024,
        }
    }
}
