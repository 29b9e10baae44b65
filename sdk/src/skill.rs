//! Skill trait and invocation context
//!
//! This module defines the `Skill` trait that every invocable capability
//! implements, and the `SkillContext` handed to it for a single invocation.
//! Adding a skill is a registry entry; the executor never grows a new code path.

use crate::errors::EngineError;
use crate::types::{ResourceLimits, SkillContract};
use async_trait::async_trait;
use serde_json::Value;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

/// Trait that all skills must implement
#[async_trait]
pub trait Skill: Send + Sync {
    /// Returns the immutable contract of this skill
    fn contract(&self) -> &SkillContract;

    /// Returns the registered name of this skill
    fn name(&self) -> &str {
        &self.contract().name
    }

    /// Invoke the skill with already-validated arguments
    ///
    /// Implementations should observe `ctx.cancel` for long-running work.
    /// The sandbox enforces `ctx.limits` around the call regardless.
    async fn invoke(&self, ctx: &SkillContext, args: Value) -> Result<Value, EngineError>;
}

/// Per-invocation context provided to a skill
#[derive(Debug, Clone)]
pub struct SkillContext {
    /// Run the invocation belongs to
    pub run_id: String,

    /// Step being executed
    pub step_id: String,

    /// Workspace root that filesystem scope is confined to
    pub workspace: PathBuf,

    /// Resource ceilings for this invocation only
    pub limits: ResourceLimits,

    /// Cooperative cancellation signal for the run
    pub cancel: CancellationToken,
}

impl SkillContext {
    pub fn new(
        run_id: impl Into<String>,
        step_id: impl Into<String>,
        workspace: PathBuf,
        limits: ResourceLimits,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            step_id: step_id.into(),
            workspace,
            limits,
            cancel,
        }
    }
}
