//! Sandbox Runner
//!
//! Executes one skill invocation under its own deadline, output ceiling and
//! cancellation signal. Limits are taken from the invocation's
//! `SkillContext` and never shared between invocations.
//!
//! Skills that spawn child processes go through [`process::ProcessSandbox`],
//! which adds CPU and address-space ceilings and a terminate-then-kill
//! sequence. The runner itself enforces the wall clock around every skill
//! and rejects oversized results instead of truncating them.

use async_trait::async_trait;
use sdk::errors::EngineError;
use sdk::skill::{Skill, SkillContext};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

pub mod process;

/// Failure of a single sandboxed invocation
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("invocation timed out after {} ms", .0.as_millis())]
    Timeout(Duration),

    #[error("resource limit exceeded: {0}")]
    ResourceLimitExceeded(String),

    #[error("runtime failure: {0}")]
    RuntimeFailure(String),

    /// Contract-level rejection raised by the skill itself
    #[error("{0}")]
    Rejected(String),

    #[error("invocation cancelled")]
    Cancelled,
}

impl From<EngineError> for SandboxError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::SandboxTimeout(ms) => SandboxError::Timeout(Duration::from_millis(ms)),
            EngineError::ResourceLimitExceeded(msg) => SandboxError::ResourceLimitExceeded(msg),
            EngineError::Validation(msg) => SandboxError::Rejected(msg),
            EngineError::Cancelled => SandboxError::Cancelled,
            other => SandboxError::RuntimeFailure(other.to_string()),
        }
    }
}

impl From<SandboxError> for EngineError {
    fn from(err: SandboxError) -> Self {
        match err {
            SandboxError::Timeout(d) => EngineError::SandboxTimeout(d.as_millis() as u64),
            SandboxError::ResourceLimitExceeded(msg) => EngineError::ResourceLimitExceeded(msg),
            SandboxError::RuntimeFailure(msg) => EngineError::Sandbox(msg),
            SandboxError::Rejected(msg) => EngineError::Validation(msg),
            SandboxError::Cancelled => EngineError::Cancelled,
        }
    }
}

/// Executes skill invocations in isolation
#[async_trait]
pub trait SandboxRunner: Send + Sync {
    /// Invoke `skill` with already-validated `arguments`.
    ///
    /// `ctx.limits` holds the ceilings for this invocation; `deadline` is the
    /// absolute wall-clock bound (the earlier of the skill timeout and the
    /// run budget).
    async fn invoke(
        &self,
        skill: &dyn Skill,
        arguments: Value,
        ctx: &SkillContext,
        deadline: Instant,
    ) -> Result<Value, SandboxError>;
}

/// In-process runner for async skills
///
/// The skill sees a timeout equal to the time left before the deadline.
/// Cooperative skills (those that spawn processes) observe it themselves and
/// terminate gracefully; the runner drops any invocation still pending
/// `kill_grace` after the deadline or after cancellation. A result that
/// arrives after the deadline is discarded, even inside the grace window.
#[derive(Debug, Clone)]
pub struct LocalSandbox {
    kill_grace: Duration,
}

impl Default for LocalSandbox {
    fn default() -> Self {
        Self::new(Duration::from_secs(2))
    }
}

impl LocalSandbox {
    pub fn new(kill_grace: Duration) -> Self {
        Self { kill_grace }
    }
}

/// Reject results whose serialized size exceeds the ceiling
pub fn check_output_size(result: &Value, max_output_bytes: usize) -> Result<(), SandboxError> {
    let size = serde_json::to_vec(result)
        .map_err(|e| SandboxError::RuntimeFailure(format!("unserializable result: {}", e)))?
        .len();
    if size > max_output_bytes {
        return Err(SandboxError::ResourceLimitExceeded(format!(
            "output of {} bytes exceeds the {} byte ceiling",
            size, max_output_bytes
        )));
    }
    Ok(())
}

#[async_trait]
impl SandboxRunner for LocalSandbox {
    async fn invoke(
        &self,
        skill: &dyn Skill,
        arguments: Value,
        ctx: &SkillContext,
        deadline: Instant,
    ) -> Result<Value, SandboxError> {
        let timeout = deadline.saturating_duration_since(Instant::now());
        if timeout.is_zero() {
            return Err(SandboxError::Timeout(Duration::ZERO));
        }
        if ctx.cancel.is_cancelled() {
            return Err(SandboxError::Cancelled);
        }

        let mut scoped = ctx.clone();
        scoped.limits.timeout = timeout;

        let grace = self.kill_grace;
        let cancel = ctx.cancel.clone();
        let invocation = skill.invoke(&scoped, arguments);
        tokio::pin!(invocation);

        let result = tokio::select! {
            result = &mut invocation => result.map_err(SandboxError::from),
            _ = tokio::time::sleep_until(deadline + grace) => {
                tracing::warn!(
                    "Skill {} ignored its deadline; dropping invocation",
                    skill.name()
                );
                Err(SandboxError::Timeout(timeout))
            }
            _ = async {
                cancel.cancelled().await;
                tokio::time::sleep(grace).await;
            } => Err(SandboxError::Cancelled),
        };

        let value = result?;
        if Instant::now() > deadline {
            tracing::warn!(
                "Skill {} finished after its deadline; result discarded",
                skill.name()
            );
            return Err(SandboxError::Timeout(timeout));
        }
        check_output_size(&value, ctx.limits.max_output_bytes)?;
        Ok(value)
    }
}
