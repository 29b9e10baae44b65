//! Error types and handling
//!
//! This module provides the error types used throughout the Cairn engine.
//! All errors implement the `CairnErrorExt` trait which provides user-friendly
//! hints and indicates whether errors are recoverable.
//!
//! Every `EngineError` maps onto a serializable [`ErrorKind`] so that step
//! records and trace payloads carry the same diagnostics a live run saw.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Trait for Cairn error extensions
///
/// This trait provides additional context for errors, including user-friendly
/// hints and recoverability information. All engine errors implement this trait.
pub trait CairnErrorExt {
    /// Returns a user-friendly hint for the error
    ///
    /// The hint is safe to display to end users and does not contain
    /// secrets or internal implementation details.
    fn user_hint(&self) -> &str;

    /// Returns whether the error is recoverable
    ///
    /// Recoverable errors are local to a step or can be retried. Non-recoverable
    /// errors terminate the run they occur in.
    fn is_recoverable(&self) -> bool;
}

/// Main engine error type
///
/// # Error Categories
///
/// - **Provider**: completion backend failures, split into transient and permanent
/// - **Planning**: no viable decomposition, cyclic plans, hierarchical depth overflow
/// - **Validation**: skill contract mismatch on arguments or results
/// - **Sandbox**: timeouts, resource ceilings, runtime failures of a skill
/// - **Approval**: denied or lapsed approval for a sensitive step
/// - **Budget**: run-level step, cost or wall-clock ceilings
/// - **Memory**: short-term or long-term storage failures
///
/// # Examples
///
/// ```
/// use sdk::errors::{CairnErrorExt, EngineError, ErrorKind};
///
/// let error = EngineError::Validation("missing field `url`".to_string());
/// assert_eq!(error.kind(), ErrorKind::Validation);
/// assert!(error.is_recoverable());
///
/// let fatal = EngineError::PlanDepthExceeded { depth: 3, limit: 2 };
/// assert!(!fatal.is_recoverable());
/// ```
#[derive(Debug, Error)]
pub enum EngineError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    // Database errors
    #[error("Database error: {0}")]
    Database(String),

    // Completion provider errors
    #[error("Provider error: {message}")]
    Provider { transient: bool, message: String },

    // Planning errors
    #[error("Planning error: {0}")]
    Planning(String),

    #[error("Plan depth exceeded: depth {depth} > limit {limit}")]
    PlanDepthExceeded { depth: usize, limit: usize },

    #[error("Plan contains a dependency cycle through step {0}")]
    CyclicPlan(String),

    #[error("Skill not found: {0}")]
    SkillNotFound(String),

    // Contract errors
    #[error("Validation error: {0}")]
    Validation(String),

    // Sandbox errors
    #[error("Skill timed out after {0} ms")]
    SandboxTimeout(u64),

    #[error("Resource limit exceeded: {0}")]
    ResourceLimitExceeded(String),

    #[error("Sandbox runtime failure: {0}")]
    Sandbox(String),

    // Approval errors
    #[error("Approval denied for step {0}")]
    ApprovalDenied(String),

    #[error("Approval timed out for step {0}")]
    ApprovalTimeout(String),

    // Run-level errors
    #[error("Budget exhausted: {0}")]
    BudgetExhausted(String),

    #[error("Run cancelled")]
    Cancelled,

    #[error("Run not found: {0}")]
    RunNotFound(String),

    // Memory errors
    #[error("Memory error: {0}")]
    Memory(String),

    // Trace errors
    #[error("Trace error: {0}")]
    Trace(String),

    // File system security errors
    #[error("Path denied: {0:?}")]
    PathDenied(std::path::PathBuf),

    #[error("Path outside workspace: {0:?}")]
    PathOutsideWorkspace(std::path::PathBuf),

    #[error("Path canonicalization failed for {0:?}: {1}")]
    PathCanonicalization(std::path::PathBuf, String),

    // Generic IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Serializable classification used in step records and trace payloads.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Provider { .. } => ErrorKind::Provider,
            Self::Planning(_) | Self::CyclicPlan(_) | Self::SkillNotFound(_) => {
                ErrorKind::Planning
            }
            Self::PlanDepthExceeded { .. } => ErrorKind::PlanDepthExceeded,
            Self::Validation(_) => ErrorKind::Validation,
            Self::SandboxTimeout(_) | Self::ResourceLimitExceeded(_) => {
                ErrorKind::ResourceLimitExceeded
            }
            Self::Sandbox(_)
            | Self::PathDenied(_)
            | Self::PathOutsideWorkspace(_)
            | Self::PathCanonicalization(_, _)
            | Self::Io(_) => ErrorKind::Sandbox,
            Self::ApprovalDenied(_) => ErrorKind::ApprovalDenied,
            Self::ApprovalTimeout(_) => ErrorKind::ApprovalTimeout,
            Self::BudgetExhausted(_) => ErrorKind::BudgetExhausted,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Memory(_) => ErrorKind::Memory,
            Self::Config(_) | Self::Database(_) | Self::RunNotFound(_) | Self::Trace(_) => {
                ErrorKind::Internal
            }
        }
    }

    /// Whether a provider error may succeed on retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Provider { transient: true, .. })
    }
}

impl CairnErrorExt for EngineError {
    fn user_hint(&self) -> &str {
        match self {
            Self::Config(_) => "Check your config.toml file for errors",
            Self::Database(_) => "Database operation failed. Check the data directory",

            Self::Provider {
                transient: true, ..
            } => "Completion provider is temporarily unavailable. Try again",
            Self::Provider { .. } => "Completion provider rejected the request. Check settings",

            Self::Planning(_) => "No viable plan for this goal. Try rephrasing it",
            Self::PlanDepthExceeded { .. } => "Goal decomposes too deeply. Raise planner.max_depth",
            Self::CyclicPlan(_) => "The plan contained circular dependencies",
            Self::SkillNotFound(_) => "The requested skill is not available",

            Self::Validation(_) => "Skill arguments or results did not match the contract",

            Self::SandboxTimeout(_) => "Skill took too long. Raise the sandbox timeout",
            Self::ResourceLimitExceeded(_) => "Skill exceeded its resource limits",
            Self::Sandbox(_) => "Skill execution failed",

            Self::ApprovalDenied(_) => "A sensitive step was denied by the approver",
            Self::ApprovalTimeout(_) => "A sensitive step was not approved in time",

            Self::BudgetExhausted(_) => "Run budget exhausted. Raise the step or cost limits",
            Self::Cancelled => "Run was cancelled",
            Self::RunNotFound(_) => "No run with this id was found",

            Self::Memory(_) => "Memory storage failed. Check the data directory",
            Self::Trace(_) => "Trace storage failed. Check the trace directory",

            Self::PathDenied(_) => "Access to this path is not allowed",
            Self::PathOutsideWorkspace(_) => "Operation must be within workspace",
            Self::PathCanonicalization(_, _) => "Invalid path specified",

            Self::Io(_) => "File system operation failed",
        }
    }

    fn is_recoverable(&self) -> bool {
        match self {
            // Non-recoverable errors
            Self::Config(_)
            | Self::PlanDepthExceeded { .. }
            | Self::CyclicPlan(_)
            | Self::Memory(_)
            | Self::Trace(_)
            | Self::Cancelled => false,

            Self::Provider { transient, .. } => *transient,

            // All other errors are potentially recoverable
            _ => true,
        }
    }
}

/// Serializable error classification
///
/// Carried by step records and trace payloads so that replay and
/// post-mortem tooling see the same diagnostics as the live run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Provider,
    Planning,
    PlanDepthExceeded,
    Validation,
    ResourceLimitExceeded,
    Sandbox,
    ApprovalDenied,
    ApprovalTimeout,
    BudgetExhausted,
    Memory,
    /// A dependency failed or was skipped
    DependencyFailed,
    Cancelled,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Provider => "provider_error",
            ErrorKind::Planning => "planning_error",
            ErrorKind::PlanDepthExceeded => "plan_depth_exceeded",
            ErrorKind::Validation => "validation_error",
            ErrorKind::ResourceLimitExceeded => "resource_limit_exceeded",
            ErrorKind::Sandbox => "sandbox_error",
            ErrorKind::ApprovalDenied => "approval_denied",
            ErrorKind::ApprovalTimeout => "approval_timeout",
            ErrorKind::BudgetExhausted => "budget_exhausted",
            ErrorKind::Memory => "memory_error",
            ErrorKind::DependencyFailed => "dependency_failed",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_transience_drives_recoverability() {
        let transient = EngineError::Provider {
            transient: true,
            message: "503".to_string(),
        };
        let permanent = EngineError::Provider {
            transient: false,
            message: "401".to_string(),
        };

        assert!(transient.is_transient());
        assert!(transient.is_recoverable());
        assert!(!permanent.is_transient());
        assert!(!permanent.is_recoverable());
        assert_eq!(permanent.kind(), ErrorKind::Provider);
    }

    #[test]
    fn test_sandbox_limits_share_a_kind() {
        assert_eq!(
            EngineError::SandboxTimeout(100).kind(),
            ErrorKind::ResourceLimitExceeded
        );
        assert_eq!(
            EngineError::ResourceLimitExceeded("output".into()).kind(),
            ErrorKind::ResourceLimitExceeded
        );
        assert_eq!(
            EngineError::Sandbox("exit 1".into()).kind(),
            ErrorKind::Sandbox
        );
    }

    #[test]
    fn test_error_kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::ApprovalTimeout).unwrap();
        assert_eq!(json, "\"approval_timeout\"");
        assert_eq!(ErrorKind::BudgetExhausted.to_string(), "budget_exhausted");
    }
}
