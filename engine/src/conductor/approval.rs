//! Approval gate for sensitive steps
//!
//! A sensitive step is never invoked until an approval channel says so. The
//! gate bounds the wait with the configured window; a lapsed window resolves
//! to `timed_out`, which is treated like a denial.

use async_trait::async_trait;
use sdk::errors::EngineError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tokio_util::sync::CancellationToken;

/// Lifecycle of one approval
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalState {
    Proposed,
    AwaitingApproval,
    Approved,
    Denied,
    TimedOut,
}

impl ApprovalState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalState::Proposed => "proposed",
            ApprovalState::AwaitingApproval => "awaiting_approval",
            ApprovalState::Approved => "approved",
            ApprovalState::Denied => "denied",
            ApprovalState::TimedOut => "timed_out",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "proposed" => Some(ApprovalState::Proposed),
            "awaiting_approval" => Some(ApprovalState::AwaitingApproval),
            "approved" => Some(ApprovalState::Approved),
            "denied" => Some(ApprovalState::Denied),
            "timed_out" => Some(ApprovalState::TimedOut),
            _ => None,
        }
    }

    pub fn is_resolved(&self) -> bool {
        matches!(
            self,
            ApprovalState::Approved | ApprovalState::Denied | ApprovalState::TimedOut
        )
    }
}

impl fmt::Display for ApprovalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Answer from an approver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalDecision {
    Approved,
    Denied,
}

impl From<ApprovalDecision> for ApprovalState {
    fn from(decision: ApprovalDecision) -> Self {
        match decision {
            ApprovalDecision::Approved => ApprovalState::Approved,
            ApprovalDecision::Denied => ApprovalState::Denied,
        }
    }
}

/// What the approver is shown
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub id: String,
    pub run_id: String,
    pub plan_id: String,
    pub step_id: String,
    pub skill: String,
    /// Resolved arguments the skill would be invoked with
    pub arguments: Value,
    pub requested_at: i64,
}

impl ApprovalRequest {
    pub fn new(
        run_id: impl Into<String>,
        plan_id: impl Into<String>,
        step_id: impl Into<String>,
        skill: impl Into<String>,
        arguments: Value,
    ) -> Self {
        let run_id = run_id.into();
        let plan_id = plan_id.into();
        let step_id = step_id.into();
        Self {
            id: format!("{}:{}:{}", run_id, plan_id, step_id),
            run_id,
            plan_id,
            step_id,
            skill: skill.into(),
            arguments,
            requested_at: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// Where approval requests are sent
#[async_trait]
pub trait ApprovalChannel: Send + Sync {
    /// Wait for a decision on `request`. The gate bounds the wait.
    async fn request(&self, request: &ApprovalRequest) -> Result<ApprovalDecision, EngineError>;
}

/// Bounds every approval with a window
#[derive(Clone)]
pub struct ApprovalGate {
    channel: Arc<dyn ApprovalChannel>,
    window: Duration,
}

impl ApprovalGate {
    pub fn new(channel: Arc<dyn ApprovalChannel>, window: Duration) -> Self {
        Self { channel, window }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Resolve `request` to approved, denied or timed_out.
    ///
    /// Channel failures count as denials. Returns `Cancelled` if the run is
    /// cancelled while waiting.
    pub async fn decide(
        &self,
        request: &ApprovalRequest,
        cancel: &CancellationToken,
    ) -> Result<ApprovalState, EngineError> {
        if self.window.is_zero() {
            tracing::warn!(
                "Approval window is zero; step {} times out unasked",
                request.step_id
            );
            return Ok(ApprovalState::TimedOut);
        }

        let decision = tokio::select! {
            _ = cancel.cancelled() => return Err(EngineError::Cancelled),
            decision = tokio::time::timeout(self.window, self.channel.request(request)) => decision,
        };

        let state = match decision {
            Err(_) => ApprovalState::TimedOut,
            Ok(Ok(decision)) => decision.into(),
            Ok(Err(e)) => {
                tracing::error!("Approval channel failed for {}: {}", request.id, e);
                ApprovalState::Denied
            }
        };
        tracing::info!(
            "Approval for {} ({}) resolved: {}",
            request.step_id,
            request.skill,
            state
        );
        Ok(state)
    }
}

/// Approvals answered in-process, e.g. by a CLI prompt or a test
#[derive(Default)]
pub struct InMemoryApprovals {
    pending: Mutex<HashMap<String, (ApprovalRequest, oneshot::Sender<ApprovalDecision>)>>,
}

impl InMemoryApprovals {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests still waiting for an answer
    pub async fn pending(&self) -> Vec<ApprovalRequest> {
        let mut pending = self.pending.lock().await;
        pending.retain(|_, (_, tx)| !tx.is_closed());
        let mut requests: Vec<_> = pending.values().map(|(req, _)| req.clone()).collect();
        requests.sort_by_key(|r| r.requested_at);
        requests
    }

    pub async fn approve(&self, id: &str) -> Result<(), EngineError> {
        self.resolve(id, ApprovalDecision::Approved).await
    }

    pub async fn deny(&self, id: &str) -> Result<(), EngineError> {
        self.resolve(id, ApprovalDecision::Denied).await
    }

    async fn resolve(&self, id: &str, decision: ApprovalDecision) -> Result<(), EngineError> {
        let (_, tx) = self
            .pending
            .lock()
            .await
            .remove(id)
            .ok_or_else(|| EngineError::Validation(format!("no pending approval {}", id)))?;
        tx.send(decision)
            .map_err(|_| EngineError::Validation(format!("approval {} already lapsed", id)))
    }
}

#[async_trait]
impl ApprovalChannel for InMemoryApprovals {
    async fn request(&self, request: &ApprovalRequest) -> Result<ApprovalDecision, EngineError> {
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .await
            .insert(request.id.clone(), (request.clone(), tx));

        rx.await
            .map_err(|_| EngineError::Validation(format!("approval {} was dropped", request.id)))
    }
}

/// Fixed answer for unattended runs
#[derive(Debug, Clone, Copy)]
pub struct PolicyApprovals {
    decision: ApprovalDecision,
}

impl PolicyApprovals {
    pub fn auto_approve() -> Self {
        Self {
            decision: ApprovalDecision::Approved,
        }
    }

    pub fn auto_deny() -> Self {
        Self {
            decision: ApprovalDecision::Denied,
        }
    }
}

#[async_trait]
impl ApprovalChannel for PolicyApprovals {
    async fn request(&self, request: &ApprovalRequest) -> Result<ApprovalDecision, EngineError> {
        tracing::info!(
            "Policy {:?} for sensitive step {} ({})",
            self.decision,
            request.step_id,
            request.skill
        );
        Ok(self.decision)
    }
}
