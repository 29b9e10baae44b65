//! Trace Store
//!
//! Append-only log of everything a run did. The per-run sequence number is
//! the sole ordering authority: [`TraceRecorder`] assigns it and appends in
//! one critical section, so a consumer never observes a gap.

use async_trait::async_trait;
use sdk::errors::EngineError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::conductor::approval::{ApprovalRequest, ApprovalState};
use crate::conductor::budget::BudgetSnapshot;
use crate::conductor::reflector::{Reflection, ReflectionContext};
use crate::conductor::types::{Goal, Plan, RunState, StepError, StepRecord, TerminationReason};
use crate::memory::MemorySnapshot;

pub mod replay;

/// Kind of a trace event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    PlanCreated,
    StepStarted,
    StepCompleted,
    ApprovalRequested,
    ApprovalResolved,
    Reflection,
    RunTerminated,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::PlanCreated => "plan_created",
            EventKind::StepStarted => "step_started",
            EventKind::StepCompleted => "step_completed",
            EventKind::ApprovalRequested => "approval_requested",
            EventKind::ApprovalResolved => "approval_resolved",
            EventKind::Reflection => "reflection",
            EventKind::RunTerminated => "run_terminated",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed payload of a trace event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum TracePayload {
    PlanCreated {
        /// The run's goal, constraints included
        goal: Goal,
        plan: Plan,
        /// Memory the planner saw
        memory: MemorySnapshot,
    },
    StepStarted {
        plan_id: String,
        step_id: String,
        skill: Option<String>,
    },
    StepCompleted {
        record: StepRecord,
    },
    ApprovalRequested {
        request: ApprovalRequest,
    },
    ApprovalResolved {
        request_id: String,
        plan_id: String,
        step_id: String,
        state: ApprovalState,
    },
    Reflection {
        context: ReflectionContext,
        reflection: Reflection,
    },
    RunTerminated {
        state: RunState,
        reason: TerminationReason,
        error: Option<StepError>,
        budget: BudgetSnapshot,
    },
}

impl TracePayload {
    pub fn kind(&self) -> EventKind {
        match self {
            TracePayload::PlanCreated { .. } => EventKind::PlanCreated,
            TracePayload::StepStarted { .. } => EventKind::StepStarted,
            TracePayload::StepCompleted { .. } => EventKind::StepCompleted,
            TracePayload::ApprovalRequested { .. } => EventKind::ApprovalRequested,
            TracePayload::ApprovalResolved { .. } => EventKind::ApprovalResolved,
            TracePayload::Reflection { .. } => EventKind::Reflection,
            TracePayload::RunTerminated { .. } => EventKind::RunTerminated,
        }
    }
}

/// One entry of a run's trace
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEvent {
    pub run_id: String,
    pub seq: u64,
    /// Milliseconds since the Unix epoch
    pub timestamp: i64,
    #[serde(flatten)]
    pub payload: TracePayload,
}

impl TraceEvent {
    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }

    /// Payload as a JSON value, for storage backends with a payload column
    pub fn payload_json(&self) -> Result<Value, EngineError> {
        let mut value = serde_json::to_value(&self.payload)
            .map_err(|e| EngineError::Trace(format!("unserializable payload: {}", e)))?;
        Ok(value
            .get_mut("payload")
            .map(Value::take)
            .unwrap_or(Value::Null))
    }

    /// Rebuild an event from stored columns
    pub fn from_parts(
        run_id: String,
        seq: u64,
        timestamp: i64,
        kind: &str,
        payload: Value,
    ) -> Result<Self, EngineError> {
        let payload: TracePayload =
            serde_json::from_value(serde_json::json!({ "kind": kind, "payload": payload }))
                .map_err(|e| EngineError::Trace(format!("corrupt {} event {}: {}", kind, seq, e)))?;
        Ok(Self {
            run_id,
            seq,
            timestamp,
            payload,
        })
    }
}

/// Durable, append-only storage of trace events
#[async_trait]
pub trait TraceStore: Send + Sync {
    async fn append(&self, event: &TraceEvent) -> Result<(), EngineError>;

    /// All events of a run in sequence order
    async fn stream(&self, run_id: &str) -> Result<Vec<TraceEvent>, EngineError>;

    /// Run ids with at least one event, oldest first
    async fn list_runs(&self) -> Result<Vec<String>, EngineError>;
}

/// Assigns sequence numbers for one run and appends events
pub struct TraceRecorder {
    run_id: String,
    store: Arc<dyn TraceStore>,
    next_seq: Mutex<u64>,
}

impl TraceRecorder {
    pub fn new(run_id: impl Into<String>, store: Arc<dyn TraceStore>) -> Self {
        Self {
            run_id: run_id.into(),
            store,
            next_seq: Mutex::new(0),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Append `payload` as the next event. The counter only advances when
    /// the append succeeded.
    pub async fn record(&self, payload: TracePayload) -> Result<u64, EngineError> {
        let mut next = self.next_seq.lock().await;
        let event = TraceEvent {
            run_id: self.run_id.clone(),
            seq: *next,
            timestamp: chrono::Utc::now().timestamp_millis(),
            payload,
        };

        self.store.append(&event).await?;
        tracing::trace!(
            "trace {} #{} {}",
            self.run_id,
            event.seq,
            event.kind()
        );
        *next += 1;
        Ok(event.seq)
    }
}

/// Process-local trace store
#[derive(Debug, Default)]
pub struct InMemoryTraceStore {
    runs: Mutex<HashMap<String, Vec<TraceEvent>>>,
    order: Mutex<Vec<String>>,
}

impl InMemoryTraceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TraceStore for InMemoryTraceStore {
    async fn append(&self, event: &TraceEvent) -> Result<(), EngineError> {
        let mut runs = self.runs.lock().await;
        let events = runs.entry(event.run_id.clone()).or_default();
        if events.is_empty() {
            self.order.lock().await.push(event.run_id.clone());
        }
        if events.last().is_some_and(|last| last.seq >= event.seq) {
            return Err(EngineError::Trace(format!(
                "out-of-order append of #{} to {}",
                event.seq, event.run_id
            )));
        }
        events.push(event.clone());
        Ok(())
    }

    async fn stream(&self, run_id: &str) -> Result<Vec<TraceEvent>, EngineError> {
        self.runs
            .lock()
            .await
            .get(run_id)
            .cloned()
            .ok_or_else(|| EngineError::RunNotFound(run_id.to_string()))
    }

    async fn list_runs(&self) -> Result<Vec<String>, EngineError> {
        Ok(self.order.lock().await.clone())
    }
}

/// One `{run_id}.jsonl` file per run
#[derive(Debug)]
pub struct JsonlTraceStore {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlTraceStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, EngineError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| {
            EngineError::Trace(format!("cannot create {}: {}", dir.display(), e))
        })?;
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, run_id: &str) -> Result<PathBuf, EngineError> {
        if run_id.is_empty()
            || !run_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(EngineError::Trace(format!("invalid run id {:?}", run_id)));
        }
        Ok(self.dir.join(format!("{}.jsonl", run_id)))
    }
}

#[async_trait]
impl TraceStore for JsonlTraceStore {
    async fn append(&self, event: &TraceEvent) -> Result<(), EngineError> {
        let path = self.path_for(&event.run_id)?;
        let mut line = serde_json::to_string(event)
            .map_err(|e| EngineError::Trace(format!("unserializable event: {}", e)))?;
        line.push('\n');

        let _guard = self.write_lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| EngineError::Trace(format!("cannot open {}: {}", path.display(), e)))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| EngineError::Trace(format!("append to {} failed: {}", path.display(), e)))?;
        file.flush()
            .await
            .map_err(|e| EngineError::Trace(format!("flush of {} failed: {}", path.display(), e)))?;
        Ok(())
    }

    async fn stream(&self, run_id: &str) -> Result<Vec<TraceEvent>, EngineError> {
        let path = self.path_for(run_id)?;
        let contents = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(EngineError::RunNotFound(run_id.to_string()))
            }
            Err(e) => {
                return Err(EngineError::Trace(format!(
                    "cannot read {}: {}",
                    path.display(),
                    e
                )))
            }
        };

        let mut events = contents
            .lines()
            .filter(|line| !line.trim().is_empty())
            .enumerate()
            .map(|(n, line)| {
                serde_json::from_str::<TraceEvent>(line).map_err(|e| {
                    EngineError::Trace(format!("{}:{}: {}", path.display(), n + 1, e))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        events.sort_by_key(|e| e.seq);
        Ok(events)
    }

    async fn list_runs(&self) -> Result<Vec<String>, EngineError> {
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        let mut runs = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "jsonl") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    runs.push(stem.to_string());
                }
            }
        }
        runs.sort();
        Ok(runs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conductor::types::StepStatus;
    use tempfile::TempDir;

    fn started(step: &str) -> TracePayload {
        TracePayload::StepStarted {
            plan_id: "plan-1".into(),
            step_id: step.into(),
            skill: Some("web.fetch".into()),
        }
    }

    #[tokio::test]
    async fn test_recorder_assigns_gapless_sequence() {
        let store = Arc::new(InMemoryTraceStore::new());
        let recorder = Arc::new(TraceRecorder::new("run_1", store.clone()));

        let mut handles = Vec::new();
        for i in 0..20 {
            let recorder = Arc::clone(&recorder);
            handles.push(tokio::spawn(async move {
                recorder.record(started(&format!("s{}", i))).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let seqs: Vec<u64> = store
            .stream("run_1")
            .await
            .unwrap()
            .iter()
            .map(|e| e.seq)
            .collect();
        assert_eq!(seqs, (0..20).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_event_json_shape() {
        let event = TraceEvent {
            run_id: "run_1".into(),
            seq: 3,
            timestamp: 42,
            payload: started("fetch"),
        };

        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["kind"], "step_started");
        assert_eq!(value["payload"]["step_id"], "fetch");
        assert_eq!(event.payload_json().unwrap()["plan_id"], "plan-1");

        let rebuilt = TraceEvent::from_parts(
            "run_1".into(),
            3,
            42,
            "step_started",
            event.payload_json().unwrap(),
        )
        .unwrap();
        assert_eq!(rebuilt, event);
    }

    #[tokio::test]
    async fn test_jsonl_store_persists_in_order() {
        let temp = TempDir::new().unwrap();
        let store: Arc<dyn TraceStore> = Arc::new(JsonlTraceStore::new(temp.path()).unwrap());
        let recorder = TraceRecorder::new("run_2", Arc::clone(&store));

        recorder.record(started("a")).await.unwrap();
        recorder
            .record(TracePayload::RunTerminated {
                state: RunState::Succeeded,
                reason: TerminationReason::GoalSatisfied,
                error: None,
                budget: BudgetSnapshot::default(),
            })
            .await
            .unwrap();

        let events = store.stream("run_2").await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].kind(), EventKind::RunTerminated);
        assert_eq!(store.list_runs().await.unwrap(), vec!["run_2"]);
        assert!(matches!(
            store.stream("run_missing").await,
            Err(EngineError::RunNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_jsonl_rejects_path_like_run_ids() {
        let temp = TempDir::new().unwrap();
        let store = JsonlTraceStore::new(temp.path()).unwrap();
        assert!(store.stream("../etc/passwd").await.is_err());
    }

    #[test]
    fn test_step_status_names_match_events() {
        assert_eq!(StepStatus::AwaitingApproval.as_str(), "awaiting_approval");
        assert_eq!(EventKind::ApprovalResolved.to_string(), "approval_resolved");
    }
}
