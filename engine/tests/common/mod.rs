// Shared fixtures for the engine integration tests
#![allow(dead_code)]

use cairn_engine::conductor::approval::{ApprovalChannel, ApprovalGate, PolicyApprovals};
use cairn_engine::conductor::{Executor, LlmPlanner, LoopSettings, Orchestrator, Planner};
use cairn_engine::config::{AgentConfig, MemoryConfig};
use cairn_engine::llm::retry::RetryPolicy;
use cairn_engine::llm::scripted::ScriptedProvider;
use cairn_engine::llm::CompletionOptions;
use cairn_engine::memory::InMemoryStore;
use cairn_engine::sandbox::LocalSandbox;
use cairn_engine::skills::fs::{FsReadSkill, FsWriteSkill};
use cairn_engine::skills::rag::RagSearchSkill;
use cairn_engine::skills::summarize::SummarizeSkill;
use cairn_engine::skills::web::WebFetchSkill;
use cairn_engine::skills::SkillRegistry;
use cairn_engine::trace::InMemoryTraceStore;
use sdk::types::ResourceLimits;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

pub struct Harness {
    pub orchestrator: Orchestrator,
    pub memory: Arc<InMemoryStore>,
    pub traces: Arc<InMemoryTraceStore>,
    pub registry: SkillRegistry,
    pub workspace: TempDir,
}

pub fn registry(memory: Arc<InMemoryStore>) -> SkillRegistry {
    let mut registry = SkillRegistry::new();
    registry.register(Arc::new(WebFetchSkill::new())).unwrap();
    registry.register(Arc::new(FsReadSkill::new())).unwrap();
    registry.register(Arc::new(FsWriteSkill::new())).unwrap();
    registry.register(Arc::new(RagSearchSkill::new(memory, 3))).unwrap();
    registry.register(Arc::new(SummarizeSkill::new())).unwrap();
    registry
}

pub fn settings(max_replans: u32) -> LoopSettings {
    let mut settings = LoopSettings::from_config(&AgentConfig::default(), &MemoryConfig::default());
    settings.max_replans = max_replans;
    settings
}

/// Planner answering from a fixed script, one attempt per call
pub fn scripted(replies: &[&str]) -> Arc<dyn Planner> {
    let provider = Arc::new(ScriptedProvider::new(replies.iter().copied()));
    let retry = RetryPolicy {
        max_attempts: 1,
        ..RetryPolicy::default()
    };
    Arc::new(LlmPlanner::new(provider, CompletionOptions::default(), retry).with_delegation())
}

pub fn harness_with(
    planner: Arc<dyn Planner>,
    channel: Arc<dyn ApprovalChannel>,
    window: Duration,
    settings: LoopSettings,
) -> Harness {
    let workspace = TempDir::new().unwrap();
    let memory = Arc::new(InMemoryStore::new());
    let traces = Arc::new(InMemoryTraceStore::new());
    let registry = registry(memory.clone());

    let executor = Executor::new(
        Arc::new(LocalSandbox::default()),
        ApprovalGate::new(channel, window),
        ResourceLimits::default(),
        workspace.path().to_path_buf(),
        2,
    );

    Harness {
        orchestrator: Orchestrator::new(
            planner,
            executor,
            memory.clone(),
            traces.clone(),
            registry.clone(),
            settings,
        ),
        memory,
        traces,
        registry,
        workspace,
    }
}

/// Harness whose sensitive steps are denied
pub fn harness(planner: Arc<dyn Planner>, settings: LoopSettings) -> Harness {
    harness_with(
        planner,
        Arc::new(PolicyApprovals::auto_deny()),
        Duration::from_secs(1),
        settings,
    )
}
