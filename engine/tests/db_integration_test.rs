/// Integration tests for the SQLite backends
///
/// Runs the orchestrator against the database-backed memory and trace stores
/// and checks what a later process would see:
/// - Run history rows with terminal state and budget
/// - Long-term memory written by reflection and found again by search
/// - Traces that replay without divergence
use cairn_engine::conductor::approval::{ApprovalGate, PolicyApprovals};
use cairn_engine::conductor::reflector::goal_key;
use cairn_engine::conductor::{
    Executor, Goal, LoopSettings, Orchestrator, RunState, TerminationReason, TemplatePlanner,
};
use cairn_engine::config::{AgentConfig, MemoryConfig};
use cairn_engine::db::Database;
use cairn_engine::memory::{LongTermEntry, MemoryStore, UpsertOutcome};
use cairn_engine::sandbox::LocalSandbox;
use cairn_engine::skills::rag::RagSearchSkill;
use cairn_engine::skills::summarize::SummarizeSkill;
use cairn_engine::skills::web::WebFetchSkill;
use cairn_engine::skills::SkillRegistry;
use cairn_engine::trace::replay::Replayer;
use cairn_engine::trace::TraceStore;
use sdk::types::ResourceLimits;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

fn orchestrator(db: &Database, workspace: &TempDir) -> (Orchestrator, SkillRegistry) {
    let memory = Arc::new(db.memory());
    let mut registry = SkillRegistry::new();
    registry.register(Arc::new(WebFetchSkill::new())).unwrap();
    registry.register(Arc::new(SummarizeSkill::new())).unwrap();
    registry
        .register(Arc::new(RagSearchSkill::new(memory.clone(), 3)))
        .unwrap();

    let executor = Executor::new(
        Arc::new(LocalSandbox::default()),
        ApprovalGate::new(Arc::new(PolicyApprovals::auto_deny()), Duration::from_secs(1)),
        ResourceLimits::default(),
        workspace.path().to_path_buf(),
        2,
    );
    let orchestrator = Orchestrator::new(
        Arc::new(TemplatePlanner::new()),
        executor,
        memory,
        Arc::new(db.traces()),
        registry.clone(),
        LoopSettings::from_config(&AgentConfig::default(), &MemoryConfig::default()),
    );
    (orchestrator, registry)
}

#[tokio::test]
async fn test_database_lifecycle() {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("cairn.db");

    let db = Database::new(&db_path).await.unwrap();
    assert!(db_path.exists());
    assert!(temp_dir.path().join("cairn.db-wal").exists());

    let tables: Vec<String> =
        sqlx::query_scalar("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .fetch_all(db.pool())
            .await
            .unwrap();
    for table in ["runs", "trace_events", "short_term_memory", "long_term_memory", "approvals"] {
        assert!(tables.contains(&table.to_string()), "{} table missing", table);
    }

    db.close().await.unwrap();

    // Reopening runs the migration again without error
    let db = Database::new(&db_path).await.unwrap();
    db.close().await.unwrap();
}

#[tokio::test]
async fn test_run_is_recorded_searchable_and_replayable() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string("Lighthouses guide ships. They stand on rocky coasts."),
        )
        .mount(&server)
        .await;

    let temp_dir = TempDir::new().unwrap();
    let workspace = TempDir::new().unwrap();
    let db = Database::new(&temp_dir.path().join("cairn.db")).await.unwrap();
    let (orchestrator, registry) = orchestrator(&db, &workspace);

    let goal = Goal::new(format!("Summarize {}/lighthouses", server.uri()));
    let run_id = "run_sqlite".to_string();
    db.runs().create(&run_id, &goal).await.unwrap();
    let outcome = orchestrator
        .run_with_id(run_id.clone(), goal.clone(), &CancellationToken::new())
        .await;
    db.runs().finish(&outcome).await.unwrap();

    assert!(outcome.succeeded(), "{:?}", outcome.error);

    let row = db.runs().get(&run_id).await.unwrap().unwrap();
    assert_eq!(row.state, RunState::Succeeded);
    assert_eq!(row.reason, Some(TerminationReason::GoalSatisfied));
    assert_eq!(row.steps_used, 2);
    assert!(row.finished_at.is_some());
    assert_eq!(db.runs().recent(5).await.unwrap()[0].id, run_id);

    let stored = db.memory().long_term(&goal_key(&goal.text)).await.unwrap().unwrap();
    assert!(stored.content.starts_with("Lighthouses guide ships."));
    let hits = db.memory().query_long_term("lighthouses", 3).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].key, stored.key);
    assert!(hits[0].score > 0.0);

    let reflections = db.memory().read_short_term(&run_id).await.unwrap();
    assert_eq!(reflections.len(), 1);
    assert_eq!(reflections[0].kind, "reflection");

    let traces: Arc<dyn TraceStore> = Arc::new(db.traces());
    assert_eq!(traces.list_runs().await.unwrap(), vec![run_id.clone()]);
    let report = Replayer::new(traces, registry).replay(&run_id).await.unwrap();
    assert!(report.is_faithful(), "{:?}", report.divergences);
    assert_eq!(report.plans, outcome.plans);
}

#[tokio::test]
async fn test_repeated_goal_leaves_memory_untouched() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("Tides follow the moon."))
        .mount(&server)
        .await;

    let temp_dir = TempDir::new().unwrap();
    let workspace = TempDir::new().unwrap();
    let db = Database::new(&temp_dir.path().join("cairn.db")).await.unwrap();
    let (orchestrator, _) = orchestrator(&db, &workspace);
    let goal = Goal::new(format!("Summarize {}/tides", server.uri()));
    let key = goal_key(&goal.text);

    let first = orchestrator.run(goal.clone(), &CancellationToken::new()).await;
    assert!(first.succeeded(), "{:?}", first.error);
    let before = db.memory().long_term(&key).await.unwrap().unwrap();

    let second = orchestrator.run(goal, &CancellationToken::new()).await;
    assert!(second.succeeded(), "{:?}", second.error);
    assert!(second.reflections[0].memory_delta.long_term.is_empty());

    let after = db.memory().long_term(&key).await.unwrap().unwrap();
    assert_eq!(after, before);
}

#[tokio::test]
async fn test_concurrent_upserts_keep_newest() {
    let temp_dir = TempDir::new().unwrap();
    let db = Database::new(&temp_dir.path().join("cairn.db")).await.unwrap();
    let store = Arc::new(db.memory());

    let writers: Vec<_> = (0..8i64)
        .map(|i| {
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                store
                    .upsert_long_term(LongTermEntry {
                        key: "shared".to_string(),
                        content: format!("version {}", i),
                        metadata: json!({"writer": i}),
                        updated_at: 1_000 + i,
                    })
                    .await
                    .unwrap()
            })
        })
        .collect();
    for writer in writers {
        writer.await.unwrap();
    }

    let stored = store.long_term("shared").await.unwrap().unwrap();
    assert_eq!(stored.content, "version 7");
    assert_eq!(stored.updated_at, 1_007);

    let stale = store
        .upsert_long_term(LongTermEntry {
            key: "shared".to_string(),
            content: "late".to_string(),
            metadata: json!({}),
            updated_at: 1_003,
        })
        .await
        .unwrap();
    assert_eq!(stale, UpsertOutcome::Stale);

    // the FTS index follows the surviving row only
    assert!(store.query_long_term("late", 5).await.unwrap().is_empty());
    assert_eq!(store.query_long_term("version", 5).await.unwrap().len(), 1);
}
