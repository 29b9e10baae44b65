// Replaying recorded runs: re-derived plans and decisions must match the
// trace without calling any provider.

mod common;

use cairn_engine::conductor::approval::{ApprovalState, PolicyApprovals};
use cairn_engine::conductor::reflector::Decision;
use cairn_engine::conductor::types::GoalConstraints;
use cairn_engine::conductor::{Goal, HierarchicalPlanner, RunOutcome, TemplatePlanner};
use cairn_engine::trace::replay::{Divergence, ReplayReport, Replayer};
use cairn_engine::trace::{InMemoryTraceStore, JsonlTraceStore, TraceEvent, TracePayload, TraceStore};
use common::{harness, harness_with, scripted, settings, Harness};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn run_and_replay(h: &Harness, goal: &str) -> (RunOutcome, ReplayReport) {
    let outcome = h
        .orchestrator
        .run(Goal::new(goal), &CancellationToken::new())
        .await;
    let report = Replayer::new(h.traces.clone(), h.registry.clone())
        .replay(&outcome.run_id)
        .await
        .unwrap();
    (outcome, report)
}

fn assert_matches_outcome(outcome: &RunOutcome, report: &ReplayReport) {
    assert!(report.is_faithful(), "{:?}", report.divergences);
    assert_eq!(report.plans, outcome.plans);
    assert_eq!(
        report.decisions(),
        outcome.reflections.iter().map(|r| r.decision).collect::<Vec<_>>()
    );
    assert_eq!(report.terminal, Some((outcome.state, outcome.reason)));
}

/// Copy a trace into `store`, dropping events rejected by `keep` and
/// renumbering the rest
async fn copy_trace(
    from: &dyn TraceStore,
    to: &dyn TraceStore,
    run_id: &str,
    keep: impl Fn(&TraceEvent) -> bool,
) {
    let events = from.stream(run_id).await.unwrap();
    for (seq, mut event) in events.into_iter().filter(|e| keep(e)).enumerate() {
        event.seq = seq as u64;
        to.append(&event).await.unwrap();
    }
}

#[tokio::test]
async fn test_template_run_replays_faithfully() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("Replay is pure. It reads the trace."))
        .mount(&server)
        .await;

    let h = harness(Arc::new(TemplatePlanner::new()), settings(1));
    let (outcome, report) = run_and_replay(&h, &format!("Summarize {}/doc", server.uri())).await;

    assert!(outcome.succeeded(), "{:?}", outcome.error);
    assert_matches_outcome(&outcome, &report);
    assert_eq!(report.records.len(), 2);
}

#[tokio::test]
async fn test_skill_restricted_run_replays_faithfully() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("Allowlists narrow plans. Replay honours them."))
        .mount(&server)
        .await;

    let h = harness(Arc::new(TemplatePlanner::new()), settings(1));
    let goal = Goal::new(format!("Fetch {}/notes and save it to out.md", server.uri())).with_constraints(
        GoalConstraints {
            allowed_skills: Some(vec!["web.fetch".to_string(), "text.summarize".to_string()]),
            ..GoalConstraints::default()
        },
    );
    let outcome = h.orchestrator.run(goal, &CancellationToken::new()).await;
    let report = Replayer::new(h.traces.clone(), h.registry.clone())
        .replay(&outcome.run_id)
        .await
        .unwrap();

    // fs.write was not allowed, so the save step never made it into the plan
    assert_eq!(outcome.plans[0].steps.len(), 2);
    assert!(outcome.plans[0].steps.iter().all(|s| s.skill() != Some("fs.write")));
    assert!(outcome.succeeded(), "{:?}", outcome.error);
    assert_matches_outcome(&outcome, &report);
}

#[tokio::test]
async fn test_replanned_run_replays_faithfully() {
    let failing = r#"[{"id": "read", "skill": "fs.read", "arguments": {"path": "missing.txt"}}]"#;
    let working = r#"Falling back to the goal text.
        [{"id": "sum", "skill": "text.summarize", "arguments": {"text": "Plans change. Traces remember."}}]"#;
    let h = harness(scripted(&[failing, working]), settings(2));

    let (outcome, report) = run_and_replay(&h, "Summarize missing.txt").await;

    assert!(outcome.succeeded(), "{:?}", outcome.error);
    assert_eq!(outcome.iterations, 2);
    assert_eq!(report.decisions(), vec![Decision::Replan, Decision::Stop]);
    assert_matches_outcome(&outcome, &report);
}

#[tokio::test]
async fn test_hierarchical_run_replays_faithfully() {
    let manager = r#"[
        {"id": "part", "delegate": "Summarize the notes"},
        {"id": "wrap", "skill": "text.summarize", "arguments": {"text": "{{part.text}}"}, "depends_on": ["part"]}
    ]"#;
    let worker = r#"[{"id": "s", "skill": "text.summarize", "arguments": {"text": "Children plan too. They reflect."}}]"#;
    let h = harness(
        Arc::new(HierarchicalPlanner::new(scripted(&[manager, worker]), 3)),
        settings(0),
    );

    let (outcome, report) = run_and_replay(&h, "Delegate and wrap up").await;

    assert!(outcome.succeeded(), "{:?}", outcome.error);
    assert_eq!(report.decisions(), vec![Decision::Continue, Decision::Stop]);
    assert_matches_outcome(&outcome, &report);
}

#[tokio::test]
async fn test_approved_write_replays_with_its_approval() {
    let reply = r#"[{"id": "save", "skill": "fs.write", "arguments": {"path": "a.md", "content": "A"}}]"#;
    let h = harness_with(
        scripted(&[reply]),
        Arc::new(PolicyApprovals::auto_approve()),
        Duration::from_secs(5),
        settings(0),
    );

    let (outcome, report) = run_and_replay(&h, "Write a.md").await;

    assert!(outcome.succeeded(), "{:?}", outcome.error);
    assert_matches_outcome(&outcome, &report);
    assert_eq!(
        report.approvals,
        vec![("plan-1/save".to_string(), ApprovalState::Approved)]
    );
}

#[tokio::test]
async fn test_sensitive_step_without_approval_is_flagged() {
    let reply = r#"[{"id": "save", "skill": "fs.write", "arguments": {"path": "b.md", "content": "B"}}]"#;
    let h = harness_with(
        scripted(&[reply]),
        Arc::new(PolicyApprovals::auto_approve()),
        Duration::from_secs(5),
        settings(0),
    );
    let outcome = h
        .orchestrator
        .run(Goal::new("Write b.md"), &CancellationToken::new())
        .await;
    assert!(outcome.succeeded());

    let stripped = Arc::new(InMemoryTraceStore::new());
    copy_trace(h.traces.as_ref(), stripped.as_ref(), &outcome.run_id, |e| {
        !matches!(
            e.payload,
            TracePayload::ApprovalRequested { .. } | TracePayload::ApprovalResolved { .. }
        )
    })
    .await;

    let report = Replayer::new(stripped, h.registry.clone())
        .replay(&outcome.run_id)
        .await
        .unwrap();
    assert!(report.divergences.iter().any(|d| matches!(
        d,
        Divergence::UnapprovedSensitiveStep { step_id, .. } if step_id == "save"
    )));
}

#[tokio::test]
async fn test_replay_from_reopened_jsonl_store() {
    let reply = r#"[{"id": "s", "skill": "text.summarize", "arguments": {"text": "Files persist. Replays agree."}}]"#;
    let h = harness(scripted(&[reply]), settings(0));
    let outcome = h
        .orchestrator
        .run(Goal::new("Summarize"), &CancellationToken::new())
        .await;
    assert!(outcome.succeeded());

    let dir = TempDir::new().unwrap();
    {
        let store = JsonlTraceStore::new(dir.path()).unwrap();
        copy_trace(h.traces.as_ref(), &store, &outcome.run_id, |_| true).await;
    }

    let reopened = Arc::new(JsonlTraceStore::new(dir.path()).unwrap());
    assert_eq!(reopened.list_runs().await.unwrap(), vec![outcome.run_id.clone()]);

    let report = Replayer::new(reopened, h.registry.clone())
        .replay(&outcome.run_id)
        .await
        .unwrap();
    assert_matches_outcome(&outcome, &report);
}
