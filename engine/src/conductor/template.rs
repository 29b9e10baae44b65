//! Rule-based planner for offline use
//!
//! Recognizes a few goal shapes and emits fixed plans for them. No provider
//! is involved, so the same goal and registry always give the same plan.

use async_trait::async_trait;
use regex::Regex;
use sdk::errors::EngineError;
use serde_json::json;
use std::collections::{BTreeMap, HashSet};
use std::sync::OnceLock;

use super::planner::{PlanScope, Planner};
use super::types::{Goal, Plan, Step, StepRecord};
use crate::memory::MemorySnapshot;
use crate::skills::SkillRegistry;

const DEFAULT_OUTPUT: &str = "summary.md";

struct GoalPatterns {
    url: Regex,
    file: Regex,
}

fn patterns() -> &'static GoalPatterns {
    static PATTERNS: OnceLock<GoalPatterns> = OnceLock::new();
    PATTERNS.get_or_init(|| GoalPatterns {
        url: Regex::new(r#"https?://[^\s"'<>]+"#).expect("url pattern is valid"),
        file: Regex::new(r"(?:^|\s)([\w\-./]+\.(?:md|txt|json|html))\b").expect("file pattern is valid"),
    })
}

fn find_url(goal: &str) -> Option<String> {
    patterns()
        .url
        .find(goal)
        .map(|m| m.as_str().trim_end_matches(['.', ',', ';', ')']).to_string())
}

fn find_output_file(goal: &str, url: Option<&str>) -> String {
    patterns()
        .file
        .captures_iter(goal)
        .filter_map(|caps| caps.get(1).map(|m| m.as_str().to_string()))
        .find(|file| url.map_or(true, |url| !url.contains(file.as_str())))
        .unwrap_or_else(|| DEFAULT_OUTPUT.to_string())
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TemplatePlanner;

impl TemplatePlanner {
    pub fn new() -> Self {
        Self
    }

    fn template(&self, goal: &str) -> (&'static str, Vec<Step>) {
        let lower = goal.to_lowercase();
        let url = find_url(goal);

        match url {
            Some(url) if lower.contains("save") || lower.contains("write") => {
                let path = find_output_file(goal, Some(&url));
                (
                    "fetch, summarize and save",
                    vec![
                        Step::invoke("fetch", "web.fetch", json!({ "url": url })),
                        Step::invoke("summarize", "text.summarize", json!({ "text": "{{fetch.content}}" }))
                            .after(&["fetch"]),
                        Step::invoke(
                            "save",
                            "fs.write",
                            json!({ "path": path, "content": "{{summarize.summary}}\n" }),
                        )
                        .after(&["summarize"]),
                    ],
                )
            }
            Some(url) => (
                "fetch and summarize",
                vec![
                    Step::invoke("fetch", "web.fetch", json!({ "url": url })),
                    Step::invoke("summarize", "text.summarize", json!({ "text": "{{fetch.content}}" }))
                        .after(&["fetch"]),
                ],
            ),
            None => (
                "search memory",
                vec![Step::invoke("search", "rag.search", json!({ "query": goal }))],
            ),
        }
    }
}

#[async_trait]
impl Planner for TemplatePlanner {
    async fn propose(
        &self,
        goal: &Goal,
        _memory: &MemorySnapshot,
        registry: &SkillRegistry,
        _prior: &[StepRecord],
        scope: &PlanScope,
    ) -> Result<Plan, EngineError> {
        let (name, candidates) = self.template(&goal.text);

        // Steps are listed in dependency order, so one pass drops the
        // unavailable ones together with everything downstream of them.
        let mut dropped = HashSet::new();
        let mut steps = Vec::new();
        for step in candidates {
            let available = step.skill().is_some_and(|skill| registry.contains(skill));
            if !available || step.depends_on.iter().any(|d| dropped.contains(d)) {
                tracing::debug!("Template step {} dropped: skill unavailable", step.id);
                dropped.insert(step.id.clone());
                continue;
            }
            steps.push(step);
        }

        if steps.is_empty() {
            return Err(EngineError::Planning(format!(
                "no viable decomposition for '{}' with the available skills",
                goal.text
            )));
        }

        Ok(Plan {
            id: scope.plan_id.clone(),
            goal: goal.text.clone(),
            iteration: scope.iteration,
            depth: scope.depth,
            steps,
            rationale: format!("template: {}", name),
            raw_completions: Vec::new(),
            children: BTreeMap::new(),
        })
    }
}
