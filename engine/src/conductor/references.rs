//! Argument references between steps
//!
//! A string argument may name a field of a dependency's result as
//! `{{step_id.path.to.field}}`. A string that is exactly one reference is
//! replaced by the referenced JSON value; references embedded in longer text
//! are interpolated as strings. Resolution happens at launch, before the
//! arguments are validated against the skill contract.

use regex::Regex;
use sdk::errors::EngineError;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::OnceLock;

use super::types::Step;

fn reference_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\{\{\s*([A-Za-z0-9_\-]+)\.([A-Za-z0-9_\.\-]+)\s*\}\}")
            .expect("reference pattern is valid")
    })
}

/// Step ids referenced anywhere inside `arguments`
pub fn referenced_steps(arguments: &Value) -> Vec<String> {
    let mut found = Vec::new();
    collect(arguments, &mut found);
    found.sort();
    found.dedup();
    found
}

fn collect(value: &Value, found: &mut Vec<String>) {
    match value {
        Value::String(s) => {
            for caps in reference_pattern().captures_iter(s) {
                found.push(caps[1].to_string());
            }
        }
        Value::Array(items) => items.iter().for_each(|v| collect(v, found)),
        Value::Object(map) => map.values().for_each(|v| collect(v, found)),
        _ => {}
    }
}

/// Resolve every reference in `step`'s arguments against `results`.
///
/// Only declared dependencies may be referenced, and only when they produced
/// a result.
pub fn resolve_arguments(
    step: &Step,
    arguments: &Value,
    results: &HashMap<String, Value>,
) -> Result<Value, EngineError> {
    resolve(step, arguments, results)
}

fn resolve(step: &Step, value: &Value, results: &HashMap<String, Value>) -> Result<Value, EngineError> {
    match value {
        Value::String(s) => resolve_string(step, s, results),
        Value::Array(items) => items
            .iter()
            .map(|v| resolve(step, v, results))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (key, v) in map {
                out.insert(key.clone(), resolve(step, v, results)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

fn resolve_string(
    step: &Step,
    text: &str,
    results: &HashMap<String, Value>,
) -> Result<Value, EngineError> {
    let pattern = reference_pattern();

    if let Some(caps) = pattern.captures(text) {
        if caps.get(0).is_some_and(|m| m.start() == 0 && m.end() == text.len()) {
            return lookup(step, &caps[1], &caps[2], results).cloned();
        }
    } else {
        return Ok(Value::String(text.to_string()));
    }

    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    for caps in pattern.captures_iter(text) {
        let Some(whole) = caps.get(0) else { continue };
        out.push_str(&text[last..whole.start()]);
        match lookup(step, &caps[1], &caps[2], results)? {
            Value::String(s) => out.push_str(s),
            other => out.push_str(&other.to_string()),
        }
        last = whole.end();
    }
    out.push_str(&text[last..]);
    Ok(Value::String(out))
}

fn lookup<'a>(
    step: &Step,
    dep: &str,
    path: &str,
    results: &'a HashMap<String, Value>,
) -> Result<&'a Value, EngineError> {
    if !step.depends_on.iter().any(|d| d == dep) {
        return Err(EngineError::Validation(format!(
            "step {} references {} without depending on it",
            step.id, dep
        )));
    }
    let mut current = results.get(dep).ok_or_else(|| {
        EngineError::Validation(format!(
            "step {} references {} which produced no result",
            step.id, dep
        ))
    })?;

    for segment in path.split('.') {
        let next = match current {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        };
        current = next.ok_or_else(|| {
            EngineError::Validation(format!(
                "step {} references missing field {}.{}",
                step.id, dep, path
            ))
        })?;
    }
    Ok(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn results() -> HashMap<String, Value> {
        let mut results = HashMap::new();
        results.insert(
            "fetch".to_string(),
            json!({"content": "Body text.", "title": "Home", "items": [1, 2]}),
        );
        results
    }

    #[test]
    fn test_whole_string_reference_keeps_json_type() {
        let step = Step::invoke("sum", "text.summarize", json!({})).after(&["fetch"]);
        let args = json!({"text": "{{fetch.content}}", "n": "{{ fetch.items.1 }}"});

        let resolved = resolve_arguments(&step, &args, &results()).unwrap();
        assert_eq!(resolved["text"], "Body text.");
        assert_eq!(resolved["n"], 2);
    }

    #[test]
    fn test_embedded_reference_is_interpolated() {
        let step = Step::invoke("save", "fs.write", json!({})).after(&["fetch"]);
        let args = json!({"content": "# {{fetch.title}}\n\n{{fetch.content}}"});

        let resolved = resolve_arguments(&step, &args, &results()).unwrap();
        assert_eq!(resolved["content"], "# Home\n\nBody text.");
    }

    #[test]
    fn test_reference_requires_declared_dependency() {
        let step = Step::invoke("save", "fs.write", json!({}));
        let args = json!({"content": "{{fetch.content}}"});
        assert!(matches!(
            resolve_arguments(&step, &args, &results()),
            Err(EngineError::Validation(_))
        ));
    }

    #[test]
    fn test_missing_field_is_rejected() {
        let step = Step::invoke("save", "fs.write", json!({})).after(&["fetch"]);
        let args = json!({"content": "{{fetch.nope}}"});
        assert!(resolve_arguments(&step, &args, &results()).is_err());
    }

    #[test]
    fn test_referenced_steps() {
        let args = json!({"a": "{{x.y}} and {{z.w}}", "b": ["{{x.q}}"], "c": 3});
        assert_eq!(referenced_steps(&args), vec!["x", "z"]);
    }
}
