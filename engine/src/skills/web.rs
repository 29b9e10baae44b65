//! `web.fetch`: download a page and reduce it to readable text

use async_trait::async_trait;
use regex::Regex;
use sdk::errors::EngineError;
use sdk::skill::{Skill, SkillContext};
use sdk::types::{SideEffectClass, SkillContract};
use serde_json::{json, Value};
use std::sync::OnceLock;

const DEFAULT_MAX_CHARS: usize = 10_000;

struct HtmlPatterns {
    title: Regex,
    script: Regex,
    style: Regex,
    tag: Regex,
    whitespace: Regex,
}

static HTML_PATTERNS: OnceLock<HtmlPatterns> = OnceLock::new();

fn patterns() -> &'static HtmlPatterns {
    HTML_PATTERNS.get_or_init(|| HtmlPatterns {
        title: Regex::new(r"(?is)<title[^>]*>(.*?)</title>").expect("Invalid title pattern"),
        script: Regex::new(r"(?is)<script\b.*?</script>").expect("Invalid script pattern"),
        style: Regex::new(r"(?is)<style\b.*?</style>").expect("Invalid style pattern"),
        tag: Regex::new(r"<[^>]+>").expect("Invalid tag pattern"),
        whitespace: Regex::new(r"\s+").expect("Invalid whitespace pattern"),
    })
}

fn decode_entities(text: &str) -> String {
    text.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}

/// Title and visible text of an HTML document. Plain text passes through
/// with whitespace collapsed.
pub fn extract_text(html: &str) -> (Option<String>, String) {
    let p = patterns();

    let title = p
        .title
        .captures(html)
        .and_then(|c| c.get(1))
        .map(|m| decode_entities(p.whitespace.replace_all(m.as_str(), " ").trim()))
        .filter(|t| !t.is_empty());

    let body = p.script.replace_all(html, " ");
    let body = p.style.replace_all(&body, " ");
    let body = p.title.replace_all(&body, " ");
    let body = p.tag.replace_all(&body, " ");
    let body = decode_entities(&body);
    let body = p.whitespace.replace_all(&body, " ").trim().to_string();

    (title, body)
}

/// Fetches a URL over HTTP(S)
pub struct WebFetchSkill {
    contract: SkillContract,
    client: reqwest::Client,
}

impl Default for WebFetchSkill {
    fn default() -> Self {
        Self::new()
    }
}

impl WebFetchSkill {
    pub fn new() -> Self {
        let contract = SkillContract::new(
            "web.fetch",
            "Fetch a web page and return its title and readable text",
            json!({
                "type": "object",
                "properties": {
                    "url": {"type": "string", "pattern": "^https?://"},
                    "max_chars": {"type": "integer", "minimum": 1}
                },
                "required": ["url"],
                "additionalProperties": false
            }),
            json!({
                "type": "object",
                "properties": {
                    "content": {"type": "string"},
                    "title": {"type": "string"},
                    "source": {"type": "string"}
                },
                "required": ["content", "title", "source"]
            }),
            SideEffectClass::ReadOnly,
        );

        Self {
            contract,
            client: reqwest::Client::builder()
                .user_agent(concat!("cairn/", env!("CARGO_PKG_VERSION")))
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
        }
    }
}

#[async_trait]
impl Skill for WebFetchSkill {
    fn contract(&self) -> &SkillContract {
        &self.contract
    }

    async fn invoke(&self, ctx: &SkillContext, args: Value) -> Result<Value, EngineError> {
        let url = args
            .get("url")
            .and_then(Value::as_str)
            .ok_or_else(|| EngineError::Validation("url must be a string".into()))?;
        let max_chars = args
            .get("max_chars")
            .and_then(Value::as_u64)
            .map(|n| n as usize)
            .unwrap_or(DEFAULT_MAX_CHARS);

        tracing::info!("Fetching {}", url);

        let response = self
            .client
            .get(url)
            .timeout(ctx.limits.timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    EngineError::SandboxTimeout(ctx.limits.timeout.as_millis() as u64)
                } else {
                    EngineError::Sandbox(format!("failed to fetch {}: {}", url, e))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(EngineError::Sandbox(format!(
                "failed to fetch {}: HTTP {}",
                url,
                status.as_u16()
            )));
        }

        let body = response
            .text()
            .await
            .map_err(|e| EngineError::Sandbox(format!("failed to read body of {}: {}", url, e)))?;

        let (title, text) = extract_text(&body);
        let content: String = text.chars().take(max_chars).collect();

        tracing::debug!("Fetched {} chars from {}", content.len(), url);

        Ok(json!({
            "content": content,
            "title": title.unwrap_or_else(|| url.to_string()),
            "source": url,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_text_strips_markup() {
        let html = r#"<html><head><title> Rust &amp; Tokio </title>
            <style>body { color: red }</style></head>
            <body><script>alert("x")</script><h1>Hello</h1>
            <p>Async   runtime.</p></body></html>"#;

        let (title, text) = extract_text(html);

        assert_eq!(title.as_deref(), Some("Rust & Tokio"));
        assert_eq!(text, "Hello Async runtime.");
    }

    #[test]
    fn test_extract_plain_text() {
        let (title, text) = extract_text("just\n\ntext");
        assert!(title.is_none());
        assert_eq!(text, "just text");
    }
}
