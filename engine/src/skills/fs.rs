//! `fs.read` and `fs.write`: workspace-confined file access
//!
//! All paths are validated through `FileSystemGuard` before any I/O. The
//! guard is built from the invocation's workspace, so each run stays inside
//! its own root.

use async_trait::async_trait;
use sdk::errors::EngineError;
use sdk::skill::{Skill, SkillContext};
use sdk::types::{SideEffectClass, SkillContract};
use serde_json::{json, Value};
use std::path::Path;
use tokio::fs;
use tracing::{debug, info, warn};

use crate::fs_guard::FileSystemGuard;

fn path_arg(args: &Value) -> Result<&str, EngineError> {
    args.get("path")
        .and_then(Value::as_str)
        .ok_or_else(|| EngineError::Validation("path must be a string".into()))
}

fn display_path(guard: &FileSystemGuard, path: &Path) -> String {
    path.strip_prefix(guard.workspace())
        .unwrap_or(path)
        .display()
        .to_string()
}

/// Reads a text file from the workspace
pub struct FsReadSkill {
    contract: SkillContract,
}

impl Default for FsReadSkill {
    fn default() -> Self {
        Self::new()
    }
}

impl FsReadSkill {
    pub fn new() -> Self {
        Self {
            contract: SkillContract::new(
                "fs.read",
                "Read a text file inside the workspace",
                json!({
                    "type": "object",
                    "properties": {"path": {"type": "string", "minLength": 1}},
                    "required": ["path"],
                    "additionalProperties": false
                }),
                json!({
                    "type": "object",
                    "properties": {
                        "path": {"type": "string"},
                        "content": {"type": "string"},
                        "bytes": {"type": "integer", "minimum": 0},
                        "encoding": {"type": "string"}
                    },
                    "required": ["path", "content", "bytes"]
                }),
                SideEffectClass::ReadOnly,
            ),
        }
    }
}

#[async_trait]
impl Skill for FsReadSkill {
    fn contract(&self) -> &SkillContract {
        &self.contract
    }

    async fn invoke(&self, ctx: &SkillContext, args: Value) -> Result<Value, EngineError> {
        let guard = FileSystemGuard::new(&ctx.workspace)?;
        let path = guard.resolve_existing(path_arg(&args)?).inspect_err(|e| {
            warn!("Path validation failed: {}", e);
        })?;

        if !path.is_file() {
            return Err(EngineError::Sandbox(format!(
                "not a file: {}",
                display_path(&guard, &path)
            )));
        }

        info!("Reading file: {}", path.display());
        let raw = fs::read(&path).await?;
        let bytes = raw.len();
        let (content, encoding) = match String::from_utf8(raw) {
            Ok(text) => (text, "utf-8"),
            Err(e) => (
                String::from_utf8_lossy(e.as_bytes()).into_owned(),
                "utf-8-lossy",
            ),
        };

        debug!("Read {} bytes from {}", bytes, path.display());
        Ok(json!({
            "path": display_path(&guard, &path),
            "content": content,
            "bytes": bytes,
            "encoding": encoding,
        }))
    }
}

/// Writes a text file into the workspace; requires approval
pub struct FsWriteSkill {
    contract: SkillContract,
}

impl Default for FsWriteSkill {
    fn default() -> Self {
        Self::new()
    }
}

impl FsWriteSkill {
    pub fn new() -> Self {
        Self {
            contract: SkillContract::new(
                "fs.write",
                "Write a text file inside the workspace, creating parent directories",
                json!({
                    "type": "object",
                    "properties": {
                        "path": {"type": "string", "minLength": 1},
                        "content": {"type": "string"},
                        "encoding": {"type": "string", "enum": ["utf-8"]}
                    },
                    "required": ["path", "content"],
                    "additionalProperties": false
                }),
                json!({
                    "type": "object",
                    "properties": {
                        "path": {"type": "string"},
                        "bytes_written": {"type": "integer", "minimum": 0}
                    },
                    "required": ["path", "bytes_written"]
                }),
                SideEffectClass::Sensitive,
            ),
        }
    }
}

#[async_trait]
impl Skill for FsWriteSkill {
    fn contract(&self) -> &SkillContract {
        &self.contract
    }

    async fn invoke(&self, ctx: &SkillContext, args: Value) -> Result<Value, EngineError> {
        let guard = FileSystemGuard::new(&ctx.workspace)?;
        let content = args
            .get("content")
            .and_then(Value::as_str)
            .ok_or_else(|| EngineError::Validation("content must be a string".into()))?;
        let target = guard.resolve_for_write(path_arg(&args)?).inspect_err(|e| {
            warn!("Path validation failed: {}", e);
        })?;

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }

        info!("Writing {} bytes to: {}", content.len(), target.display());
        fs::write(&target, content).await?;

        Ok(json!({
            "path": display_path(&guard, &target),
            "bytes_written": content.len(),
        }))
    }
}
