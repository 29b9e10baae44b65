//! `python.run`: execute a Python snippet in the process sandbox
//!
//! Code is screened before anything is spawned:
//! 1. Dangerous imports (os, sys, subprocess, socket, ...)
//! 2. Dynamic evaluation and import hooks
//! 3. File operations
//! 4. Network protocol names
//!
//! Screening is a coarse first gate; the process sandbox limits still apply
//! to everything that passes.

use async_trait::async_trait;
use sdk::errors::EngineError;
use sdk::skill::{Skill, SkillContext};
use sdk::types::{SideEffectClass, SkillContract};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{info, warn};

use crate::sandbox::process::ProcessSandbox;

const DENIED_MODULES: &[&str] = &[
    "os",
    "sys",
    "subprocess",
    "socket",
    "requests",
    "urllib",
    "pickle",
    "importlib",
    "shutil",
    "ctypes",
];

const DENIED_CALLS: &[&str] = &["eval(", "exec(", "__import__", "compile("];

const FILE_OPERATIONS: &[&str] = &["open(", "file(", ".remove(", ".unlink(", ".rmdir("];

const NETWORK_OPERATIONS: &[&str] = &["socket", "http", "ftp", "smtp"];

/// Reason a snippet was refused
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodeRejection {
    #[error("import of '{0}' is not allowed")]
    DeniedImport(String),

    #[error("call '{0}' is not allowed")]
    DeniedCall(String),

    #[error("file operation '{0}' is not allowed")]
    FileOperation(String),

    #[error("network operation '{0}' is not allowed")]
    NetworkOperation(String),
}

/// Screen `code` through the deny lists
pub fn screen_code(code: &str) -> Result<(), CodeRejection> {
    // Gate 1: imports, matched per line so `import numpy as os_np` passes
    for line in code.lines().map(str::trim) {
        let module = if let Some(rest) = line.strip_prefix("import ") {
            rest
        } else if let Some(rest) = line.strip_prefix("from ") {
            rest
        } else {
            continue;
        };

        for name in module.split(',').map(str::trim) {
            let root = name
                .split(|c: char| c == '.' || c.is_whitespace())
                .next()
                .unwrap_or_default();
            if DENIED_MODULES.contains(&root) {
                return Err(CodeRejection::DeniedImport(root.to_string()));
            }
        }
    }

    // Gate 2
    if let Some(call) = DENIED_CALLS.iter().find(|c| code.contains(**c)) {
        return Err(CodeRejection::DeniedCall(call.to_string()));
    }

    // Gate 3
    if let Some(op) = FILE_OPERATIONS.iter().find(|op| code.contains(**op)) {
        return Err(CodeRejection::FileOperation(op.to_string()));
    }

    // Gate 4
    let lowered = code.to_lowercase();
    if let Some(op) = NETWORK_OPERATIONS.iter().find(|op| lowered.contains(**op)) {
        return Err(CodeRejection::NetworkOperation(op.to_string()));
    }

    Ok(())
}

/// Runs screened Python code under CPU, memory, output and time ceilings
pub struct PythonRunSkill {
    contract: SkillContract,
    sandbox: ProcessSandbox,
}

impl PythonRunSkill {
    pub fn new(sandbox: ProcessSandbox) -> Self {
        Self {
            contract: SkillContract::new(
                "python.run",
                "Run a short Python 3 program and capture its output",
                json!({
                    "type": "object",
                    "properties": {"code": {"type": "string", "minLength": 1}},
                    "required": ["code"],
                    "additionalProperties": false
                }),
                json!({
                    "type": "object",
                    "properties": {
                        "return_code": {"type": "integer"},
                        "stdout": {"type": "string"},
                        "stderr": {"type": "string"}
                    },
                    "required": ["return_code", "stdout", "stderr"]
                }),
                SideEffectClass::Mutating,
            )
            .with_cost(2),
            sandbox,
        }
    }
}

#[async_trait]
impl Skill for PythonRunSkill {
    fn contract(&self) -> &SkillContract {
        &self.contract
    }

    async fn invoke(&self, ctx: &SkillContext, args: Value) -> Result<Value, EngineError> {
        let code = args
            .get("code")
            .and_then(Value::as_str)
            .ok_or_else(|| EngineError::Validation("code must be a string".into()))?;

        if let Err(rejection) = screen_code(code) {
            warn!("Rejected python.run code for {}: {}", ctx.step_id, rejection);
            return Err(EngineError::Validation(format!(
                "code rejected: {}",
                rejection
            )));
        }

        let scratch = std::env::temp_dir().join(format!(
            "cairn-{}-{}-{}",
            ctx.run_id,
            ctx.step_id,
            uuid::Uuid::new_v4().simple()
        ));
        tokio::fs::create_dir_all(&scratch).await?;
        let script = scratch.join("main.py");
        tokio::fs::write(&script, code).await?;

        info!("Running python.run for step {}", ctx.step_id);
        let result = self
            .sandbox
            .run(
                self.sandbox.python_bin(),
                &["-u", "main.py"],
                &scratch,
                &ctx.limits,
                &ctx.cancel,
            )
            .await;

        if let Err(e) = tokio::fs::remove_dir_all(&scratch).await {
            warn!("Failed to clean up {}: {}", scratch.display(), e);
        }

        let output = result?;
        Ok(json!({
            "return_code": output.return_code,
            "stdout": output.stdout,
            "stderr": output.stderr,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_code_passes() {
        assert!(screen_code("import math\nprint(math.sqrt(16))").is_ok());
        assert!(screen_code("from collections import Counter").is_ok());
    }

    #[test]
    fn test_denied_imports() {
        assert_eq!(
            screen_code("import os"),
            Err(CodeRejection::DeniedImport("os".into()))
        );
        assert_eq!(
            screen_code("import json, subprocess"),
            Err(CodeRejection::DeniedImport("subprocess".into()))
        );
        assert_eq!(
            screen_code("from os.path import join"),
            Err(CodeRejection::DeniedImport("os".into()))
        );
    }

    #[test]
    fn test_dynamic_evaluation_and_files() {
        assert!(matches!(
            screen_code("eval('1+1')"),
            Err(CodeRejection::DeniedCall(_))
        ));
        assert!(matches!(
            screen_code("open('/etc/passwd').read()"),
            Err(CodeRejection::FileOperation(_))
        ));
        assert!(matches!(
            screen_code("print('see HTTP spec')"),
            Err(CodeRejection::NetworkOperation(_))
        ));
    }
}
