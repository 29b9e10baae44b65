//! Skill Registry
//!
//! Holds every invocable skill together with its compiled contract. The
//! planner reads contracts from here, the executor resolves skills and
//! validates arguments and results through the same entries. Adding a skill
//! is a `register` call; nothing else in the engine changes.

use sdk::errors::EngineError;
use sdk::skill::Skill;
use sdk::types::SkillContract;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::Config;
use crate::memory::MemoryStore;
use crate::sandbox::process::ProcessSandbox;

pub mod fs;
pub mod python;
pub mod rag;
pub mod summarize;
pub mod validation;
pub mod web;

pub use validation::ContractValidator;

/// A registered skill and its compiled schemas
pub struct RegisteredSkill {
    skill: Arc<dyn Skill>,
    validator: ContractValidator,
}

impl RegisteredSkill {
    pub fn contract(&self) -> &SkillContract {
        self.skill.contract()
    }

    pub fn skill(&self) -> &dyn Skill {
        self.skill.as_ref()
    }

    pub fn validate_input(&self, args: &serde_json::Value) -> Result<(), EngineError> {
        self.validator.validate_input(args)
    }

    pub fn validate_output(&self, result: &serde_json::Value) -> Result<(), EngineError> {
        self.validator.validate_output(result)
    }
}

impl std::fmt::Debug for RegisteredSkill {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredSkill")
            .field("name", &self.skill.name())
            .finish_non_exhaustive()
    }
}

/// Name-indexed set of skills
#[derive(Debug, Default, Clone)]
pub struct SkillRegistry {
    skills: BTreeMap<String, Arc<RegisteredSkill>>,
}

impl SkillRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a skill. Names are unique and schemas must compile.
    pub fn register(&mut self, skill: Arc<dyn Skill>) -> Result<(), EngineError> {
        let name = skill.name().to_string();
        if self.skills.contains_key(&name) {
            return Err(EngineError::Config(format!(
                "skill {} is already registered",
                name
            )));
        }

        let validator = ContractValidator::compile(skill.contract())?;
        debug!(
            "Registered skill {} ({})",
            name,
            skill.contract().side_effect
        );
        self.skills
            .insert(name, Arc::new(RegisteredSkill { skill, validator }));
        Ok(())
    }

    /// All contracts, ordered by name
    pub fn list(&self) -> Vec<&SkillContract> {
        self.skills.values().map(|entry| entry.contract()).collect()
    }

    /// Contract of the named skill
    pub fn get(&self, name: &str) -> Result<&SkillContract, EngineError> {
        self.entry(name).map(|entry| entry.contract())
    }

    /// Full registry entry of the named skill
    pub fn entry(&self, name: &str) -> Result<&Arc<RegisteredSkill>, EngineError> {
        self.skills
            .get(name)
            .ok_or_else(|| EngineError::SkillNotFound(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.skills.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.skills.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.skills.len()
    }

    pub fn is_empty(&self) -> bool {
        self.skills.is_empty()
    }

    /// Registry limited to `allowed`. An empty allowlist keeps everything;
    /// unknown names are ignored with a warning.
    pub fn restricted(&self, allowed: &[String]) -> SkillRegistry {
        if allowed.is_empty() {
            return self.clone();
        }

        for name in allowed {
            if !self.contains(name) {
                warn!("Allowlisted skill {} is not registered", name);
            }
        }

        SkillRegistry {
            skills: self
                .skills
                .iter()
                .filter(|(name, _)| allowed.iter().any(|a| a == *name))
                .map(|(name, entry)| (name.clone(), Arc::clone(entry)))
                .collect(),
        }
    }
}

/// Registry of the built-in skills, restricted by `skills.allowed`
pub fn builtin_registry(
    config: &Config,
    memory: Arc<dyn MemoryStore>,
) -> Result<SkillRegistry, EngineError> {
    let mut registry = SkillRegistry::new();

    registry.register(Arc::new(web::WebFetchSkill::new()))?;
    registry.register(Arc::new(fs::FsReadSkill::new()))?;
    registry.register(Arc::new(fs::FsWriteSkill::new()))?;
    registry.register(Arc::new(python::PythonRunSkill::new(ProcessSandbox::from_config(
        &config.sandbox,
    ))))?;
    registry.register(Arc::new(rag::RagSearchSkill::new(
        memory,
        config.memory.retrieval_k,
    )))?;
    registry.register(Arc::new(summarize::SummarizeSkill::new()))?;

    Ok(registry.restricted(&config.skills.allowed))
}
