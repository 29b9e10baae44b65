//! Configuration management
//!
//! This module handles loading, validation, and management of the Cairn configuration.
//! Configuration is stored in TOML format at ~/.cairn/config.toml.
//!
//! # Configuration Sections
//!
//! - **core**: Workspace path, log level, data directory
//! - **llm**: Completion provider selection, retry and timeout policy
//! - **agent**: Run budgets (iterations, steps, cost, wall clock) and concurrency
//! - **planner**: Planning mode and hierarchical depth ceiling
//! - **skills**: Skill allowlist
//! - **sandbox**: Per-invocation resource ceilings
//! - **approval**: Approval channel mode and window
//! - **memory**: Memory backend and retrieval depth
//! - **trace**: Trace backend and directory
//!
//! # Path Expansion
//!
//! The configuration system automatically:
//! - Expands ~ to the user's home directory
//! - Canonicalizes the workspace to resolve symlinks and .. patterns
//! - Creates the workspace and data directories if they don't exist
//!
//! # Examples
//!
//! ```no_run
//! use cairn_engine::config::Config;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::load_or_create()?;
//!
//! println!("Workspace: {:?}", config.core.workspace);
//! println!("Provider: {}", config.llm.provider);
//! # Ok(())
//! # }
//! ```

use sdk::errors::EngineError;
use sdk::types::ResourceLimits;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure
///
/// Only the `core` section is required; every other section falls back to
/// its defaults when omitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Core engine settings
    pub core: CoreConfig,

    /// Completion provider configuration
    #[serde(default)]
    pub llm: LLMConfig,

    /// Run budgets and concurrency
    #[serde(default)]
    pub agent: AgentConfig,

    /// Planner configuration
    #[serde(default)]
    pub planner: PlannerConfig,

    /// Skill allowlist
    #[serde(default)]
    pub skills: SkillsConfig,

    /// Sandbox resource ceilings
    #[serde(default)]
    pub sandbox: SandboxConfig,

    /// Approval gate configuration
    #[serde(default)]
    pub approval: ApprovalConfig,

    /// Memory configuration
    #[serde(default)]
    pub memory: MemoryConfig,

    /// Trace configuration
    #[serde(default)]
    pub trace: TraceConfig,
}

/// Core engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Workspace directory path (supports ~ expansion)
    pub workspace: PathBuf,

    /// Log level (error, warn, info, debug, trace)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log format (auto, pretty, json)
    #[serde(default = "default_log_format")]
    pub log_format: String,

    /// Data directory path (supports ~ expansion)
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

/// Completion provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LLMConfig {
    /// Provider (ollama, openai, scripted)
    #[serde(default = "default_provider")]
    pub provider: String,

    /// Sampling temperature
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Maximum tokens per completion
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// Per-attempt timeout in seconds
    #[serde(default = "default_llm_timeout")]
    pub timeout_secs: u64,

    /// Attempts for transient provider errors
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial backoff between attempts in milliseconds (doubles per attempt)
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,

    /// Ollama provider settings
    #[serde(default)]
    pub ollama: OllamaConfig,

    /// OpenAI-compatible provider settings
    #[serde(default)]
    pub openai: OpenAIConfig,
}

/// Ollama provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OllamaConfig {
    /// Base URL for Ollama API
    #[serde(default = "default_ollama_base_url")]
    pub base_url: String,

    /// Model name
    #[serde(default = "default_ollama_model")]
    pub model: String,
}

/// OpenAI-compatible provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAIConfig {
    /// Base URL for the chat completions API
    #[serde(default = "default_openai_base_url")]
    pub base_url: String,

    /// Model name
    #[serde(default = "default_openai_model")]
    pub model: String,

    /// Environment variable holding the API key
    #[serde(default = "default_openai_key_env")]
    pub api_key_env: String,
}

/// Run budgets and concurrency
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Maximum plan → act → reflect iterations per run
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,

    /// Maximum executed steps per run
    #[serde(default = "default_max_steps")]
    pub max_steps: u64,

    /// Maximum cost units per run
    #[serde(default = "default_max_cost")]
    pub max_cost: u64,

    /// Wall-clock ceiling per run in seconds
    #[serde(default = "default_max_duration")]
    pub max_duration_secs: u64,

    /// Concurrent step ceiling inside one executor walk
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Maximum replans before a blocked run stops
    #[serde(default = "default_max_replans")]
    pub max_replans: u32,
}

/// Planning mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlannerMode {
    /// Single flat DAG per iteration
    Flat,
    /// Manager plan whose delegations expand into child plans
    Hierarchical,
    /// Offline rule-based planner, no provider calls
    Template,
}

/// Planner configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannerConfig {
    /// Planning mode
    #[serde(default = "default_planner_mode")]
    pub mode: PlannerMode,

    /// Maximum depth of child plans in hierarchical mode
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,
}

/// Skill allowlist
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SkillsConfig {
    /// Allowed skill names; empty means all built-ins
    #[serde(default)]
    pub allowed: Vec<String>,
}

/// Sandbox ceilings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Default invocation timeout in seconds
    #[serde(default = "default_sandbox_timeout")]
    pub timeout_secs: u64,

    /// Maximum serialized result size in bytes
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,

    /// CPU-seconds ceiling for child processes
    #[serde(default = "default_cpu_seconds")]
    pub cpu_seconds: u64,

    /// Address-space ceiling for child processes in MB
    #[serde(default = "default_memory_mb")]
    pub memory_mb: u64,

    /// Grace period between SIGTERM and force kill in milliseconds
    #[serde(default = "default_kill_grace_ms")]
    pub kill_grace_ms: u64,

    /// Interpreter used by python.run
    #[serde(default = "default_python_bin")]
    pub python_bin: String,
}

/// Approval channel mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalMode {
    /// Pending approvals are resolved with `cairn approvals`
    Interactive,
    /// Every sensitive step is approved
    AutoApprove,
    /// Every sensitive step is denied
    AutoDeny,
}

/// Approval gate configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalConfig {
    /// Channel mode
    #[serde(default = "default_approval_mode")]
    pub mode: ApprovalMode,

    /// Window before a pending approval lapses to timed_out, in seconds
    #[serde(default = "default_approval_window")]
    pub window_secs: u64,

    /// Poll interval for interactive approvals in milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

/// Memory backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryBackend {
    Sqlite,
    Memory,
}

/// Memory configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Storage backend
    #[serde(default = "default_memory_backend")]
    pub backend: MemoryBackend,

    /// Long-term results retrieved per planning snapshot
    #[serde(default = "default_retrieval_k")]
    pub retrieval_k: usize,
}

/// Trace backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceBackend {
    Jsonl,
    Sqlite,
}

/// Trace configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceConfig {
    /// Storage backend
    #[serde(default = "default_trace_backend")]
    pub backend: TraceBackend,

    /// Directory for JSONL traces (supports ~ expansion)
    #[serde(default = "default_trace_dir")]
    pub dir: PathBuf,
}

// Default value functions
fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "auto".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("~/.cairn")
}

fn default_provider() -> String {
    "ollama".to_string()
}

fn default_temperature() -> f32 {
    0.2
}

fn default_max_tokens() -> u32 {
    2000
}

fn default_llm_timeout() -> u64 {
    120
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_ms() -> u64 {
    500
}

fn default_ollama_base_url() -> String {
    "http://localhost:11434".to_string()
}

fn default_ollama_model() -> String {
    "llama3.1:8b".to_string()
}

fn default_openai_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_openai_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_openai_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

fn default_max_iterations() -> u32 {
    5
}

fn default_max_steps() -> u64 {
    25
}

fn default_max_cost() -> u64 {
    100
}

fn default_max_duration() -> u64 {
    600
}

fn default_max_concurrency() -> usize {
    4
}

fn default_max_replans() -> u32 {
    2
}

fn default_planner_mode() -> PlannerMode {
    PlannerMode::Flat
}

fn default_max_depth() -> usize {
    2
}

fn default_sandbox_timeout() -> u64 {
    30
}

fn default_max_output_bytes() -> usize {
    100_000
}

fn default_cpu_seconds() -> u64 {
    30
}

fn default_memory_mb() -> u64 {
    512
}

fn default_kill_grace_ms() -> u64 {
    2000
}

fn default_python_bin() -> String {
    "python3".to_string()
}

fn default_approval_mode() -> ApprovalMode {
    ApprovalMode::Interactive
}

fn default_approval_window() -> u64 {
    300
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_memory_backend() -> MemoryBackend {
    MemoryBackend::Sqlite
}

fn default_retrieval_k() -> usize {
    5
}

fn default_trace_backend() -> TraceBackend {
    TraceBackend::Jsonl
}

fn default_trace_dir() -> PathBuf {
    PathBuf::from("~/.cairn/traces")
}

impl Default for LLMConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            timeout_secs: default_llm_timeout(),
            max_attempts: default_max_attempts(),
            backoff_ms: default_backoff_ms(),
            ollama: OllamaConfig::default(),
            openai: OpenAIConfig::default(),
        }
    }
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            base_url: default_ollama_base_url(),
            model: default_ollama_model(),
        }
    }
}

impl Default for OpenAIConfig {
    fn default() -> Self {
        Self {
            base_url: default_openai_base_url(),
            model: default_openai_model(),
            api_key_env: default_openai_key_env(),
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            max_steps: default_max_steps(),
            max_cost: default_max_cost(),
            max_duration_secs: default_max_duration(),
            max_concurrency: default_max_concurrency(),
            max_replans: default_max_replans(),
        }
    }
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            mode: default_planner_mode(),
            max_depth: default_max_depth(),
        }
    }
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_sandbox_timeout(),
            max_output_bytes: default_max_output_bytes(),
            cpu_seconds: default_cpu_seconds(),
            memory_mb: default_memory_mb(),
            kill_grace_ms: default_kill_grace_ms(),
            python_bin: default_python_bin(),
        }
    }
}

impl SandboxConfig {
    /// Resource ceilings applied to each invocation unless a contract overrides the timeout
    pub fn limits(&self) -> ResourceLimits {
        ResourceLimits {
            timeout: Duration::from_secs(self.timeout_secs),
            max_output_bytes: self.max_output_bytes,
            cpu_seconds: self.cpu_seconds,
            memory_bytes: self.memory_mb * 1024 * 1024,
        }
    }
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            mode: default_approval_mode(),
            window_secs: default_approval_window(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            backend: default_memory_backend(),
            retrieval_k: default_retrieval_k(),
        }
    }
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            backend: default_trace_backend(),
            dir: default_trace_dir(),
        }
    }
}

impl Config {
    /// Load configuration from the default location (~/.cairn/config.toml)
    ///
    /// If the configuration file doesn't exist, creates a default configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Configuration file cannot be read
    /// - TOML parsing fails
    /// - Validation fails (invalid paths, zero budgets, unknown provider)
    pub fn load_or_create() -> Result<Self, EngineError> {
        let config_path = Self::default_config_path()?;

        if config_path.exists() {
            Self::load_from_path(&config_path)
        } else {
            Self::create_default(&config_path)
        }
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &Path) -> Result<Self, EngineError> {
        let contents = fs::read_to_string(path)
            .map_err(|e| EngineError::Config(format!("Failed to read config file: {}", e)))?;

        let mut config: Config = toml::from_str(&contents)
            .map_err(|e| EngineError::Config(format!("Failed to parse config: {}", e)))?;

        config.validate_and_process()?;

        Ok(config)
    }

    /// Create default configuration and save to path
    fn create_default(path: &Path) -> Result<Self, EngineError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                EngineError::Config(format!("Failed to create config directory: {}", e))
            })?;
        }

        let mut config = Self::default_config();
        config.validate_and_process()?;

        let toml_string = toml::to_string_pretty(&config)
            .map_err(|e| EngineError::Config(format!("Failed to serialize config: {}", e)))?;

        fs::write(path, toml_string)
            .map_err(|e| EngineError::Config(format!("Failed to write config file: {}", e)))?;

        Ok(config)
    }

    /// Get the default configuration file path (~/.cairn/config.toml)
    fn default_config_path() -> Result<PathBuf, EngineError> {
        let home = dirs::home_dir()
            .ok_or_else(|| EngineError::Config("Could not determine home directory".to_string()))?;

        Ok(home.join(".cairn").join("config.toml"))
    }

    /// Create a default configuration
    pub fn default_config() -> Self {
        Self {
            core: CoreConfig {
                workspace: PathBuf::from("~/cairn-workspace"),
                log_level: default_log_level(),
                log_format: default_log_format(),
                data_dir: default_data_dir(),
            },
            llm: LLMConfig::default(),
            agent: AgentConfig::default(),
            planner: PlannerConfig::default(),
            skills: SkillsConfig::default(),
            sandbox: SandboxConfig::default(),
            approval: ApprovalConfig::default(),
            memory: MemoryConfig::default(),
            trace: TraceConfig::default(),
        }
    }

    /// Path of the SQLite database inside the data directory
    pub fn database_path(&self) -> PathBuf {
        self.core.data_dir.join("cairn.db")
    }

    /// Validate and process configuration
    ///
    /// This method:
    /// - Validates log level, provider and budgets
    /// - Expands ~ in paths
    /// - Canonicalizes the workspace, creating it if needed
    /// - Creates the data and trace directories
    pub fn validate_and_process(&mut self) -> Result<(), EngineError> {
        let valid_log_levels = ["error", "warn", "info", "debug", "trace"];
        if !valid_log_levels.contains(&self.core.log_level.as_str()) {
            return Err(EngineError::Config(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.core.log_level,
                valid_log_levels.join(", ")
            )));
        }

        let valid_providers = ["ollama", "openai", "scripted"];
        if !valid_providers.contains(&self.llm.provider.as_str()) {
            return Err(EngineError::Config(format!(
                "Invalid provider '{}'. Must be one of: {}",
                self.llm.provider,
                valid_providers.join(", ")
            )));
        }

        if self.llm.max_attempts == 0 {
            return Err(EngineError::Config(
                "llm.max_attempts must be at least 1".to_string(),
            ));
        }

        if self.agent.max_iterations == 0 {
            return Err(EngineError::Config(
                "agent.max_iterations must be at least 1".to_string(),
            ));
        }

        if self.agent.max_concurrency == 0 {
            return Err(EngineError::Config(
                "agent.max_concurrency must be at least 1".to_string(),
            ));
        }

        if self.agent.max_duration_secs == 0 {
            return Err(EngineError::Config(
                "agent.max_duration_secs must be at least 1".to_string(),
            ));
        }

        if self.sandbox.max_output_bytes == 0 {
            return Err(EngineError::Config(
                "sandbox.max_output_bytes must be positive".to_string(),
            ));
        }

        // Expand and validate workspace path
        self.core.workspace = expand_path(&self.core.workspace)?;
        self.core.workspace = canonicalize_or_create(&self.core.workspace)?;

        if !self.core.workspace.is_dir() {
            return Err(EngineError::Config(format!(
                "Workspace path is not a directory: {:?}",
                self.core.workspace
            )));
        }

        self.core.data_dir = expand_path(&self.core.data_dir)?;
        if !self.core.data_dir.exists() {
            fs::create_dir_all(&self.core.data_dir).map_err(|e| {
                EngineError::Config(format!("Failed to create data directory: {}", e))
            })?;
        }

        self.trace.dir = expand_path(&self.trace.dir)?;
        if self.trace.backend == TraceBackend::Jsonl && !self.trace.dir.exists() {
            fs::create_dir_all(&self.trace.dir).map_err(|e| {
                EngineError::Config(format!("Failed to create trace directory: {}", e))
            })?;
        }

        Ok(())
    }
}

/// Expand ~ in path to user's home directory
fn expand_path(path: &Path) -> Result<PathBuf, EngineError> {
    let path_str = path
        .to_str()
        .ok_or_else(|| EngineError::Config("Invalid UTF-8 in path".to_string()))?;

    if let Some(rest) = path_str.strip_prefix("~/") {
        let home = dirs::home_dir()
            .ok_or_else(|| EngineError::Config("Could not determine home directory".to_string()))?;

        Ok(home.join(rest))
    } else if path_str == "~" {
        dirs::home_dir()
            .ok_or_else(|| EngineError::Config("Could not determine home directory".to_string()))
    } else {
        Ok(path.to_path_buf())
    }
}

/// Canonicalize path, creating it if it doesn't exist
fn canonicalize_or_create(path: &Path) -> Result<PathBuf, EngineError> {
    if !path.exists() {
        fs::create_dir_all(path).map_err(|e| {
            EngineError::Config(format!("Failed to create directory {:?}: {}", path, e))
        })?;
    }

    path.canonicalize()
        .map_err(|e| EngineError::PathCanonicalization(path.to_path_buf(), e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config_creation() {
        let config = Config::default_config();

        assert_eq!(config.core.log_level, "info");
        assert_eq!(config.llm.provider, "ollama");
        assert_eq!(config.agent.max_concurrency, 4);
        assert_eq!(config.planner.mode, PlannerMode::Flat);
        assert_eq!(config.approval.mode, ApprovalMode::Interactive);
        assert!(config.skills.allowed.is_empty());
    }

    #[test]
    fn test_expand_path_with_tilde() {
        let path = PathBuf::from("~/test");
        let expanded = expand_path(&path).unwrap();

        let home = dirs::home_dir().unwrap();
        assert_eq!(expanded, home.join("test"));
    }

    #[test]
    fn test_expand_path_without_tilde() {
        let path = PathBuf::from("/absolute/path");
        let expanded = expand_path(&path).unwrap();

        assert_eq!(expanded, path);
    }

    #[test]
    fn test_minimal_toml_uses_section_defaults() {
        let temp = TempDir::new().unwrap();
        let toml_str = format!(
            "[core]\nworkspace = {:?}\ndata_dir = {:?}\n\n[trace]\ndir = {:?}\n",
            temp.path().join("ws"),
            temp.path().join("data"),
            temp.path().join("traces"),
        );
        let mut config: Config = toml::from_str(&toml_str).unwrap();
        config.validate_and_process().unwrap();

        assert!(config.core.workspace.is_dir());
        assert!(config.trace.dir.is_dir());
        assert_eq!(config.agent.max_steps, 25);
        assert_eq!(config.sandbox.limits().memory_bytes, 512 * 1024 * 1024);
        assert_eq!(config.database_path(), config.core.data_dir.join("cairn.db"));
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let temp = TempDir::new().unwrap();
        let mut config = Config::default_config();
        config.core.workspace = temp.path().to_path_buf();
        config.core.data_dir = temp.path().join("data");
        config.trace.dir = temp.path().join("traces");
        config.agent.max_concurrency = 0;

        let err = config.validate_and_process().unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
    }

    #[test]
    fn test_config_serialization() {
        let config = Config::default_config();
        let toml_string = toml::to_string(&config).unwrap();

        let deserialized: Config = toml::from_str(&toml_string).unwrap();
        assert_eq!(config.core.log_level, deserialized.core.log_level);
        assert_eq!(config.planner.mode, deserialized.planner.mode);
        assert_eq!(config.trace.backend, deserialized.trace.backend);
    }
}
