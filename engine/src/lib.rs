//! Cairn Engine Library
//!
//! Core of the Cairn agent: the plan → act → reflect loop and its
//! collaborators. Used by the `cairn` binary and the integration tests.

/// Configuration management module
pub mod config;

/// File system security module
pub mod fs_guard;

/// Database persistence module
pub mod db;

/// Completion provider abstraction layer
pub mod llm;

/// Long-term and short-term memory
pub mod memory;

/// Skill registry and built-in skills
pub mod skills;

/// Sandboxed skill invocation
pub mod sandbox;

/// Planning, execution, approval and reflection
pub mod conductor;

/// Append-only run traces and replay
pub mod trace;

/// Telemetry and Observability
pub mod telemetry;

/// CLI interface module
pub mod cli;

/// Command handlers module
pub mod handlers;
