//! Cairn SDK
//!
//! Shared library providing the skill trait, contract types, and the error
//! taxonomy for Cairn components. This crate is used by the engine and by
//! out-of-tree skill implementations.

/// Skill trait and invocation context
pub mod skill;

/// Error types and handling
pub mod errors;

/// Skill contract types
pub mod types;

// Re-export commonly used types
pub use errors::{CairnErrorExt, EngineError, ErrorKind};
pub use skill::{Skill, SkillContext};
pub use types::{ResourceLimits, SideEffectClass, SkillContract};
