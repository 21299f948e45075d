//! Application error types.
//!
//! All errors use `thiserror` for automatic Error trait derivation and provide
//! clear error messages with context.

use thiserror::Error;

use super::ids::ToolId;

/// Application result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error enum for the warden scheduler.
#[derive(Error, Debug)]
pub enum Error {
    /// Tool id not present in the registry.
    #[error("unknown tool: {0}")]
    UnknownTool(ToolId),

    /// Tool id registered twice.
    #[error("duplicate tool: {0}")]
    DuplicateTool(ToolId),

    /// Registration would close a dependency cycle. Carries the offending path.
    #[error("cyclic dependency: {}", format_cycle(.0))]
    CyclicDependency(Vec<ToolId>),

    /// Validation errors (bad priority, malformed references, bad thresholds).
    #[error("validation error: {0}")]
    Validation(String),

    /// Workload profile name not defined.
    #[error("unknown profile: {0}")]
    UnknownProfile(String),

    /// A dependency is not running (soft; retried automatically).
    #[error("dependency unavailable: {tool} needs {dependency}")]
    DependencyUnavailable { tool: ToolId, dependency: ToolId },

    /// Tool exists but is not Running.
    #[error("tool not running: {tool} is {state}")]
    NotRunning { tool: ToolId, state: String },

    /// A lifecycle command exceeded its deadline.
    #[error("command timeout: {command} on {tool} after {elapsed_ms}ms")]
    CommandTimeout {
        tool: ToolId,
        command: String,
        elapsed_ms: u64,
    },

    /// A lifecycle command reported failure.
    #[error("command failed: {0}")]
    CommandFailed(String),

    /// Invalid state transition.
    #[error("state transition error: {0}")]
    StateTransition(String),

    /// Operation not supported by a tool implementation or platform.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Internal errors.
    #[error("internal error: {0}")]
    Internal(String),

    /// Serialization/deserialization errors.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

fn format_cycle(path: &[ToolId]) -> String {
    path.iter()
        .map(ToolId::as_str)
        .collect::<Vec<_>>()
        .join(" -> ")
}

impl Error {
    /// Registration-time configuration errors: fatal to one registration only.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Error::DuplicateTool(_)
                | Error::CyclicDependency(_)
                | Error::Validation(_)
                | Error::UnknownProfile(_)
        )
    }
}

// Convenience constructors
impl Error {
    pub fn unknown_tool(id: &ToolId) -> Self {
        Self::UnknownTool(id.clone())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn unknown_profile(name: impl Into<String>) -> Self {
        Self::UnknownProfile(name.into())
    }

    pub fn command_failed(msg: impl Into<String>) -> Self {
        Self::CommandFailed(msg.into())
    }

    pub fn state_transition(msg: impl Into<String>) -> Self {
        Self::StateTransition(msg.into())
    }

    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::Unsupported(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}
