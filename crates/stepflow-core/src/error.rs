use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StepflowError {
    // Graph / response shape errors
    #[error("Schema error: {0}")]
    Schema(String),

    #[error("Response validation failed: {0}")]
    Validation(String),

    #[error("Merge would introduce a cycle through node '{node}'")]
    Cycle { node: String },

    #[error("Step {step} is missing input '{binding}'")]
    MissingInput { step: String, binding: String },

    // Collaborator errors
    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Tool execution failed: {tool}: {message}")]
    Tool { tool: String, message: String },

    #[error("Tool timeout after {timeout_secs}s: {tool}")]
    ToolTimeout { tool: String, timeout_secs: u64 },

    #[error("Sandbox error ({variant}): {message}")]
    Sandbox { variant: String, message: String },

    #[error("Reasoning backend failed: {0}")]
    Backend(String),

    // Step / session outcomes
    #[error("Step {step} exhausted {attempts} attempt(s): {last_error}")]
    RetryExhausted {
        step: String,
        attempts: u32,
        last_error: String,
    },

    #[error("Deadlock: no runnable step while {} step(s) unresolved: {}", pending.len(), pending.join(", "))]
    Deadlock { pending: Vec<String> },

    #[error("Session timed out: {0}")]
    Timeout(String),

    #[error("Invalid state transition for step {step}: {message}")]
    InvalidTransition { step: String, message: String },

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Storage errors
    #[error("Archive error: {0}")]
    Archive(String),

    #[error("Internal error: {0}")]
    Internal(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Serializable classification of a failure, kept on failed steps and
/// carried by observer events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Schema,
    Validation,
    Cycle,
    MissingInput,
    Tool,
    Sandbox,
    Backend,
    RetryExhausted,
    Deadlock,
    Timeout,
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Schema => "SchemaError",
            Self::Validation => "ValidationError",
            Self::Cycle => "CycleError",
            Self::MissingInput => "MissingInputError",
            Self::Tool => "ToolError",
            Self::Sandbox => "SandboxError",
            Self::Backend => "BackendError",
            Self::RetryExhausted => "RetryExhaustedError",
            Self::Deadlock => "DeadlockError",
            Self::Timeout => "TimeoutError",
            Self::Internal => "InternalError",
        };
        f.write_str(s)
    }
}

impl ErrorKind {
    /// Kinds the retry loop absorbs (tool, sandbox, backend hiccups).
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Tool | Self::Sandbox | Self::Backend)
    }
}

impl StepflowError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Schema(_) => ErrorKind::Schema,
            Self::Validation(_) => ErrorKind::Validation,
            Self::Cycle { .. } => ErrorKind::Cycle,
            Self::MissingInput { .. } => ErrorKind::MissingInput,
            Self::ToolNotFound(_) | Self::Tool { .. } | Self::ToolTimeout { .. } => ErrorKind::Tool,
            Self::Sandbox { .. } => ErrorKind::Sandbox,
            Self::Backend(_) => ErrorKind::Backend,
            Self::RetryExhausted { .. } => ErrorKind::RetryExhausted,
            Self::Deadlock { .. } => ErrorKind::Deadlock,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::InvalidTransition { .. }
            | Self::Config(_)
            | Self::ConfigNotFound(_)
            | Self::Archive(_)
            | Self::Internal(_)
            | Self::Io(_)
            | Self::Json(_) => ErrorKind::Internal,
        }
    }

    /// Step-local transient failures that the retry loop may absorb.
    /// An unknown tool name won't appear on a second attempt.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::ToolNotFound(_)) && self.kind().is_transient()
    }

    pub fn tool(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Tool {
            tool: tool.into(),
            message: message.into(),
        }
    }

    pub fn sandbox(variant: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Sandbox {
            variant: variant.into(),
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, StepflowError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(StepflowError::Schema("x".into()).kind(), ErrorKind::Schema);
        assert_eq!(
            StepflowError::Cycle { node: "a".into() }.kind(),
            ErrorKind::Cycle
        );
        assert_eq!(
            StepflowError::ToolTimeout {
                tool: "search".into(),
                timeout_secs: 5
            }
            .kind(),
            ErrorKind::Tool
        );
        assert_eq!(
            StepflowError::Timeout("deadline".into()).kind(),
            ErrorKind::Timeout
        );
    }

    #[test]
    fn test_retryable() {
        assert!(StepflowError::tool("search", "503").is_retryable());
        assert!(StepflowError::sandbox("CODE_1A", "NameError").is_retryable());
        assert!(StepflowError::Backend("connection reset".into()).is_retryable());
        assert!(!StepflowError::Validation("missing outputs".into()).is_retryable());
        assert!(!StepflowError::ToolNotFound("serach".into()).is_retryable());
        assert!(!StepflowError::RetryExhausted {
            step: "T1".into(),
            attempts: 3,
            last_error: "boom".into()
        }
        .is_retryable());
    }

    #[test]
    fn test_kind_display_uses_taxonomy_names() {
        assert_eq!(ErrorKind::Timeout.to_string(), "TimeoutError");
        assert_eq!(ErrorKind::RetryExhausted.to_string(), "RetryExhaustedError");
    }

    #[test]
    fn test_deadlock_message_lists_pending() {
        let err = StepflowError::Deadlock {
            pending: vec!["T2".into(), "T3".into()],
        };
        let msg = err.to_string();
        assert!(msg.contains("2 step(s)"));
        assert!(msg.contains("T2, T3"));
    }
}
