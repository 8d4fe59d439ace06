use futures::future::BoxFuture;

use crate::error::Result;
use crate::types::*;

/// Reasoning backend: produces the structured reply for one agent role.
pub trait ReasoningBackend: Send + Sync + 'static {
    /// Ask the backend to act as `role` for the given request.
    fn respond(&self, role: AgentRole, request: AgentRequest) -> BoxFuture<'_, Result<AgentReply>>;
}

/// Uniform tool boundary: `invoke(tool_name, positional_args) -> result`.
pub trait ToolInvoker: Send + Sync + 'static {
    fn invoke(
        &self,
        tool: &str,
        args: Vec<serde_json::Value>,
    ) -> BoxFuture<'_, Result<serde_json::Value>>;

    /// Names of the tools this invoker can reach.
    fn tool_names(&self) -> Vec<String>;
}

/// A single tool reachable through a `ToolInvoker`.
pub trait Tool: Send + Sync + 'static {
    /// Tool name (used by generated code).
    fn name(&self) -> &str;

    /// Human-readable description.
    fn description(&self) -> &str;

    /// Execute the tool with positional arguments.
    fn invoke(&self, args: Vec<serde_json::Value>) -> BoxFuture<'_, Result<serde_json::Value>>;

    /// Timeout in seconds for this tool.
    fn timeout_secs(&self) -> u64 {
        30
    }
}

/// Code-execution sandbox: runs one variant and reports what it returned.
///
/// A variant that raises must surface as `StepflowError::Sandbox`.
pub trait Sandbox: Send + Sync + 'static {
    fn execute(&self, request: SandboxRequest) -> BoxFuture<'_, Result<SandboxOutcome>>;
}

/// Archival storage for finished (or interrupted) sessions.
pub trait SessionArchive: Send + Sync + 'static {
    fn save(&self, session: &ArchivedSession) -> Result<()>;

    fn load(&self, session_id: &str) -> Result<Option<ArchivedSession>>;

    /// Most recently updated first.
    fn list(&self, limit: usize) -> Result<Vec<ArchivedSession>>;

    fn delete(&self, session_id: &str) -> Result<bool>;
}
