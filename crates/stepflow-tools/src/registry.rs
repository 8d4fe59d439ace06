use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;
use tracing::debug;

use stepflow_core::error::{Result, StepflowError};
use stepflow_core::traits::{Tool, ToolInvoker};

/// Registry of tools reachable from generated code.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Register a tool.
    pub fn register(&mut self, tool: impl Tool) {
        let name = tool.name().to_string();
        self.tools.insert(name, Arc::new(tool));
    }

    /// Unregister a tool by name.
    pub fn unregister(&mut self, name: &str) -> bool {
        self.tools.remove(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// Registered tool names, sorted.
    pub fn list(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tools.keys().map(|s| s.as_str()).collect();
        names.sort();
        names
    }

    /// `(name, description)` pairs, sorted by name.
    pub fn descriptions(&self) -> Vec<(String, String)> {
        let mut out: Vec<(String, String)> = self
            .tools
            .values()
            .map(|t| (t.name().to_string(), t.description().to_string()))
            .collect();
        out.sort();
        out
    }

    /// Run a tool by name, bounded by its own timeout.
    pub async fn execute(&self, name: &str, args: Vec<Value>) -> Result<Value> {
        let tool = self
            .get(name)
            .ok_or_else(|| StepflowError::ToolNotFound(name.to_string()))?;

        debug!(tool = name, args = args.len(), "Invoking tool");
        let timeout = std::time::Duration::from_secs(tool.timeout_secs());
        match tokio::time::timeout(timeout, tool.invoke(args)).await {
            Ok(result) => result,
            Err(_) => Err(StepflowError::ToolTimeout {
                tool: name.to_string(),
                timeout_secs: tool.timeout_secs(),
            }),
        }
    }

    /// Registry with the built-in file tools scoped to `workspace`.
    pub fn with_builtins(workspace: &Path) -> Self {
        let mut registry = Self::new();
        registry.register(crate::builtin::ReadTextTool::new(workspace));
        registry.register(crate::builtin::WriteTextTool::new(workspace));
        registry.register(crate::builtin::ListFilesTool::new(workspace));
        registry
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolInvoker for ToolRegistry {
    fn invoke(&self, tool: &str, args: Vec<Value>) -> BoxFuture<'_, Result<Value>> {
        let tool = tool.to_string();
        Box::pin(async move { self.execute(&tool, args).await })
    }

    fn tool_names(&self) -> Vec<String> {
        self.list().into_iter().map(str::to_string).collect()
    }
}
