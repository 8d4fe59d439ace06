use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use stepflow_core::{StepFailure, Usage, Variant};

use crate::graph::GraphFragment;

/// Everything a successful step run produced, ready to be committed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepResult {
    pub step_id: String,
    /// Full variable names (`<name>_<step><variant>`) to values.
    pub outputs: BTreeMap<String, Value>,
    /// Accepted code variant, for code-producing roles.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<Variant>,
    /// One message per variant that was tried and rejected, in order.
    #[serde(default)]
    pub variant_errors: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fragment: Option<GraphFragment>,
    /// Advisory hint from the agent; scheduling never depends on it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_step_id: Option<String>,
    #[serde(default)]
    pub created_files: Vec<PathBuf>,
    /// Direct file writes that failed (`name: reason`).
    #[serde(default)]
    pub file_errors: Vec<String>,
    #[serde(default)]
    pub tool_calls: Vec<String>,
    #[serde(default)]
    pub usage: Usage,
    #[serde(default)]
    pub elapsed_ms: u64,
}

impl StepResult {
    pub fn new(step_id: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            ..Default::default()
        }
    }

    pub fn with_output(mut self, key: impl Into<String>, value: Value) -> Self {
        self.outputs.insert(key.into(), value);
        self
    }

    pub fn with_fragment(mut self, fragment: GraphFragment) -> Self {
        self.fragment = Some(fragment);
        self
    }

    /// Number of variants that failed before one was accepted.
    pub fn failed_variants(&self) -> u32 {
        self.variant_errors.len() as u32
    }
}

/// What the controller commits for a step that was running.
#[derive(Debug, Clone)]
pub enum StepOutcome {
    Succeeded(StepResult),
    Failed(StepFailure),
}
