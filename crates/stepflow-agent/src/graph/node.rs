use serde::{Deserialize, Serialize};

use stepflow_core::{AgentRole, NodeStatus, StepFailure};

/// A node as declared by a graph fragment.
///
/// Agents resend nodes freely, so a spec carries only the definition; status
/// and retry bookkeeping live on the stored [`PlanNode`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSpec {
    pub id: String,
    #[serde(alias = "agent")]
    pub role: AgentRole,
    /// Instruction passed to the agent.
    #[serde(default)]
    pub description: String,
    /// Variables this step consumes.
    #[serde(default, alias = "reads")]
    pub input_bindings: Vec<String>,
    /// Base names of the variables this step must produce.
    #[serde(default, alias = "writes")]
    pub output_names: Vec<String>,
    /// Retry budget; the graph default applies when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
}

impl NodeSpec {
    pub fn new(id: impl Into<String>, role: AgentRole) -> Self {
        Self {
            id: id.into(),
            role,
            description: String::new(),
            input_bindings: vec![],
            output_names: vec![],
            max_retries: None,
        }
    }

    /// Set the agent instruction.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Set the input bindings.
    pub fn with_inputs(mut self, bindings: &[&str]) -> Self {
        self.input_bindings = bindings.iter().map(|s| s.to_string()).collect();
        self
    }

    /// Set the declared output names.
    pub fn with_outputs(mut self, names: &[&str]) -> Self {
        self.output_names = names.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }
}

/// A step in the plan graph with its execution bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanNode {
    pub id: String,
    pub role: AgentRole,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub input_bindings: Vec<String>,
    #[serde(default)]
    pub output_names: Vec<String>,
    #[serde(default)]
    pub status: NodeStatus,
    #[serde(default)]
    pub retry_count: u32,
    pub max_retries: u32,
    /// Most recent failure, kept after the node reaches a terminal state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<StepFailure>,
}

impl PlanNode {
    pub(crate) fn from_spec(spec: NodeSpec, default_max_retries: u32) -> Self {
        Self {
            id: spec.id,
            role: spec.role,
            description: spec.description,
            input_bindings: spec.input_bindings,
            output_names: spec.output_names,
            status: NodeStatus::Pending,
            retry_count: 0,
            max_retries: spec.max_retries.unwrap_or(default_max_retries),
            last_error: None,
        }
    }

    /// Whether `spec` declares the same step. Descriptions are free text that
    /// agents rephrase between turns, so they don't count.
    pub fn matches_spec(&self, spec: &NodeSpec) -> bool {
        self.role == spec.role
            && self.input_bindings == spec.input_bindings
            && self.output_names == spec.output_names
            && spec.max_retries.map_or(true, |m| m == self.max_retries)
    }

    pub(crate) fn redefine(&mut self, spec: NodeSpec) {
        self.role = spec.role;
        self.description = spec.description;
        self.input_bindings = spec.input_bindings;
        self.output_names = spec.output_names;
        if let Some(m) = spec.max_retries {
            self.max_retries = m;
        }
    }

    /// Whether another retry is within budget.
    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }
}
