use serde::{Deserialize, Serialize};

use stepflow_core::NodeStatus;

/// Reserved id of the implicit query entry point. Edges out of it carry no
/// dependency and are dropped on merge.
pub const ROOT: &str = "ROOT";

/// A dependency between two plan nodes: `to` waits on `from`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanEdge {
    /// Source node id.
    #[serde(alias = "source")]
    pub from: String,
    /// Target node id.
    #[serde(alias = "target")]
    pub to: String,
    /// Which outcome of `from` lets `to` run.
    #[serde(default)]
    pub condition: EdgeCondition,
}

/// Outcome of the source node that satisfies an edge.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum EdgeCondition {
    /// Satisfied when the source completes.
    #[default]
    OnSuccess,
    /// Fallback: satisfied when the source ends failed or skipped.
    OnFailure,
}

/// Whether an edge lets its target run, given the source's status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeState {
    Satisfied,
    /// The source is not terminal yet.
    Waiting,
    /// The source ended in a way this edge can never accept.
    Broken,
}

impl EdgeCondition {
    pub fn evaluate(&self, source: NodeStatus) -> EdgeState {
        match (self, source) {
            (_, NodeStatus::Pending | NodeStatus::Running) => EdgeState::Waiting,
            (Self::OnSuccess, NodeStatus::Completed) => EdgeState::Satisfied,
            (Self::OnSuccess, NodeStatus::Failed | NodeStatus::Skipped) => EdgeState::Broken,
            (Self::OnFailure, NodeStatus::Failed | NodeStatus::Skipped) => EdgeState::Satisfied,
            (Self::OnFailure, NodeStatus::Completed) => EdgeState::Broken,
        }
    }
}

impl PlanEdge {
    /// Create an edge that requires `from` to complete.
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            condition: EdgeCondition::OnSuccess,
        }
    }

    /// Create a fallback edge: `to` runs only if `from` does not complete.
    pub fn on_failure(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            condition: EdgeCondition::OnFailure,
        }
    }
}
