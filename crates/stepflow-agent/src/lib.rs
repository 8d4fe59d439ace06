pub mod archive;
pub mod backend;
pub mod context;
pub mod controller;
pub mod graph;
pub mod run_log;
pub mod runner;
pub mod step;
pub mod validator;
pub mod variables;
pub mod variants;

pub use archive::SqliteArchive;
pub use backend::{ReplayBackend, RetryingBackend};
pub use context::{CommitReport, ExecutionContext, SessionRecord};
pub use controller::{FlowController, SessionOutcome};
pub use graph::{
    EdgeCondition, EdgeState, GraphFragment, MergeReport, NodeSpec, PlanEdge, PlanGraph, PlanNode,
    ReadySet, ROOT,
};
pub use run_log::RunLogger;
pub use runner::{AgentRunner, PlannedGraph, StepTask};
pub use step::{StepOutcome, StepResult};
pub use variables::VariableStore;
pub use variants::{select_variant, VariantSelection};
