//! Plan graph: the DAG of steps a session executes.
//!
//! Agents contribute `GraphFragment`s as they work; the graph merges them
//! atomically and answers readiness queries for the flow controller.

pub mod edge;
pub mod node;
pub mod plan;

pub use edge::{EdgeCondition, EdgeState, PlanEdge, ROOT};
pub use node::{NodeSpec, PlanNode};
pub use plan::{GraphFragment, MergeReport, PlanGraph, ReadySet};
