use std::collections::{BTreeSet, HashMap, VecDeque};

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};
use tracing::debug;

use stepflow_core::{NodeStatus, Result, StepflowError};

use super::edge::{EdgeCondition, EdgeState, PlanEdge, ROOT};
use super::node::{NodeSpec, PlanNode};

const DEFAULT_MAX_RETRIES: u32 = 3;

/// Nodes and edges contributed by one agent reply.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphFragment {
    #[serde(default)]
    pub nodes: Vec<NodeSpec>,
    #[serde(default, alias = "links")]
    pub edges: Vec<PlanEdge>,
    /// Node whose completion ends the session.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_step: Option<String>,
}

impl GraphFragment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_node(mut self, node: NodeSpec) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn with_edge(mut self, edge: PlanEdge) -> Self {
        self.edges.push(edge);
        self
    }

    pub fn with_final_step(mut self, id: impl Into<String>) -> Self {
        self.final_step = Some(id.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty() && self.edges.is_empty() && self.final_step.is_none()
    }
}

/// What a successful merge changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeReport {
    pub added: Vec<String>,
    pub redefined: Vec<String>,
    pub edges_added: usize,
}

impl MergeReport {
    pub fn is_noop(&self) -> bool {
        self.added.is_empty() && self.redefined.is_empty() && self.edges_added == 0
    }
}

/// Result of a readiness scan. Both lists are in ascending id order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadySet {
    /// Pending nodes whose every dependency is satisfied.
    pub ready: Vec<String>,
    /// Pending nodes with a dependency that can no longer be satisfied.
    pub doomed: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct EdgeRef {
    from: usize,
    to: usize,
    condition: EdgeCondition,
}

/// The session's DAG of steps.
///
/// Nodes live in an arena indexed by insertion order; edges are index pairs.
/// Every mutation that adds structure goes through [`PlanGraph::merge`],
/// which works on a staged copy and only swaps it in once the result is
/// known to be acyclic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(into = "GraphRecord", try_from = "GraphRecord")]
pub struct PlanGraph {
    nodes: Vec<PlanNode>,
    index: HashMap<String, usize>,
    edges: Vec<EdgeRef>,
    final_step: Option<String>,
    default_max_retries: u32,
}

impl Default for PlanGraph {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RETRIES)
    }
}

impl PlanGraph {
    /// Empty graph; nodes that don't declare a retry budget get `default_max_retries`.
    pub fn new(default_max_retries: u32) -> Self {
        Self {
            nodes: Vec::new(),
            index: HashMap::new(),
            edges: Vec::new(),
            final_step: None,
            default_max_retries,
        }
    }

    /// Merge nodes and edges. All or nothing.
    pub fn add_fragment(&mut self, nodes: Vec<NodeSpec>, edges: Vec<PlanEdge>) -> Result<MergeReport> {
        self.merge(GraphFragment {
            nodes,
            edges,
            final_step: None,
        })
    }

    /// Merge a whole fragment, including its final-step designation.
    ///
    /// Fails with `Schema` on malformed or conflicting declarations and with
    /// `Cycle` if the merged graph would not be a DAG. On error the graph is
    /// untouched.
    pub fn merge(&mut self, fragment: GraphFragment) -> Result<MergeReport> {
        let mut staged = self.clone();
        let report = staged.stage(fragment)?;
        staged.topo_indices()?;
        *self = staged;
        if !report.is_noop() {
            debug!(
                added = report.added.len(),
                redefined = report.redefined.len(),
                edges = report.edges_added,
                "Merged graph fragment"
            );
        }
        Ok(report)
    }

    fn stage(&mut self, fragment: GraphFragment) -> Result<MergeReport> {
        let mut report = MergeReport::default();

        for spec in fragment.nodes {
            if spec.id.trim().is_empty() {
                return Err(StepflowError::Schema("node id must not be empty".into()));
            }
            if spec.id == ROOT {
                return Err(StepflowError::Schema(format!("'{}' is a reserved node id", ROOT)));
            }
            match self.index.get(&spec.id).copied() {
                Some(idx) => {
                    let node = &mut self.nodes[idx];
                    if node.matches_spec(&spec) {
                        continue;
                    }
                    if node.status != NodeStatus::Pending {
                        return Err(StepflowError::Schema(format!(
                            "node '{}' is {} and cannot be redefined",
                            node.id, node.status
                        )));
                    }
                    report.redefined.push(spec.id.clone());
                    node.redefine(spec);
                }
                None => {
                    let id = spec.id.clone();
                    self.index.insert(id.clone(), self.nodes.len());
                    self.nodes
                        .push(PlanNode::from_spec(spec, self.default_max_retries));
                    report.added.push(id);
                }
            }
        }

        for edge in fragment.edges {
            if edge.from == ROOT {
                continue;
            }
            if edge.to == ROOT {
                return Err(StepflowError::Schema(format!(
                    "edge {} -> {}: nothing may precede the entry point",
                    edge.from, ROOT
                )));
            }
            let from = self.require_index(&edge.from, &edge)?;
            let to = self.require_index(&edge.to, &edge)?;
            if from == to {
                return Err(StepflowError::Cycle { node: edge.from });
            }
            if let Some(existing) = self.edges.iter().find(|e| e.from == from && e.to == to) {
                if existing.condition != edge.condition {
                    return Err(StepflowError::Schema(format!(
                        "edge {} -> {} redeclared with a different condition",
                        edge.from, edge.to
                    )));
                }
                continue;
            }
            let target = &self.nodes[to];
            if target.status != NodeStatus::Pending {
                return Err(StepflowError::Schema(format!(
                    "cannot add dependency {} -> {}: '{}' is already {}",
                    edge.from, edge.to, target.id, target.status
                )));
            }
            self.edges.push(EdgeRef {
                from,
                to,
                condition: edge.condition,
            });
            report.edges_added += 1;
        }

        if let Some(final_step) = fragment.final_step {
            self.designate_final(final_step)?;
        }

        Ok(report)
    }

    fn require_index(&self, id: &str, edge: &PlanEdge) -> Result<usize> {
        self.index.get(id).copied().ok_or_else(|| {
            StepflowError::Schema(format!(
                "edge {} -> {} references unknown node '{}'",
                edge.from, edge.to, id
            ))
        })
    }

    fn designate_final(&mut self, id: String) -> Result<()> {
        if !self.index.contains_key(&id) {
            return Err(StepflowError::Schema(format!(
                "final step '{}' is not a node of the plan",
                id
            )));
        }
        match &self.final_step {
            Some(current) if *current != id => Err(StepflowError::Schema(format!(
                "final step is already '{}', cannot change it to '{}'",
                current, id
            ))),
            _ => {
                self.final_step = Some(id);
                Ok(())
            }
        }
    }

    fn topo_indices(&self) -> Result<Vec<usize>> {
        let mut g: DiGraph<(), ()> = DiGraph::with_capacity(self.nodes.len(), self.edges.len());
        for _ in &self.nodes {
            g.add_node(());
        }
        for e in &self.edges {
            g.add_edge(NodeIndex::new(e.from), NodeIndex::new(e.to), ());
        }
        toposort(&g, None)
            .map(|order| order.into_iter().map(|n| n.index()).collect())
            .map_err(|cycle| StepflowError::Cycle {
                node: self.nodes[cycle.node_id().index()].id.clone(),
            })
    }

    /// Scan pending nodes against the given terminal sets.
    ///
    /// A source counts as completed or failed only through the sets; a node
    /// already marked skipped in the graph counts as skipped. Anything else
    /// is still undecided.
    pub fn ready_set(&self, completed: &BTreeSet<String>, failed: &BTreeSet<String>) -> ReadySet {
        let source_status = |idx: usize| -> NodeStatus {
            let node = &self.nodes[idx];
            if completed.contains(&node.id) {
                NodeStatus::Completed
            } else if failed.contains(&node.id) {
                NodeStatus::Failed
            } else if node.status == NodeStatus::Skipped {
                NodeStatus::Skipped
            } else {
                NodeStatus::Pending
            }
        };

        let mut incoming: Vec<Vec<&EdgeRef>> = vec![Vec::new(); self.nodes.len()];
        for e in &self.edges {
            incoming[e.to].push(e);
        }

        let mut ready = Vec::new();
        let mut doomed = Vec::new();
        for (idx, node) in self.nodes.iter().enumerate() {
            if node.status != NodeStatus::Pending {
                continue;
            }
            let mut state = EdgeState::Satisfied;
            for e in &incoming[idx] {
                match e.condition.evaluate(source_status(e.from)) {
                    EdgeState::Broken => {
                        state = EdgeState::Broken;
                        break;
                    }
                    EdgeState::Waiting => state = EdgeState::Waiting,
                    EdgeState::Satisfied => {}
                }
            }
            match state {
                EdgeState::Satisfied => ready.push(node.id.clone()),
                EdgeState::Broken => doomed.push(node.id.clone()),
                EdgeState::Waiting => {}
            }
        }
        ready.sort();
        doomed.sort();
        ReadySet { ready, doomed }
    }

    pub(crate) fn transition(&mut self, id: &str, to: NodeStatus) -> Result<()> {
        use NodeStatus::*;
        let node = self.node_mut(id)?;
        let allowed = matches!(
            (node.status, to),
            (Pending, Running)
                | (Running, Completed)
                | (Running, Failed)
                | (Failed, Pending)
                | (Pending, Skipped)
        );
        if !allowed {
            return Err(StepflowError::InvalidTransition {
                step: id.to_string(),
                message: format!("{} -> {}", node.status, to),
            });
        }
        node.status = to;
        Ok(())
    }

    pub(crate) fn node_mut(&mut self, id: &str) -> Result<&mut PlanNode> {
        match self.index.get(id) {
            Some(&idx) => Ok(&mut self.nodes[idx]),
            None => Err(StepflowError::Schema(format!("unknown step '{}'", id))),
        }
    }

    /// Put nodes interrupted mid-run back to pending. Returns their ids.
    pub(crate) fn reset_running(&mut self) -> Vec<String> {
        let mut reset = Vec::new();
        for node in &mut self.nodes {
            if node.status == NodeStatus::Running {
                node.status = NodeStatus::Pending;
                reset.push(node.id.clone());
            }
        }
        reset.sort();
        reset
    }

    pub fn get(&self, id: &str) -> Option<&PlanNode> {
        self.index.get(id).map(|&idx| &self.nodes[idx])
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// All nodes, ascending id.
    pub fn nodes(&self) -> Vec<&PlanNode> {
        let mut nodes: Vec<&PlanNode> = self.nodes.iter().collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        nodes
    }

    pub fn edges(&self) -> Vec<PlanEdge> {
        self.edges
            .iter()
            .map(|e| PlanEdge {
                from: self.nodes[e.from].id.clone(),
                to: self.nodes[e.to].id.clone(),
                condition: e.condition,
            })
            .collect()
    }

    pub fn final_step(&self) -> Option<&str> {
        self.final_step.as_deref()
    }

    pub fn default_max_retries(&self) -> u32 {
        self.default_max_retries
    }

    /// Direct dependencies of `id` with the condition on each edge.
    pub fn dependencies(&self, id: &str) -> Vec<(&str, EdgeCondition)> {
        let Some(&idx) = self.index.get(id) else {
            return vec![];
        };
        let mut deps: Vec<_> = self
            .edges
            .iter()
            .filter(|e| e.to == idx)
            .map(|e| (self.nodes[e.from].id.as_str(), e.condition))
            .collect();
        deps.sort();
        deps
    }

    /// Nodes that depend directly on `id`.
    pub fn dependents(&self, id: &str) -> Vec<&str> {
        let Some(&idx) = self.index.get(id) else {
            return vec![];
        };
        let mut deps: Vec<&str> = self
            .edges
            .iter()
            .filter(|e| e.from == idx)
            .map(|e| self.nodes[e.to].id.as_str())
            .collect();
        deps.sort();
        deps
    }

    pub fn ancestors(&self, id: &str) -> BTreeSet<String> {
        self.walk(id, |e| (e.to, e.from))
    }

    pub fn descendants(&self, id: &str) -> BTreeSet<String> {
        self.walk(id, |e| (e.from, e.to))
    }

    fn walk(&self, id: &str, dir: impl Fn(&EdgeRef) -> (usize, usize)) -> BTreeSet<String> {
        let mut seen = BTreeSet::new();
        let Some(&start) = self.index.get(id) else {
            return seen;
        };
        let mut visited = vec![false; self.nodes.len()];
        let mut queue = VecDeque::from([start]);
        while let Some(idx) = queue.pop_front() {
            for e in &self.edges {
                let (here, next) = dir(e);
                if here == idx && !visited[next] {
                    visited[next] = true;
                    seen.insert(self.nodes[next].id.clone());
                    queue.push_back(next);
                }
            }
        }
        seen
    }

    /// Nodes with no dependents, ascending id.
    pub fn sinks(&self) -> Vec<&str> {
        let mut sinks: Vec<&str> = self
            .nodes
            .iter()
            .enumerate()
            .filter(|(idx, _)| !self.edges.iter().any(|e| e.from == *idx))
            .map(|(_, n)| n.id.as_str())
            .collect();
        sinks.sort();
        sinks
    }

    /// Every node is completed, failed or skipped.
    pub fn is_resolved(&self) -> bool {
        self.nodes.iter().all(|n| n.status.is_terminal())
    }

    /// Ids of nodes that are not terminal yet, ascending.
    pub fn unresolved(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .nodes
            .iter()
            .filter(|n| !n.status.is_terminal())
            .map(|n| n.id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn topological_order(&self) -> Result<Vec<String>> {
        Ok(self
            .topo_indices()?
            .into_iter()
            .map(|idx| self.nodes[idx].id.clone())
            .collect())
    }
}

/// Wire form: `{nodes[], edges[]}` with edges by id.
#[derive(Serialize, Deserialize)]
struct GraphRecord {
    #[serde(default)]
    nodes: Vec<PlanNode>,
    #[serde(default, alias = "links")]
    edges: Vec<PlanEdge>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    final_step: Option<String>,
    #[serde(default = "default_max_retries")]
    default_max_retries: u32,
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

impl From<PlanGraph> for GraphRecord {
    fn from(graph: PlanGraph) -> Self {
        let edges = graph.edges();
        Self {
            nodes: graph.nodes,
            edges,
            final_step: graph.final_step,
            default_max_retries: graph.default_max_retries,
        }
    }
}

impl TryFrom<GraphRecord> for PlanGraph {
    type Error = StepflowError;

    fn try_from(record: GraphRecord) -> Result<Self> {
        let mut graph = PlanGraph::new(record.default_max_retries);
        for node in record.nodes {
            if node.id == ROOT || graph.index.contains_key(&node.id) {
                return Err(StepflowError::Schema(format!(
                    "duplicate or reserved node id '{}'",
                    node.id
                )));
            }
            graph.index.insert(node.id.clone(), graph.nodes.len());
            graph.nodes.push(node);
        }
        for edge in record.edges {
            if edge.from == ROOT {
                continue;
            }
            let from = graph.require_index(&edge.from, &edge)?;
            let to = graph.require_index(&edge.to, &edge)?;
            graph.edges.push(EdgeRef {
                from,
                to,
                condition: edge.condition,
            });
        }
        if let Some(final_step) = record.final_step {
            graph.designate_final(final_step)?;
        }
        graph.topo_indices()?;
        Ok(graph)
    }
}
