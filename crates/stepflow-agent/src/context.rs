use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use stepflow_core::{
    ErrorKind, GlobalEntry, NodeStatus, PlanningStrategy, Result, SessionId, SessionStatus,
    StepFailure, StepflowError, Usage, Variable, VariableMetadata, Variant,
};

use crate::graph::{GraphFragment, MergeReport, PlanGraph, ROOT};
use crate::step::{StepOutcome, StepResult};
use crate::validator;
use crate::variables::{Provenance, VariableStore};

const RECORD_VERSION: u32 = 1;

/// What a successful `apply_result` changed.
#[derive(Debug, Clone, Default)]
pub struct CommitReport {
    pub step_id: String,
    pub status: NodeStatus,
    pub variables_written: Vec<String>,
    pub merge: Option<MergeReport>,
    pub revision: u64,
}

/// Authoritative state of one session.
///
/// The flow controller owns the context and is the only writer; every change
/// to the graph or the variable store goes through [`apply_result`], which
/// stages the whole commit and swaps it in only when every part succeeds.
///
/// [`apply_result`]: ExecutionContext::apply_result
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    session_id: SessionId,
    original_query: String,
    perception: Value,
    planning_strategy: PlanningStrategy,
    graph: PlanGraph,
    globals: VariableStore,
    completed_steps: BTreeSet<String>,
    failed_steps: BTreeMap<String, StepFailure>,
    usage: Usage,
    started_at: DateTime<Utc>,
    ended_at: Option<DateTime<Utc>>,
    deadline: Option<DateTime<Utc>>,
    status: SessionStatus,
    commit_seq: u64,
    steps_dispatched: usize,
}

impl ExecutionContext {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            session_id: SessionId::new(),
            original_query: query.into(),
            perception: Value::Null,
            planning_strategy: PlanningStrategy::default(),
            graph: PlanGraph::default(),
            globals: VariableStore::new(),
            completed_steps: BTreeSet::new(),
            failed_steps: BTreeMap::new(),
            usage: Usage::default(),
            started_at: Utc::now(),
            ended_at: None,
            deadline: None,
            status: SessionStatus::Running,
            commit_seq: 0,
            steps_dispatched: 0,
        }
    }

    pub fn with_session_id(mut self, id: SessionId) -> Self {
        self.session_id = id;
        self
    }

    pub fn with_perception(mut self, perception: Value) -> Self {
        self.perception = perception;
        self
    }

    pub fn with_strategy(mut self, strategy: PlanningStrategy) -> Self {
        self.planning_strategy = strategy;
        self
    }

    /// Start from an empty graph with a different default retry budget.
    pub fn with_default_max_retries(mut self, max_retries: u32) -> Self {
        self.graph = PlanGraph::new(max_retries);
        self
    }

    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn set_deadline(&mut self, deadline: Option<DateTime<Utc>>) {
        self.deadline = deadline;
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn original_query(&self) -> &str {
        &self.original_query
    }

    pub fn perception(&self) -> &Value {
        &self.perception
    }

    pub fn planning_strategy(&self) -> PlanningStrategy {
        self.planning_strategy
    }

    pub fn graph(&self) -> &PlanGraph {
        &self.graph
    }

    pub fn globals(&self) -> &VariableStore {
        &self.globals
    }

    pub fn completed_steps(&self) -> &BTreeSet<String> {
        &self.completed_steps
    }

    pub fn failed_steps(&self) -> &BTreeMap<String, StepFailure> {
        &self.failed_steps
    }

    pub fn usage(&self) -> &Usage {
        &self.usage
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.ended_at
    }

    pub fn deadline(&self) -> Option<DateTime<Utc>> {
        self.deadline
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn steps_dispatched(&self) -> usize {
        self.steps_dispatched
    }

    pub fn commit_seq(&self) -> u64 {
        self.commit_seq
    }

    /// Merge a fragment that doesn't come from a step (the initial plan).
    pub fn seed_plan(&mut self, fragment: GraphFragment) -> Result<MergeReport> {
        self.graph.merge(fragment)
    }

    /// Add a variable supplied with the query itself. Seeded variables
    /// originate from `ROOT` and are bindable by every step.
    pub fn seed_variable(&mut self, name: impl Into<String>, value: Value) {
        self.commit_seq += 1;
        let from = Provenance {
            step_id: ROOT,
            variant: None,
            created_files: &[],
            revision: self.commit_seq,
            at: Utc::now(),
        };
        self.globals.write(name.into(), value, &from);
    }

    /// Count planner usage that isn't tied to a step.
    pub fn record_usage(&mut self, usage: &Usage) {
        self.usage.add(usage);
    }

    /// Pending nodes that may run now, ascending id.
    pub fn ready_steps(&self) -> Vec<String> {
        self.graph
            .ready_set(&self.completed_steps, &self.failed_ids())
            .ready
    }

    /// Move a ready node to `running`. Returns the 1-based attempt number.
    ///
    /// Refuses unless every dependency edge is satisfied.
    pub fn mark_running(&mut self, step_id: &str) -> Result<u32> {
        if !self.ready_steps().iter().any(|id| id == step_id) {
            return Err(StepflowError::InvalidTransition {
                step: step_id.to_string(),
                message: "dependencies are not satisfied".into(),
            });
        }
        self.graph.transition(step_id, NodeStatus::Running)?;
        self.steps_dispatched += 1;
        let node = self.graph.node_mut(step_id)?;
        Ok(node.retry_count + 1)
    }

    /// Project the variables named by the node's `input_bindings`.
    ///
    /// Keys of the returned map are the bindings as declared.
    pub fn bind_inputs(&self, step_id: &str) -> Result<BTreeMap<String, Value>> {
        let node = self
            .graph
            .get(step_id)
            .ok_or_else(|| StepflowError::Schema(format!("unknown step '{}'", step_id)))?;

        let mut inputs = BTreeMap::new();
        for binding in &node.input_bindings {
            let var = self
                .globals
                .resolve(binding)
                .filter(|v| {
                    v.metadata.origin_step == ROOT
                        || self.completed_steps.contains(&v.metadata.origin_step)
                })
                .ok_or_else(|| StepflowError::MissingInput {
                    step: step_id.to_string(),
                    binding: binding.clone(),
                })?;
            inputs.insert(binding.clone(), var.value.clone());
        }
        Ok(inputs)
    }

    /// Commit the outcome of a running step.
    ///
    /// On success the outputs are written, the node completes and any
    /// fragment is merged. On failure the node is marked failed and the
    /// detail recorded. Either everything is applied or nothing is: an error
    /// leaves the context exactly as it was and the node still running.
    pub fn apply_result(&mut self, step_id: &str, outcome: StepOutcome) -> Result<CommitReport> {
        let status = self
            .graph
            .get(step_id)
            .map(|n| n.status)
            .ok_or_else(|| StepflowError::Schema(format!("unknown step '{}'", step_id)))?;
        if status != NodeStatus::Running {
            return Err(StepflowError::InvalidTransition {
                step: step_id.to_string(),
                message: format!("cannot apply a result to a {} step", status),
            });
        }

        match outcome {
            StepOutcome::Succeeded(result) => self.commit_success(step_id, result),
            StepOutcome::Failed(failure) => self.commit_failure(step_id, failure),
        }
    }

    fn commit_success(&mut self, step_id: &str, result: StepResult) -> Result<CommitReport> {
        if result.step_id != step_id {
            return Err(StepflowError::Schema(format!(
                "result for step '{}' applied to '{}'",
                result.step_id, step_id
            )));
        }
        let revision = self.commit_seq + 1;
        let declared = self
            .graph
            .get(step_id)
            .map(|n| n.output_names.clone())
            .unwrap_or_default();
        validator::check_outputs(step_id, result.variant, &declared, &result.outputs)?;

        // (a) variables
        let mut globals = self.globals.clone();
        let from = Provenance {
            step_id,
            variant: result.variant,
            created_files: &result.created_files,
            revision,
            at: Utc::now(),
        };
        let mut written = Vec::with_capacity(result.outputs.len());
        for (name, value) in &result.outputs {
            globals.write(name.clone(), value.clone(), &from);
            written.push(name.clone());
        }

        // (b) node status
        let mut graph = self.graph.clone();
        graph.transition(step_id, NodeStatus::Completed)?;
        {
            let node = graph.node_mut(step_id)?;
            node.retry_count += result.failed_variants();
            node.last_error = None;
        }

        // (c) fragment
        let merge = match result.fragment {
            Some(fragment) if !fragment.is_empty() => Some(graph.merge(fragment)?),
            _ => None,
        };

        self.graph = graph;
        self.globals = globals;
        self.completed_steps.insert(step_id.to_string());
        self.failed_steps.remove(step_id);
        self.usage.add(&result.usage);
        self.commit_seq = revision;

        info!(
            step_id,
            variables = written.len(),
            variant = ?result.variant,
            revision,
            "Step committed"
        );
        if let Some(next) = &result.next_step_id {
            debug!(step_id, next_step_id = %next, "Agent suggested next step");
        }

        Ok(CommitReport {
            step_id: step_id.to_string(),
            status: NodeStatus::Completed,
            variables_written: written,
            merge,
            revision,
        })
    }

    fn commit_failure(&mut self, step_id: &str, failure: StepFailure) -> Result<CommitReport> {
        self.graph.transition(step_id, NodeStatus::Failed)?;
        self.graph.node_mut(step_id)?.last_error = Some(failure.clone());
        warn!(
            step_id,
            kind = %failure.kind,
            attempt = failure.attempt,
            error = %failure.message,
            "Step failed"
        );
        self.failed_steps.insert(step_id.to_string(), failure);
        self.commit_seq += 1;
        Ok(CommitReport {
            step_id: step_id.to_string(),
            status: NodeStatus::Failed,
            variables_written: vec![],
            merge: None,
            revision: self.commit_seq,
        })
    }

    /// Return a failed node to `pending` for another attempt.
    ///
    /// Returns the new retry count. Fails with `RetryExhausted` once the
    /// node's budget is spent.
    pub fn requeue(&mut self, step_id: &str) -> Result<u32> {
        let node = self
            .graph
            .get(step_id)
            .ok_or_else(|| StepflowError::Schema(format!("unknown step '{}'", step_id)))?;
        if node.status != NodeStatus::Failed {
            return Err(StepflowError::InvalidTransition {
                step: step_id.to_string(),
                message: format!("only failed steps can be retried, step is {}", node.status),
            });
        }
        if !node.can_retry() {
            return Err(StepflowError::RetryExhausted {
                step: step_id.to_string(),
                attempts: node.retry_count + 1,
                last_error: node
                    .last_error
                    .as_ref()
                    .map(|f| f.message.clone())
                    .unwrap_or_default(),
            });
        }
        self.graph.transition(step_id, NodeStatus::Pending)?;
        let node = self.graph.node_mut(step_id)?;
        node.retry_count += 1;
        let retries = node.retry_count;
        self.failed_steps.remove(step_id);
        debug!(step_id, retry = retries, "Step requeued");
        Ok(retries)
    }

    /// Skip every pending node that can no longer run because of `cause`
    /// (or anything else that has ended), transitively. Returns the skipped
    /// ids in the order they were skipped.
    pub fn cascade_skip(&mut self, cause: &str) -> Vec<String> {
        let mut skipped = Vec::new();
        loop {
            let doomed = self
                .graph
                .ready_set(&self.completed_steps, &self.failed_ids())
                .doomed;
            if doomed.is_empty() {
                break;
            }
            for id in doomed {
                if self.graph.transition(&id, NodeStatus::Skipped).is_ok() {
                    info!(step_id = %id, cause, "Step skipped");
                    skipped.push(id);
                }
            }
        }
        skipped
    }

    /// Fail a running step that was canceled before it produced a result.
    pub fn cancel_running(&mut self, step_id: &str, reason: &str) -> Result<()> {
        let attempt = self
            .graph
            .get(step_id)
            .map(|n| n.retry_count + 1)
            .unwrap_or(1);
        let failure = StepFailure::new(ErrorKind::Timeout, reason, attempt);
        self.commit_failure(step_id, failure).map(|_| ())
    }

    /// Ids of running nodes, ascending.
    pub fn running_steps(&self) -> Vec<String> {
        self.graph
            .nodes()
            .into_iter()
            .filter(|n| n.status == NodeStatus::Running)
            .map(|n| n.id.clone())
            .collect()
    }

    /// Record the terminal session status.
    pub fn finish(&mut self, status: SessionStatus) {
        self.status = status;
        self.ended_at = Some(Utc::now());
    }

    /// Variables produced by the final step, or by completed sink nodes when
    /// no final step is designated.
    pub fn final_outputs(&self) -> BTreeMap<String, Value> {
        let producers: Vec<&str> = match self.graph.final_step() {
            Some(id) => vec![id],
            None => self.graph.sinks(),
        };
        producers
            .into_iter()
            .filter(|id| self.completed_steps.contains(*id))
            .flat_map(|id| self.globals.produced_by(id))
            .map(|v| (v.name.clone(), v.value.clone()))
            .collect()
    }

    /// Ids of terminally failed steps.
    pub fn failed_ids(&self) -> BTreeSet<String> {
        self.failed_steps.keys().cloned().collect()
    }

    /// Serialize the full session.
    pub fn snapshot(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.to_record())?)
    }

    pub fn to_record(&self) -> SessionRecord {
        SessionRecord {
            version: RECORD_VERSION,
            session_id: self.session_id.clone(),
            original_query: self.original_query.clone(),
            perception: self.perception.clone(),
            planning_strategy: self.planning_strategy,
            status: self.status,
            plan_graph: self.graph.clone(),
            globals_schema: self
                .globals
                .iter()
                .map(|v| (v.name.clone(), ArchivedVariable::from(v)))
                .collect(),
            completed_steps: self.completed_steps.iter().cloned().collect(),
            failed_steps: self
                .failed_steps
                .iter()
                .map(|(id, f)| FailedStep {
                    step_id: id.clone(),
                    failure: f.clone(),
                })
                .collect(),
            cost: self.usage,
            started_at: self.started_at,
            ended_at: self.ended_at,
            deadline: self.deadline,
            commit_seq: self.commit_seq,
            steps_dispatched: self.steps_dispatched,
        }
    }

    /// Rebuild a session from [`snapshot`](Self::snapshot) output.
    ///
    /// Steps caught mid-run go back to `pending`; the session is marked
    /// running again so it can be resumed.
    pub fn restore(blob: &str) -> Result<Self> {
        let record: SessionRecord = serde_json::from_str(blob)?;
        Self::from_record(record)
    }

    pub fn from_record(record: SessionRecord) -> Result<Self> {
        let mut graph = record.plan_graph;
        for id in &record.completed_steps {
            match graph.get(id) {
                Some(n) if n.status == NodeStatus::Completed => {}
                _ => {
                    return Err(StepflowError::Schema(format!(
                        "snapshot lists '{}' as completed but the plan disagrees",
                        id
                    )))
                }
            }
        }
        let reset = graph.reset_running();
        if !reset.is_empty() {
            info!(steps = ?reset, "Interrupted steps returned to pending");
        }

        let mut globals = VariableStore::new();
        for (name, var) in record.globals_schema {
            globals.insert(var.into_variable(name));
        }

        Ok(Self {
            session_id: record.session_id,
            original_query: record.original_query,
            perception: record.perception,
            planning_strategy: record.planning_strategy,
            graph,
            globals,
            completed_steps: record.completed_steps.into_iter().collect(),
            failed_steps: record
                .failed_steps
                .into_iter()
                .map(|f| (f.step_id, f.failure))
                .collect(),
            usage: record.cost,
            started_at: record.started_at,
            ended_at: None,
            deadline: record.deadline,
            status: SessionStatus::Running,
            commit_seq: record.commit_seq,
            steps_dispatched: record.steps_dispatched,
        })
    }
}

/// Persisted form of a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    #[serde(default)]
    pub version: u32,
    pub session_id: SessionId,
    pub original_query: String,
    #[serde(default)]
    pub perception: Value,
    #[serde(default)]
    pub planning_strategy: PlanningStrategy,
    #[serde(default)]
    pub status: SessionStatus,
    pub plan_graph: PlanGraph,
    #[serde(default)]
    pub globals_schema: BTreeMap<String, ArchivedVariable>,
    #[serde(default)]
    pub completed_steps: Vec<String>,
    #[serde(default)]
    pub failed_steps: Vec<FailedStep>,
    #[serde(default)]
    pub cost: Usage,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub deadline: Option<DateTime<Utc>>,
    #[serde(default)]
    pub commit_seq: u64,
    #[serde(default)]
    pub steps_dispatched: usize,
}

/// A variable as archived: the agent-facing entry plus its provenance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchivedVariable {
    #[serde(flatten)]
    pub entry: GlobalEntry,
    pub origin_step: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<Variant>,
    #[serde(default)]
    pub revision: u64,
}

impl From<&Variable> for ArchivedVariable {
    fn from(v: &Variable) -> Self {
        Self {
            entry: GlobalEntry::from(v),
            origin_step: v.metadata.origin_step.clone(),
            variant: v.metadata.variant,
            revision: v.metadata.revision,
        }
    }
}

impl ArchivedVariable {
    fn into_variable(self, name: String) -> Variable {
        Variable {
            name,
            value: self.entry.value,
            metadata: VariableMetadata {
                origin_step: self.origin_step,
                variant: self.variant,
                content_type: self.entry.content_type,
                path: self.entry.path,
                revision: self.revision,
                updated_at: self.entry.updated_at,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedStep {
    pub step_id: String,
    #[serde(flatten)]
    pub failure: StepFailure,
}
