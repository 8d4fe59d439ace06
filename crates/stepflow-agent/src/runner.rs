use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use tracing::{info, warn};

use stepflow_core::config::{AppConfig, GlobalsScope};
use stepflow_core::traits::{ReasoningBackend, Sandbox};
use stepflow_core::{
    AgentRequest, AgentRole, Result, SandboxRequest, SessionId, StepflowError, Usage, Variant,
};

use crate::context::ExecutionContext;
use crate::graph::{GraphFragment, ROOT};
use crate::step::StepResult;
use crate::validator::{self, ParsedReply, ReplyPayload};
use crate::variants;

const PLANNER_INSTRUCTION: &str =
    "Decompose the query into a graph of steps, each delegated to one agent role.";

/// Everything needed to run one step, detached from the session.
///
/// Built by [`AgentRunner::prepare`] while the controller holds the context,
/// then moved into the task that executes it.
#[derive(Debug, Clone)]
pub struct StepTask {
    pub request: AgentRequest,
    pub declared_outputs: Vec<String>,
    /// Plain variable values handed to executing code.
    pub globals: BTreeMap<String, Value>,
}

/// The initial plan produced by the planner role.
#[derive(Debug, Clone)]
pub struct PlannedGraph {
    pub fragment: GraphFragment,
    pub usage: Usage,
}

/// Invokes one agent role for one step.
pub struct AgentRunner {
    backend: Arc<dyn ReasoningBackend>,
    sandbox: Option<Arc<dyn Sandbox>>,
    output_root: PathBuf,
    globals_scope: GlobalsScope,
    include_plan_graph: bool,
}

impl AgentRunner {
    pub fn new(backend: Arc<dyn ReasoningBackend>) -> Self {
        Self {
            backend,
            sandbox: None,
            output_root: PathBuf::from("media/generated"),
            globals_scope: GlobalsScope::All,
            include_plan_graph: true,
        }
    }

    /// Runner configured from `[flow]` and `[sandbox]`.
    pub fn from_config(backend: Arc<dyn ReasoningBackend>, config: &AppConfig) -> Self {
        Self::new(backend)
            .with_output_root(&config.sandbox.output_root)
            .with_globals_scope(config.flow.globals_scope)
            .with_plan_graph(config.flow.include_plan_graph)
    }

    pub fn with_sandbox(mut self, sandbox: Arc<dyn Sandbox>) -> Self {
        self.sandbox = Some(sandbox);
        self
    }

    pub fn with_output_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.output_root = root.into();
        self
    }

    pub fn with_globals_scope(mut self, scope: GlobalsScope) -> Self {
        self.globals_scope = scope;
        self
    }

    pub fn with_plan_graph(mut self, include: bool) -> Self {
        self.include_plan_graph = include;
        self
    }

    /// Directory where a session's code and direct file writes land.
    pub fn output_dir(&self, session_id: &SessionId) -> PathBuf {
        self.output_root.join(&session_id.0)
    }

    /// Ask the planner role for the session's initial graph.
    pub async fn plan(&self, ctx: &ExecutionContext) -> Result<PlannedGraph> {
        let request = AgentRequest {
            session_id: ctx.session_id().clone(),
            step_id: ROOT.to_string(),
            role: AgentRole::Planner,
            description: PLANNER_INSTRUCTION.to_string(),
            original_query: ctx.original_query().to_string(),
            perception: ctx.perception().clone(),
            planning_strategy: ctx.planning_strategy(),
            inputs: BTreeMap::new(),
            globals_schema: ctx.globals().schema(None),
            plan_graph: None,
            completed_steps: vec![],
            failed_steps: vec![],
        };
        let reply = self.backend.respond(AgentRole::Planner, request).await?;
        let fragment = validator::parse_plan_reply(&reply.body)?;
        info!(
            session_id = %ctx.session_id(),
            nodes = fragment.nodes.len(),
            edges = fragment.edges.len(),
            "Initial plan received"
        );
        Ok(PlannedGraph {
            fragment,
            usage: reply.usage,
        })
    }

    /// Build the request for `step_id` from the current session state.
    ///
    /// Fails with `MissingInput` when a binding has no completed producer.
    pub fn prepare(&self, ctx: &ExecutionContext, step_id: &str) -> Result<StepTask> {
        let node = ctx
            .graph()
            .get(step_id)
            .ok_or_else(|| StepflowError::Schema(format!("unknown step '{}'", step_id)))?;
        let inputs = ctx.bind_inputs(step_id)?;

        let origins = match self.globals_scope {
            GlobalsScope::All => None,
            GlobalsScope::Ancestors => {
                let mut ancestors = ctx.graph().ancestors(step_id);
                ancestors.insert(ROOT.to_string());
                Some(ancestors)
            }
        };
        let plan_graph = if self.include_plan_graph {
            Some(serde_json::to_value(ctx.graph())?)
        } else {
            None
        };

        let request = AgentRequest {
            session_id: ctx.session_id().clone(),
            step_id: step_id.to_string(),
            role: node.role,
            description: node.description.clone(),
            original_query: ctx.original_query().to_string(),
            perception: ctx.perception().clone(),
            planning_strategy: ctx.planning_strategy(),
            inputs,
            globals_schema: ctx.globals().schema(origins.as_ref()),
            plan_graph,
            completed_steps: ctx.completed_steps().iter().cloned().collect(),
            failed_steps: ctx.failed_ids().into_iter().collect(),
        };

        Ok(StepTask {
            request,
            declared_outputs: node.output_names.clone(),
            globals: ctx.globals().values(origins.as_ref()),
        })
    }

    /// Run a prepared step to a result. Never touches session state.
    pub async fn execute(&self, task: StepTask) -> Result<StepResult> {
        let started = Instant::now();
        let role = task.request.role;
        let step_id = task.request.step_id.clone();
        info!(step_id = %step_id, role = %role, "Running step");

        let reply = self.backend.respond(role, task.request.clone()).await?;
        let parsed = validator::parse_step_reply(role, &step_id, &reply.body)?;

        let mut result = match role {
            AgentRole::Planner => {
                return Err(StepflowError::Schema(format!(
                    "step {} uses the planner role, which only produces the initial plan",
                    step_id
                )))
            }
            AgentRole::Coder | AgentRole::Retriever => self.run_code(&task, parsed).await?,
            AgentRole::Thinker
            | AgentRole::Distiller
            | AgentRole::Qa
            | AgentRole::Formatter
            | AgentRole::Summarizer
            | AgentRole::Clarification => run_direct(&task, parsed)?,
        };

        result.usage = reply.usage;
        result.elapsed_ms = started.elapsed().as_millis() as u64;
        info!(
            step_id = %step_id,
            outputs = result.outputs.len(),
            variant = ?result.variant,
            elapsed_ms = result.elapsed_ms,
            "Step produced a result"
        );
        Ok(result)
    }

    /// Prepare and execute in one go.
    pub async fn run(&self, ctx: &ExecutionContext, step_id: &str) -> Result<StepResult> {
        let task = self.prepare(ctx, step_id)?;
        self.execute(task).await
    }

    async fn run_code(&self, task: &StepTask, parsed: ParsedReply) -> Result<StepResult> {
        let step_id = task.request.step_id.as_str();
        let variants = match parsed.payload {
            ReplyPayload::Code(v) => v,
            ReplyPayload::Outputs(_) => {
                return Err(StepflowError::Validation(format!(
                    "{} reply for step {} carries outputs instead of code_variants",
                    task.request.role, step_id
                )))
            }
        };
        let sandbox = self.sandbox.as_ref().ok_or_else(|| {
            StepflowError::Config("no sandbox configured for code-producing roles".into())
        })?;

        let output_dir = self.output_dir(&task.request.session_id);
        let mut result = StepResult::new(step_id);

        if !parsed.files.is_empty() {
            let report = stepflow_tools::files::write_direct_files(&output_dir, &parsed.files).await;
            if !report.errors.is_empty() {
                warn!(step_id, errors = ?report.errors, "Some files could not be written");
            }
            result.created_files.extend(report.created);
            result.file_errors = report.errors;
        }

        let base = SandboxRequest {
            session_id: task.request.session_id.clone(),
            step_id: step_id.to_string(),
            variant: Variant::A,
            code: String::new(),
            inputs: task.request.inputs.clone(),
            globals: task.globals.clone(),
            output_dir,
        };
        let selection =
            variants::select_variant(sandbox.as_ref(), &base, variants, &task.declared_outputs)
                .await?;

        result.outputs = selection.outputs;
        result.variant = Some(selection.variant);
        result.variant_errors = selection.errors;
        result.created_files.extend(selection.created_files);
        result.tool_calls = selection.tool_calls;
        result.fragment = parsed.fragment;
        result.next_step_id = parsed.next_step_id;
        Ok(result)
    }
}

fn run_direct(task: &StepTask, parsed: ParsedReply) -> Result<StepResult> {
    let step_id = task.request.step_id.as_str();
    let outputs = match parsed.payload {
        ReplyPayload::Outputs(o) => o,
        ReplyPayload::Code(_) => {
            return Err(StepflowError::Validation(format!(
                "{} reply for step {} carries code_variants instead of outputs",
                task.request.role, step_id
            )))
        }
    };
    validator::check_outputs(step_id, None, &task.declared_outputs, &outputs)?;

    let mut result = StepResult::new(step_id);
    result.outputs = outputs;
    result.fragment = parsed.fragment;
    result.next_step_id = parsed.next_step_id;
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{NodeSpec, PlanEdge};
    use serde_json::json;
    use stepflow_test_utils::{code_reply, outputs_reply, plan_reply, ScriptedBackend, ScriptedSandbox};

    fn two_step_ctx() -> ExecutionContext {
        let mut ctx = ExecutionContext::new("how many rows?");
        ctx.seed_plan(
            GraphFragment::new()
                .with_node(NodeSpec::new("T1", AgentRole::Coder).with_outputs(&["rows"]))
                .with_node(
                    NodeSpec::new("T2", AgentRole::Summarizer)
                        .with_inputs(&["rows"])
                        .with_outputs(&["answer"]),
                )
                .with_edge(PlanEdge::new("T1", "T2")),
        )
        .unwrap();
        ctx
    }

    #[tokio::test]
    async fn test_plan_uses_planner_role() {
        let backend = Arc::new(ScriptedBackend::new().reply(
            ROOT,
            plan_reply(json!({"nodes": [{"id": "T1", "role": "thinker"}], "edges": []})),
        ));
        let runner = AgentRunner::new(backend.clone());
        let ctx = ExecutionContext::new("q");
        let planned = runner.plan(&ctx).await.unwrap();
        assert_eq!(planned.fragment.nodes[0].id, "T1");
        assert_eq!(backend.requests()[0].role, AgentRole::Planner);
    }

    #[tokio::test]
    async fn test_code_step_selects_variant() {
        let backend = Arc::new(ScriptedBackend::new().reply(
            "T1",
            code_reply(
                "T1",
                &[
                    ("A", "raise KeyError"),
                    ("B", r#"return {"rows_T1B": [1, 2]}"#),
                ],
            ),
        ));
        let sandbox = Arc::new(ScriptedSandbox::new());
        let runner = AgentRunner::new(backend).with_sandbox(sandbox);
        let ctx = two_step_ctx();

        let result = runner.run(&ctx, "T1").await.unwrap();
        assert_eq!(result.variant, Some(Variant::B));
        assert_eq!(result.failed_variants(), 1);
        assert_eq!(result.outputs["rows_T1B"], json!([1, 2]));
    }

    #[tokio::test]
    async fn test_code_step_without_sandbox_fails() {
        let backend = Arc::new(
            ScriptedBackend::new().reply("T1", code_reply("T1", &[("A", "return {}")])),
        );
        let runner = AgentRunner::new(backend);
        let err = runner.run(&two_step_ctx(), "T1").await.unwrap_err();
        assert!(matches!(err, StepflowError::Config(_)));
    }

    #[tokio::test]
    async fn test_direct_step_validates_names() {
        let backend = Arc::new(
            ScriptedBackend::new().reply("T1", outputs_reply(json!({"answer": 3}))),
        );
        let runner = AgentRunner::new(backend);
        let mut ctx = ExecutionContext::new("q");
        ctx.seed_plan(
            GraphFragment::new().with_node(NodeSpec::new("T1", AgentRole::Thinker)),
        )
        .unwrap();
        let err = runner.run(&ctx, "T1").await.unwrap_err();
        assert!(matches!(err, StepflowError::Validation(_)));
    }

    #[tokio::test]
    async fn test_prepare_binds_inputs_and_scopes_globals() {
        let backend = Arc::new(ScriptedBackend::new());
        let runner = AgentRunner::new(backend)
            .with_globals_scope(GlobalsScope::Ancestors)
            .with_plan_graph(false);
        let mut ctx = two_step_ctx();
        ctx.seed_variable("unit", json!("rows"));

        let err = runner.prepare(&ctx, "T2").unwrap_err();
        assert!(matches!(err, StepflowError::MissingInput { .. }));

        let task = runner.prepare(&ctx, "T1").unwrap();
        assert!(task.request.plan_graph.is_none());
        assert_eq!(task.request.original_query, "how many rows?");
        assert!(task.request.globals_schema.contains_key("unit"));
        assert_eq!(task.declared_outputs, vec!["rows"]);
    }
}
