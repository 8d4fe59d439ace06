use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::FutureExt;
use serde_json::Value;
use tokio::task::{Id, JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use stepflow_core::config::FlowConfig;
use stepflow_core::event::EventBus;
use stepflow_core::traits::SessionArchive;
use stepflow_core::{
    ArchivedSession, FlowEvent, NodeStatus, Result, SessionId, SessionStatus, StepFailure,
    StepflowError, Usage,
};

use crate::context::ExecutionContext;
use crate::graph::EdgeCondition;
use crate::runner::AgentRunner;
use crate::step::{StepOutcome, StepResult};

/// Summary of a session that reached a terminal state.
#[derive(Debug, Clone)]
pub struct SessionOutcome {
    pub session_id: SessionId,
    pub status: SessionStatus,
    pub final_step: Option<String>,
    /// Variables produced by the final step (or by completed sinks).
    pub final_outputs: BTreeMap<String, Value>,
    pub completed: Vec<String>,
    pub failed: Vec<String>,
    pub skipped: Vec<String>,
    pub steps_dispatched: usize,
    pub usage: Usage,
    pub elapsed_ms: u64,
}

type StepJoin = (String, Result<StepResult>);

/// Steps currently executing, with the output names each one declared.
#[derive(Default)]
struct InFlight {
    tasks: JoinSet<StepJoin>,
    outputs: HashMap<String, Vec<String>>,
    steps: HashMap<Id, String>,
}

impl InFlight {
    fn spawn<F>(&mut self, step_id: String, declared: Vec<String>, task: F)
    where
        F: std::future::Future<Output = StepJoin> + Send + 'static,
    {
        let handle = self.tasks.spawn(task);
        self.steps.insert(handle.id(), step_id.clone());
        self.outputs.insert(step_id, declared);
    }

    /// Forget a finished task; returns the step it was running.
    fn finish(&mut self, id: Id) -> Option<String> {
        let step_id = self.steps.remove(&id)?;
        self.outputs.remove(&step_id);
        Some(step_id)
    }

    fn clear(&mut self) {
        self.outputs.clear();
        self.steps.clear();
    }

    fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    fn len(&self) -> usize {
        self.tasks.len()
    }

    fn conflicts(&self, declared: &[String]) -> bool {
        self.outputs
            .values()
            .any(|outs| outs.iter().any(|o| declared.contains(o)))
    }
}

enum Dispatch {
    /// Number of steps whose state changed (started, or failed while preparing).
    Progress(usize),
    /// The step ceiling was hit with work still ready.
    Ceiling,
}

/// Drives a session's plan graph to a terminal state.
///
/// A single loop owns the [`ExecutionContext`]: it computes the ready set,
/// hands ready steps to the [`AgentRunner`] as independent tasks (up to
/// `max_concurrency`, never two with overlapping declared outputs at once),
/// and commits results in completion order. Failed steps are retried within
/// their budget; exhausted ones cascade `skipped` to everything that can no
/// longer run.
pub struct FlowController {
    runner: Arc<AgentRunner>,
    config: FlowConfig,
    event_bus: Arc<EventBus>,
    archive: Option<Arc<dyn SessionArchive>>,
    cancel: CancellationToken,
}

impl FlowController {
    pub fn new(runner: Arc<AgentRunner>, config: FlowConfig, event_bus: Arc<EventBus>) -> Self {
        Self {
            runner,
            config,
            event_bus,
            archive: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Save every terminal session snapshot here.
    pub fn with_archive(mut self, archive: Arc<dyn SessionArchive>) -> Self {
        self.archive = Some(archive);
        self
    }

    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Cancelling this token stops the session as if its deadline passed.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Bootstrap a fresh session: ask the planner for the initial graph,
    /// then run it. A context that already has a plan is run as is.
    pub async fn start(&self, ctx: &mut ExecutionContext) -> Result<SessionOutcome> {
        if ctx.graph().is_empty() {
            let seeded = match self.runner.plan(ctx).await {
                Ok(planned) => {
                    ctx.record_usage(&planned.usage);
                    ctx.seed_plan(planned.fragment).map(|_| ())
                }
                Err(e) => Err(e),
            };
            if let Err(e) = seeded {
                error!(session_id = %ctx.session_id(), error = %e, "Planning failed");
                self.publish(FlowEvent::SessionStarted {
                    session_id: ctx.session_id().clone(),
                });
                self.terminate(ctx, SessionStatus::Failed);
                return Err(e);
            }
        }
        self.run(ctx).await
    }

    /// Drive an existing (possibly restored) session until it terminates.
    ///
    /// Returns the outcome for sessions that complete or fail. Deadlocks,
    /// deadlines, cancellation and the step ceiling end the session in its
    /// partial state and surface as errors; the snapshot is archived first.
    pub async fn run(&self, ctx: &mut ExecutionContext) -> Result<SessionOutcome> {
        let started = Instant::now();
        // The ceiling applies per run so a restored session gets a fresh budget.
        let dispatched_before = ctx.steps_dispatched();
        let deadline = self.resolve_deadline(ctx);
        let cancel = self.cancel.child_token();
        let mut flight = InFlight::default();

        info!(
            session_id = %ctx.session_id(),
            steps = ctx.graph().len(),
            max_concurrency = self.config.max_concurrency,
            max_steps = self.config.max_steps,
            "Session started"
        );
        self.publish(FlowEvent::SessionStarted {
            session_id: ctx.session_id().clone(),
        });
        self.skip_blocked(ctx, "dependency can no longer be satisfied");

        loop {
            // Once the outcome is decided nothing new is dispatched; whatever
            // is still running is drained and committed.
            let mut progressed = 0;
            if self.resolution(ctx).is_none() {
                match self.dispatch(ctx, &mut flight, &cancel, dispatched_before)? {
                    Dispatch::Progress(n) => progressed = n,
                    Dispatch::Ceiling => {
                        let reason = format!(
                            "step ceiling of {} dispatches reached",
                            self.config.max_steps
                        );
                        return self.abort(ctx, &mut flight, &cancel, reason).await;
                    }
                }
            }

            if flight.is_empty() {
                if let Some(status) = self.resolution(ctx) {
                    return Ok(self.conclude(ctx, status, started));
                }
                if progressed > 0 {
                    continue;
                }
                return Err(self.deadlock(ctx));
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    return self.abort(ctx, &mut flight, &cancel, "session canceled".into()).await;
                }
                _ = sleep_until(deadline) => {
                    return self
                        .abort(ctx, &mut flight, &cancel, "session deadline exceeded".into())
                        .await;
                }
                joined = flight.tasks.join_next_with_id() => {
                    if let Some(joined) = joined {
                        self.settle(ctx, &mut flight, joined)?;
                    }
                }
            }
        }
    }

    /// A budget too large to represent means no deadline.
    fn resolve_deadline(&self, ctx: &mut ExecutionContext) -> Option<tokio::time::Instant> {
        let secs = self.config.max_duration_secs;
        if ctx.deadline().is_none() && secs > 0 {
            let at = i64::try_from(secs)
                .ok()
                .and_then(chrono::TimeDelta::try_seconds)
                .and_then(|budget| Utc::now().checked_add_signed(budget));
            match at {
                Some(at) => ctx.set_deadline(Some(at)),
                None => warn!(max_duration_secs = secs, "Session budget out of range, running unbounded"),
            }
        }
        ctx.deadline().and_then(|at| {
            let remaining = (at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            tokio::time::Instant::now().checked_add(remaining)
        })
    }

    /// Start as many ready steps as the limits allow.
    fn dispatch(
        &self,
        ctx: &mut ExecutionContext,
        flight: &mut InFlight,
        cancel: &CancellationToken,
        dispatched_before: usize,
    ) -> Result<Dispatch> {
        let mut progressed = 0;
        for step_id in ctx.ready_steps() {
            if flight.len() >= self.config.max_concurrency.max(1) {
                break;
            }
            let (role, declared) = match ctx.graph().get(&step_id) {
                Some(node) => (node.role, node.output_names.clone()),
                None => continue,
            };
            if flight.conflicts(&declared) {
                debug!(step_id = %step_id, "Deferred: declared outputs overlap a running step");
                continue;
            }
            if ctx.steps_dispatched().saturating_sub(dispatched_before) >= self.config.max_steps {
                return Ok(Dispatch::Ceiling);
            }

            let attempt = ctx.mark_running(&step_id)?;
            progressed += 1;
            self.publish(FlowEvent::StepStarted {
                session_id: ctx.session_id().clone(),
                step_id: step_id.clone(),
                role,
                attempt,
                status: NodeStatus::Running,
            });

            let task = match self.runner.prepare(ctx, &step_id) {
                Ok(task) => task,
                Err(e) => {
                    self.handle_failure(ctx, &step_id, e)?;
                    continue;
                }
            };

            let runner = self.runner.clone();
            let token = cancel.clone();
            let id = step_id.clone();
            flight.spawn(step_id, declared, async move {
                let run = std::panic::AssertUnwindSafe(runner.execute(task)).catch_unwind();
                let result = tokio::select! {
                    r = run => r.unwrap_or_else(|_| {
                        Err(StepflowError::Internal(format!("step {} panicked", id)))
                    }),
                    _ = token.cancelled() => Err(StepflowError::Timeout(format!("step {} canceled", id))),
                };
                (id, result)
            });
        }
        Ok(Dispatch::Progress(progressed))
    }

    /// Route a joined task to its step. A task that died without reporting
    /// fails its step as an internal error.
    fn settle(
        &self,
        ctx: &mut ExecutionContext,
        flight: &mut InFlight,
        joined: std::result::Result<(Id, StepJoin), JoinError>,
    ) -> Result<()> {
        match joined {
            Ok((id, (step_id, result))) => {
                flight.finish(id);
                self.commit(ctx, &step_id, result)
            }
            Err(e) => {
                let Some(step_id) = flight.finish(e.id()) else {
                    error!(error = %e, "Untracked step task ended abnormally");
                    return Ok(());
                };
                error!(step_id = %step_id, error = %e, "Step task ended abnormally");
                let err = StepflowError::Internal(format!("step {} task failed: {}", step_id, e));
                self.handle_failure(ctx, &step_id, err)
            }
        }
    }

    /// Apply one finished step. A result that cannot be committed fails the
    /// step instead.
    fn commit(&self, ctx: &mut ExecutionContext, step_id: &str, result: Result<StepResult>) -> Result<()> {
        let result = match result {
            Ok(result) => result,
            Err(e) => return self.handle_failure(ctx, step_id, e),
        };
        let variant = result.variant;
        let elapsed_ms = result.elapsed_ms;
        match ctx.apply_result(step_id, StepOutcome::Succeeded(result)) {
            Ok(report) => {
                if let Some(merge) = report.merge.as_ref().filter(|m| !m.is_noop()) {
                    info!(
                        step_id,
                        added = ?merge.added,
                        redefined = ?merge.redefined,
                        edges = merge.edges_added,
                        "Plan extended"
                    );
                }
                self.publish(FlowEvent::StepCompleted {
                    session_id: ctx.session_id().clone(),
                    step_id: step_id.to_string(),
                    status: NodeStatus::Completed,
                    variant,
                    elapsed_ms,
                });
                Ok(())
            }
            Err(e) => {
                warn!(step_id, error = %e, "Step result rejected at commit");
                self.handle_failure(ctx, step_id, e)
            }
        }
    }

    /// Record a failed attempt, then either requeue the step or let its
    /// dependents go.
    fn handle_failure(&self, ctx: &mut ExecutionContext, step_id: &str, err: StepflowError) -> Result<()> {
        let attempt = ctx
            .graph()
            .get(step_id)
            .map(|n| n.retry_count + 1)
            .unwrap_or(1);
        let kind = err.kind();
        let message = err.to_string();
        ctx.apply_result(
            step_id,
            StepOutcome::Failed(StepFailure::new(kind, message.clone(), attempt)),
        )?;

        let can_retry = ctx.graph().get(step_id).is_some_and(|n| n.can_retry());
        let will_retry = err.is_retryable() && can_retry;
        self.publish(FlowEvent::StepFailed {
            session_id: ctx.session_id().clone(),
            step_id: step_id.to_string(),
            status: NodeStatus::Failed,
            kind,
            message,
            will_retry,
        });

        if will_retry {
            let retry = ctx.requeue(step_id)?;
            info!(step_id, retry, kind = %kind, "Retrying step");
        } else {
            warn!(step_id, kind = %kind, attempt, "Step failed for good");
            self.skip_blocked(ctx, &format!("step {} failed", step_id));
        }
        Ok(())
    }

    fn skip_blocked(&self, ctx: &mut ExecutionContext, cause: &str) {
        for step_id in ctx.cascade_skip(cause) {
            self.publish(FlowEvent::StepSkipped {
                session_id: ctx.session_id().clone(),
                step_id,
                status: NodeStatus::Skipped,
                cause: cause.to_string(),
            });
        }
    }

    /// The session status once it is decided, `None` while work remains.
    fn resolution(&self, ctx: &ExecutionContext) -> Option<SessionStatus> {
        let graph = ctx.graph();
        if let Some(final_id) = graph.final_step() {
            match graph.get(final_id).map(|n| n.status) {
                Some(NodeStatus::Completed) => return Some(SessionStatus::Completed),
                Some(NodeStatus::Failed) | Some(NodeStatus::Skipped) => {
                    return Some(SessionStatus::Failed)
                }
                _ => {}
            }
        }
        if graph.is_empty() || !graph.is_resolved() {
            return None;
        }
        if graph.final_step().is_some() {
            // Everything ended without the final step ever running.
            return Some(SessionStatus::Failed);
        }

        let any_completed = !ctx.completed_steps().is_empty();
        let unhandled = ctx.failed_steps().keys().find(|failed| {
            !graph.dependents(failed).into_iter().any(|d| {
                ctx.completed_steps().contains(d)
                    && graph
                        .dependencies(d)
                        .iter()
                        .any(|(src, cond)| src == failed && *cond == EdgeCondition::OnFailure)
            })
        });
        match unhandled {
            None if any_completed => Some(SessionStatus::Completed),
            _ => Some(SessionStatus::Failed),
        }
    }

    fn deadlock(&self, ctx: &mut ExecutionContext) -> StepflowError {
        let pending = ctx.graph().unresolved();
        error!(session_id = %ctx.session_id(), pending = ?pending, "No runnable step left");
        self.terminate(ctx, SessionStatus::Deadlocked);
        StepflowError::Deadlock { pending }
    }

    /// Stop everything in flight and end the session as timed out.
    async fn abort(
        &self,
        ctx: &mut ExecutionContext,
        flight: &mut InFlight,
        cancel: &CancellationToken,
        reason: String,
    ) -> Result<SessionOutcome> {
        warn!(
            session_id = %ctx.session_id(),
            in_flight = flight.len(),
            reason = %reason,
            "Stopping session"
        );
        cancel.cancel();
        while flight.tasks.join_next().await.is_some() {}
        flight.clear();

        for step_id in ctx.running_steps() {
            ctx.cancel_running(&step_id, &reason)?;
            self.publish(FlowEvent::StepFailed {
                session_id: ctx.session_id().clone(),
                step_id,
                status: NodeStatus::Failed,
                kind: stepflow_core::ErrorKind::Timeout,
                message: reason.clone(),
                will_retry: false,
            });
        }
        self.terminate(ctx, SessionStatus::TimedOut);
        Err(StepflowError::Timeout(reason))
    }

    fn conclude(&self, ctx: &mut ExecutionContext, status: SessionStatus, started: Instant) -> SessionOutcome {
        self.terminate(ctx, status);

        let mut outcome = SessionOutcome {
            session_id: ctx.session_id().clone(),
            status,
            final_step: ctx.graph().final_step().map(str::to_string),
            final_outputs: ctx.final_outputs(),
            completed: vec![],
            failed: vec![],
            skipped: vec![],
            steps_dispatched: ctx.steps_dispatched(),
            usage: *ctx.usage(),
            elapsed_ms: started.elapsed().as_millis() as u64,
        };
        for node in ctx.graph().nodes() {
            match node.status {
                NodeStatus::Completed => outcome.completed.push(node.id.clone()),
                NodeStatus::Failed => outcome.failed.push(node.id.clone()),
                NodeStatus::Skipped => outcome.skipped.push(node.id.clone()),
                NodeStatus::Pending | NodeStatus::Running => {}
            }
        }
        info!(
            session_id = %outcome.session_id,
            status = %status,
            completed = outcome.completed.len(),
            failed = outcome.failed.len(),
            skipped = outcome.skipped.len(),
            elapsed_ms = outcome.elapsed_ms,
            "Session finished"
        );
        outcome
    }

    /// Record the terminal status, archive the snapshot, tell observers.
    fn terminate(&self, ctx: &mut ExecutionContext, status: SessionStatus) {
        ctx.finish(status);
        self.archive(ctx);
        self.publish(FlowEvent::SessionTerminated {
            session_id: ctx.session_id().clone(),
            status,
        });
    }

    fn archive(&self, ctx: &ExecutionContext) {
        let Some(archive) = &self.archive else {
            return;
        };
        let snapshot = match ctx.snapshot() {
            Ok(s) => s,
            Err(e) => {
                error!(session_id = %ctx.session_id(), error = %e, "Failed to serialize session");
                return;
            }
        };
        let record = ArchivedSession {
            session_id: ctx.session_id().0.clone(),
            status: ctx.status(),
            snapshot,
            updated_at: Utc::now(),
        };
        match archive.save(&record) {
            Ok(()) => debug!(session_id = %record.session_id, status = %record.status, "Session archived"),
            Err(e) => error!(session_id = %record.session_id, error = %e, "Failed to archive session"),
        }
    }

    fn publish(&self, event: FlowEvent) {
        self.event_bus.publish(event);
    }
}

async fn sleep_until(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{GraphFragment, NodeSpec, PlanEdge};
    use serde_json::json;
    use stepflow_core::AgentRole;
    use stepflow_test_utils::{outputs_reply, plan_reply, ScriptedBackend};

    fn controller(backend: ScriptedBackend, config: FlowConfig) -> (FlowController, Arc<EventBus>) {
        let bus = Arc::new(EventBus::default());
        let runner = Arc::new(AgentRunner::new(Arc::new(backend)));
        (FlowController::new(runner, config, bus.clone()), bus)
    }

    fn chain() -> GraphFragment {
        GraphFragment::new()
            .with_node(NodeSpec::new("A", AgentRole::Thinker).with_outputs(&["idea"]))
            .with_node(NodeSpec::new("B", AgentRole::Summarizer).with_inputs(&["idea"]))
            .with_edge(PlanEdge::new("A", "B"))
    }

    #[tokio::test]
    async fn test_start_plans_then_runs() {
        let backend = ScriptedBackend::new()
            .reply(
                "ROOT",
                plan_reply(json!({
                    "nodes": [
                        {"id": "A", "agent": "ThinkerAgent", "writes": ["idea"]},
                        {"id": "B", "agent": "SummarizerAgent", "reads": ["idea"]}
                    ],
                    "edges": [{"source": "A", "target": "B"}]
                })),
            )
            .reply("A", outputs_reply(json!({"idea_A": "x"})))
            .reply("B", outputs_reply(json!({"summary_B": "done"})));
        let (controller, _bus) = controller(backend, FlowConfig::default());

        let mut ctx = ExecutionContext::new("q");
        let outcome = controller.start(&mut ctx).await.unwrap();
        assert_eq!(outcome.status, SessionStatus::Completed);
        assert_eq!(outcome.completed, vec!["A", "B"]);
        assert_eq!(outcome.final_outputs["summary_B"], "done");
        assert_eq!(ctx.status(), SessionStatus::Completed);
    }

    #[tokio::test]
    async fn test_exhausted_step_skips_dependents() {
        let backend = ScriptedBackend::new().fail("A", "boom").fail("A", "boom");
        let mut config = FlowConfig::default();
        config.default_max_retries = 1;
        let (controller, _bus) = controller(backend, config);

        let mut ctx = ExecutionContext::new("q").with_default_max_retries(1);
        ctx.seed_plan(chain()).unwrap();
        let outcome = controller.run(&mut ctx).await.unwrap();

        assert_eq!(outcome.status, SessionStatus::Failed);
        assert_eq!(outcome.failed, vec!["A"]);
        assert_eq!(outcome.skipped, vec!["B"]);
        assert_eq!(ctx.graph().get("A").unwrap().retry_count, 1);
    }

    #[tokio::test]
    async fn test_non_retryable_failure_is_not_retried() {
        // Missing the declared output is a validation failure.
        let backend = ScriptedBackend::new().reply("A", outputs_reply(json!({"other_A": 1})));
        let (controller, _bus) = controller(backend, FlowConfig::default());

        let mut ctx = ExecutionContext::new("q");
        ctx.seed_plan(chain()).unwrap();
        let outcome = controller.run(&mut ctx).await.unwrap();

        assert_eq!(outcome.status, SessionStatus::Failed);
        let node = ctx.graph().get("A").unwrap();
        assert_eq!(node.retry_count, 0);
        assert_eq!(
            node.last_error.as_ref().unwrap().kind,
            stepflow_core::ErrorKind::Validation
        );
    }

    #[tokio::test]
    async fn test_fallback_edge_recovers_session() {
        let backend = ScriptedBackend::new()
            .fail("A", "down")
            .reply("F", outputs_reply(json!({"note_F": "fallback used"})));
        let (controller, _bus) = controller(backend, FlowConfig::default());

        let mut ctx = ExecutionContext::new("q").with_default_max_retries(0);
        ctx.seed_plan(
            GraphFragment::new()
                .with_node(NodeSpec::new("A", AgentRole::Thinker))
                .with_node(NodeSpec::new("B", AgentRole::Summarizer))
                .with_node(NodeSpec::new("F", AgentRole::Formatter))
                .with_edge(PlanEdge::new("A", "B"))
                .with_edge(PlanEdge::on_failure("A", "F")),
        )
        .unwrap();
        let outcome = controller.run(&mut ctx).await.unwrap();

        assert_eq!(outcome.status, SessionStatus::Completed);
        assert_eq!(outcome.completed, vec!["F"]);
        assert_eq!(outcome.failed, vec!["A"]);
        assert_eq!(outcome.skipped, vec!["B"]);
    }

    #[tokio::test]
    async fn test_final_step_ends_session_early() {
        let backend = ScriptedBackend::new()
            .reply("A", outputs_reply(json!({"answer_A": 42})));
        let (controller, _bus) = controller(backend, FlowConfig::default());

        let mut ctx = ExecutionContext::new("q");
        ctx.seed_plan(
            GraphFragment::new()
                .with_node(NodeSpec::new("A", AgentRole::Thinker))
                .with_node(NodeSpec::new("C", AgentRole::Formatter))
                .with_edge(PlanEdge::new("A", "C"))
                .with_final_step("A"),
        )
        .unwrap();
        let outcome = controller.run(&mut ctx).await.unwrap();

        assert_eq!(outcome.status, SessionStatus::Completed);
        assert_eq!(outcome.final_step.as_deref(), Some("A"));
        assert_eq!(outcome.final_outputs["answer_A"], 42);
        // C never ran.
        assert_eq!(ctx.graph().get("C").unwrap().status, NodeStatus::Pending);
    }

    #[tokio::test]
    async fn test_events_follow_lifecycle() {
        let backend = ScriptedBackend::new()
            .reply("A", outputs_reply(json!({"idea_A": "x"})))
            .reply("B", outputs_reply(json!({})));
        let (controller, bus) = controller(backend, FlowConfig::default());
        let mut rx = bus.subscribe();

        let mut ctx = ExecutionContext::new("q");
        ctx.seed_plan(chain()).unwrap();
        controller.run(&mut ctx).await.unwrap();

        let mut kinds = Vec::new();
        while let Ok(event) = rx.try_recv() {
            let json = serde_json::to_value(&event).unwrap();
            kinds.push(json["event"].as_str().unwrap().to_string());
        }
        assert_eq!(
            kinds,
            vec![
                "session_started",
                "step_started",
                "step_completed",
                "step_started",
                "step_completed",
                "session_terminated"
            ]
        );
    }
    async fn exploding_step() -> StepJoin {
        panic!("task died outside the runner")
    }

    #[tokio::test]
    async fn test_dead_task_fails_its_step() {
        let (controller, _bus) = controller(ScriptedBackend::new(), FlowConfig::default());
        let mut ctx = ExecutionContext::new("q").with_default_max_retries(0);
        ctx.seed_plan(chain()).unwrap();
        ctx.mark_running("A").unwrap();

        let mut flight = InFlight::default();
        flight.spawn("A".into(), vec!["idea".into()], exploding_step());
        let joined = flight.tasks.join_next_with_id().await.unwrap();
        assert!(joined.is_err());
        controller.settle(&mut ctx, &mut flight, joined).unwrap();

        let node = ctx.graph().get("A").unwrap();
        assert_eq!(node.status, NodeStatus::Failed);
        assert_eq!(
            node.last_error.as_ref().unwrap().kind,
            stepflow_core::ErrorKind::Internal
        );
        assert_eq!(ctx.graph().get("B").unwrap().status, NodeStatus::Skipped);
        assert!(flight.steps.is_empty());
        assert!(flight.outputs.is_empty());
    }

    #[tokio::test]
    async fn test_huge_duration_budget_runs_unbounded() {
        for secs in [u64::MAX, i64::MAX as u64] {
            let backend = ScriptedBackend::new()
                .reply("A", outputs_reply(json!({"idea_A": "x"})))
                .reply("B", outputs_reply(json!({})));
            let config = FlowConfig {
                max_duration_secs: secs,
                ..FlowConfig::default()
            };
            let (controller, _bus) = controller(backend, config);

            let mut ctx = ExecutionContext::new("q");
            ctx.seed_plan(chain()).unwrap();
            let outcome = controller.run(&mut ctx).await.unwrap();

            assert_eq!(outcome.status, SessionStatus::Completed);
            assert!(ctx.deadline().is_none());
        }
    }

    #[tokio::test]
    async fn test_ceiling_counts_only_this_run() {
        let backend = ScriptedBackend::new().reply("A", outputs_reply(json!({"idea_A": "x"})));
        let config = FlowConfig {
            max_steps: 1,
            ..FlowConfig::default()
        };
        let (controller, _bus) = controller(backend, config);

        let mut ctx = ExecutionContext::new("q");
        ctx.seed_plan(
            GraphFragment::new()
                .with_node(NodeSpec::new("P", AgentRole::Thinker))
                .with_node(NodeSpec::new("A", AgentRole::Thinker).with_outputs(&["idea"])),
        )
        .unwrap();
        // P ran in an earlier run of this session.
        ctx.mark_running("P").unwrap();
        ctx.apply_result("P", StepOutcome::Succeeded(StepResult::new("P")))
            .unwrap();
        assert_eq!(ctx.steps_dispatched(), 1);

        let outcome = controller.run(&mut ctx).await.unwrap();
        assert_eq!(outcome.status, SessionStatus::Completed);
        assert_eq!(outcome.steps_dispatched, 2);
    }
}
