use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::BoxFuture;
use serde_json::{json, Value};

use stepflow_agent::{
    AgentRunner, ExecutionContext, FlowController, GraphFragment, NodeSpec, PlanEdge, SqliteArchive,
    StepOutcome,
};
use stepflow_core::config::FlowConfig;
use stepflow_core::traits::{ReasoningBackend, SessionArchive};
use stepflow_core::{
    AgentReply, AgentRequest, AgentRole, ErrorKind, EventBus, FlowEvent, NodeStatus, Result,
    SessionStatus, StepFailure, StepflowError,
};
use stepflow_test_utils::{code_reply, outputs_reply, with_fragment, ScriptedBackend, ScriptedSandbox};

fn controller_for(runner: AgentRunner, config: FlowConfig) -> FlowController {
    FlowController::new(Arc::new(runner), config, Arc::new(EventBus::default()))
}

/// Answers every step after a pause, recording how many were in flight at
/// once. Each step writes one output named after its description.
struct ConcurrencyGauge {
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl ConcurrencyGauge {
    fn new() -> Self {
        Self {
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }
}

impl ReasoningBackend for ConcurrencyGauge {
    fn respond(&self, _role: AgentRole, request: AgentRequest) -> BoxFuture<'_, Result<AgentReply>> {
        Box::pin(async move {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            self.active.fetch_sub(1, Ordering::SeqCst);

            let name = if request.description.is_empty() {
                "value"
            } else {
                request.description.as_str()
            };
            let mut outputs = serde_json::Map::new();
            outputs.insert(format!("{}_{}", name, request.step_id), json!(request.step_id));
            Ok(AgentReply::new(outputs_reply(Value::Object(outputs))))
        })
    }
}

fn gauge_step(id: &str, output: &str) -> NodeSpec {
    NodeSpec::new(id, AgentRole::Thinker)
        .with_description(output)
        .with_outputs(&[output])
}

#[tokio::test]
async fn test_disjoint_outputs_run_concurrently() {
    let gauge = Arc::new(ConcurrencyGauge::new());
    let controller = controller_for(AgentRunner::new(gauge.clone()), FlowConfig::default());

    let mut ctx = ExecutionContext::new("q");
    ctx.seed_plan(
        GraphFragment::new()
            .with_node(gauge_step("T1", "alpha"))
            .with_node(gauge_step("T2", "beta")),
    )
    .unwrap();
    let outcome = controller.run(&mut ctx).await.unwrap();

    assert_eq!(outcome.status, SessionStatus::Completed);
    assert_eq!(gauge.peak.load(Ordering::SeqCst), 2);
    assert_eq!(ctx.globals().get("alpha_T1").unwrap().value, json!("T1"));
    assert_eq!(ctx.globals().get("beta_T2").unwrap().value, json!("T2"));
}

#[tokio::test]
async fn test_overlapping_outputs_are_serialized() {
    let gauge = Arc::new(ConcurrencyGauge::new());
    let controller = controller_for(AgentRunner::new(gauge.clone()), FlowConfig::default());

    let mut ctx = ExecutionContext::new("q");
    ctx.seed_plan(
        GraphFragment::new()
            .with_node(gauge_step("T1", "value"))
            .with_node(gauge_step("T2", "value")),
    )
    .unwrap();
    let outcome = controller.run(&mut ctx).await.unwrap();

    assert_eq!(outcome.status, SessionStatus::Completed);
    assert_eq!(gauge.peak.load(Ordering::SeqCst), 1);
    assert!(ctx.globals().get("value_T1").is_some());
    assert!(ctx.globals().get("value_T2").is_some());
}

#[tokio::test]
async fn test_concurrency_limit_respected() {
    let gauge = Arc::new(ConcurrencyGauge::new());
    let config = FlowConfig {
        max_concurrency: 1,
        ..FlowConfig::default()
    };
    let controller = controller_for(AgentRunner::new(gauge.clone()), config);

    let mut ctx = ExecutionContext::new("q");
    ctx.seed_plan(
        GraphFragment::new()
            .with_node(NodeSpec::new("T1", AgentRole::Thinker))
            .with_node(NodeSpec::new("T2", AgentRole::Thinker))
            .with_node(NodeSpec::new("T3", AgentRole::Thinker)),
    )
    .unwrap();
    let outcome = controller.run(&mut ctx).await.unwrap();

    assert_eq!(outcome.completed, vec!["T1", "T2", "T3"]);
    assert_eq!(gauge.peak.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_canceled_step_fails_with_timeout() {
    let backend = ScriptedBackend::new()
        .reply("T1", outputs_reply(json!({"fast_T1": 1})))
        .hang("T2");
    let archive = Arc::new(SqliteArchive::in_memory().unwrap());
    let controller = controller_for(AgentRunner::new(Arc::new(backend)), FlowConfig::default())
        .with_archive(archive.clone());

    let mut ctx = ExecutionContext::new("q")
        .with_deadline(Utc::now() + chrono::Duration::milliseconds(300));
    ctx.seed_plan(
        GraphFragment::new()
            .with_node(NodeSpec::new("T1", AgentRole::Thinker))
            .with_node(NodeSpec::new("T2", AgentRole::Thinker))
            .with_node(NodeSpec::new("T3", AgentRole::Summarizer))
            .with_edge(PlanEdge::new("T2", "T3")),
    )
    .unwrap();

    let err = controller.run(&mut ctx).await.unwrap_err();
    assert!(matches!(err, StepflowError::Timeout(_)));
    assert_eq!(ctx.status(), SessionStatus::TimedOut);

    let canceled = ctx.graph().get("T2").unwrap();
    assert_eq!(canceled.status, NodeStatus::Failed);
    assert_eq!(canceled.last_error.as_ref().unwrap().kind, ErrorKind::Timeout);

    // The sibling's committed work is untouched.
    assert_eq!(ctx.graph().get("T1").unwrap().status, NodeStatus::Completed);
    assert_eq!(ctx.globals().get("fast_T1").unwrap().value, json!(1));
    assert_eq!(ctx.graph().get("T3").unwrap().status, NodeStatus::Pending);

    let saved = archive.load(&ctx.session_id().0).unwrap().unwrap();
    assert_eq!(saved.status, SessionStatus::TimedOut);
    let restored = ExecutionContext::restore(&saved.snapshot).unwrap();
    assert!(restored.failed_steps().contains_key("T2"));
}

#[tokio::test]
async fn test_cancel_token_stops_session() {
    let backend = ScriptedBackend::new().hang("T1");
    let controller = controller_for(AgentRunner::new(Arc::new(backend)), FlowConfig::default());
    let token = controller.cancel_token();

    let mut ctx = ExecutionContext::new("q");
    ctx.seed_plan(GraphFragment::new().with_node(NodeSpec::new("T1", AgentRole::Thinker)))
        .unwrap();

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();
    });
    let err = controller.run(&mut ctx).await.unwrap_err();
    assert!(err.to_string().contains("canceled"));
    assert_eq!(ctx.failed_steps()["T1"].kind, ErrorKind::Timeout);
}

fn sum_chain() -> GraphFragment {
    GraphFragment::new()
        .with_node(NodeSpec::new("A", AgentRole::Thinker).with_outputs(&["data"]))
        .with_node(
            NodeSpec::new("B", AgentRole::Thinker)
                .with_inputs(&["data"])
                .with_outputs(&["total"]),
        )
        .with_node(NodeSpec::new("C", AgentRole::Formatter).with_inputs(&["total_B"]))
        .with_edge(PlanEdge::new("A", "B"))
        .with_edge(PlanEdge::new("B", "C"))
        .with_final_step("C")
}

fn sum_chain_backend() -> ScriptedBackend {
    ScriptedBackend::new()
        .fail("A", "connection reset")
        .fail("A", "connection reset")
        .reply("A", outputs_reply(json!({"data_A": [1, 2, 3]})))
        .reply("B", outputs_reply(json!({"total_B": 6})))
        .reply("C", outputs_reply(json!({"answer_C": "six"})))
}

#[tokio::test]
async fn test_chain_ready_set_advances_one_step_at_a_time() {
    let backend = Arc::new(sum_chain_backend());
    let runner = AgentRunner::new(backend.clone());
    let mut ctx = ExecutionContext::new("sum the data");
    ctx.seed_plan(sum_chain()).unwrap();
    assert_eq!(ctx.ready_steps(), vec!["A"]);

    for attempt in 1..=2u32 {
        assert_eq!(ctx.mark_running("A").unwrap(), attempt);
        let err = runner.run(&ctx, "A").await.unwrap_err();
        assert!(err.is_retryable());
        ctx.apply_result(
            "A",
            StepOutcome::Failed(StepFailure::new(err.kind(), err.to_string(), attempt)),
        )
        .unwrap();
        assert!(ctx.ready_steps().is_empty());
        ctx.requeue("A").unwrap();
        assert_eq!(ctx.ready_steps(), vec!["A"]);
    }

    let expected: [(&str, Vec<&str>); 3] = [("A", vec!["B"]), ("B", vec!["C"]), ("C", vec![])];
    for (step, next) in expected {
        ctx.mark_running(step).unwrap();
        let result = runner.run(&ctx, step).await.unwrap();
        ctx.apply_result(step, StepOutcome::Succeeded(result)).unwrap();
        assert_eq!(ctx.ready_steps(), next, "ready set after {}", step);
    }

    assert_eq!(ctx.graph().get("A").unwrap().retry_count, 2);
    assert!(ctx.graph().is_resolved());
    assert_eq!(backend.calls_for("A"), 3);
}

#[tokio::test]
async fn test_chain_with_retried_first_step() {
    let backend = Arc::new(sum_chain_backend());
    let bus = Arc::new(EventBus::default());
    let mut rx = bus.subscribe();
    let controller = FlowController::new(
        Arc::new(AgentRunner::new(backend.clone())),
        FlowConfig::default(),
        bus,
    );

    let mut ctx = ExecutionContext::new("sum the data");
    ctx.seed_plan(sum_chain()).unwrap();

    let outcome = controller.run(&mut ctx).await.unwrap();

    assert_eq!(outcome.status, SessionStatus::Completed);
    assert_eq!(outcome.final_outputs["answer_C"], "six");
    assert_eq!(ctx.graph().get("A").unwrap().retry_count, 2);
    assert_eq!(backend.calls_for("A"), 3);
    assert_eq!(ctx.globals().get("total_B").unwrap().value, json!(6));

    // Each step saw exactly its predecessors finished when it was dispatched.
    let seen: Vec<(String, Vec<String>)> = backend
        .requests()
        .into_iter()
        .map(|r| (r.step_id, r.completed_steps))
        .collect();
    let expected: Vec<(String, Vec<String>)> = [
        ("A", vec![]),
        ("A", vec![]),
        ("A", vec![]),
        ("B", vec!["A"]),
        ("C", vec!["A", "B"]),
    ]
    .into_iter()
    .map(|(id, done)| (id.to_string(), done.into_iter().map(String::from).collect()))
    .collect();
    assert_eq!(seen, expected);

    let mut retries = 0;
    while let Ok(event) = rx.try_recv() {
        if let FlowEvent::StepFailed { step_id, will_retry, .. } = event {
            assert_eq!(step_id, "A");
            assert!(will_retry);
            retries += 1;
        }
    }
    assert_eq!(retries, 2);
}

#[tokio::test]
async fn test_variant_selection_counts_failed_variants() {
    let backend = ScriptedBackend::new().reply(
        "T1",
        code_reply(
            "T1",
            &[
                ("A", "raise NameError: rows"),
                ("B", "raise ZeroDivisionError"),
                ("C", r#"return {"rows_T1C": [4, 5]}"#),
            ],
        ),
    );
    let sandbox = Arc::new(ScriptedSandbox::new());
    let runner = AgentRunner::new(Arc::new(backend)).with_sandbox(sandbox.clone());
    let controller = controller_for(runner, FlowConfig::default());

    let mut ctx = ExecutionContext::new("q");
    ctx.seed_plan(
        GraphFragment::new().with_node(NodeSpec::new("T1", AgentRole::Coder).with_outputs(&["rows"])),
    )
    .unwrap();
    let outcome = controller.run(&mut ctx).await.unwrap();

    assert_eq!(outcome.status, SessionStatus::Completed);
    assert_eq!(outcome.final_outputs["rows_T1C"], json!([4, 5]));
    assert_eq!(ctx.graph().get("T1").unwrap().retry_count, 2);
    assert_eq!(sandbox.executed(), vec!["T1A", "T1B", "T1C"]);
}

#[tokio::test]
async fn test_fragment_extends_running_plan() {
    let backend = ScriptedBackend::new()
        .reply(
            "A",
            with_fragment(
                outputs_reply(json!({"idea_A": "split it"})),
                json!({
                    "nodes": [{"id": "X", "agent": "SummarizerAgent", "reads": ["idea"]}],
                    "edges": [{"source": "A", "target": "X"}]
                }),
            ),
        )
        .reply("X", outputs_reply(json!({"summary_X": "done"})));
    let controller = controller_for(AgentRunner::new(Arc::new(backend)), FlowConfig::default());

    let mut ctx = ExecutionContext::new("q");
    ctx.seed_plan(GraphFragment::new().with_node(NodeSpec::new("A", AgentRole::Thinker)))
        .unwrap();
    let outcome = controller.run(&mut ctx).await.unwrap();

    assert_eq!(outcome.status, SessionStatus::Completed);
    assert_eq!(outcome.completed, vec!["A", "X"]);
    assert_eq!(outcome.final_outputs["summary_X"], "done");
}

#[tokio::test]
async fn test_cycle_fragment_fails_step_and_keeps_graph() {
    let backend = ScriptedBackend::new().reply(
        "A",
        with_fragment(
            outputs_reply(json!({"idea_A": 1})),
            json!({"nodes": [], "edges": [{"source": "B", "target": "A"}]}),
        ),
    );
    let controller = controller_for(AgentRunner::new(Arc::new(backend)), FlowConfig::default());

    let mut ctx = ExecutionContext::new("q");
    ctx.seed_plan(
        GraphFragment::new()
            .with_node(NodeSpec::new("A", AgentRole::Thinker))
            .with_node(NodeSpec::new("B", AgentRole::Thinker))
            .with_edge(PlanEdge::new("A", "B")),
    )
    .unwrap();
    let edges_before = ctx.graph().edges();
    let outcome = controller.run(&mut ctx).await.unwrap();

    assert_eq!(outcome.status, SessionStatus::Failed);
    assert_eq!(ctx.graph().edges(), edges_before);
    assert_eq!(ctx.failed_steps()["A"].kind, ErrorKind::Cycle);
    assert!(ctx.globals().get("idea_A").is_none());
    assert_eq!(outcome.skipped, vec!["B"]);
}

#[tokio::test]
async fn test_step_ceiling_times_out() {
    let backend = ScriptedBackend::new()
        .reply("A", outputs_reply(json!({})))
        .reply("B", outputs_reply(json!({})));
    let config = FlowConfig {
        max_steps: 1,
        ..FlowConfig::default()
    };
    let controller = controller_for(AgentRunner::new(Arc::new(backend)), config);

    let mut ctx = ExecutionContext::new("q");
    ctx.seed_plan(
        GraphFragment::new()
            .with_node(NodeSpec::new("A", AgentRole::Thinker))
            .with_node(NodeSpec::new("B", AgentRole::Thinker))
            .with_edge(PlanEdge::new("A", "B")),
    )
    .unwrap();
    let err = controller.run(&mut ctx).await.unwrap_err();

    assert!(err.to_string().contains("ceiling"));
    assert_eq!(ctx.status(), SessionStatus::TimedOut);
    assert_eq!(ctx.graph().get("A").unwrap().status, NodeStatus::Completed);
    assert_eq!(ctx.graph().get("B").unwrap().status, NodeStatus::Pending);
}

#[tokio::test]
async fn test_ceiling_stopped_session_resumes() {
    let archive = Arc::new(SqliteArchive::in_memory().unwrap());
    let backend = Arc::new(
        ScriptedBackend::new()
            .reply("A", outputs_reply(json!({})))
            .reply("B", outputs_reply(json!({"done_B": true}))),
    );
    let config = FlowConfig {
        max_steps: 1,
        ..FlowConfig::default()
    };
    let controller =
        controller_for(AgentRunner::new(backend.clone()), config).with_archive(archive.clone());

    let mut ctx = ExecutionContext::new("q");
    ctx.seed_plan(
        GraphFragment::new()
            .with_node(NodeSpec::new("A", AgentRole::Thinker))
            .with_node(NodeSpec::new("B", AgentRole::Thinker))
            .with_edge(PlanEdge::new("A", "B")),
    )
    .unwrap();
    assert!(controller.run(&mut ctx).await.is_err());

    let saved = archive.load(&ctx.session_id().0).unwrap().unwrap();
    assert_eq!(saved.status, SessionStatus::TimedOut);
    let mut resumed = ExecutionContext::restore(&saved.snapshot).unwrap();
    assert_eq!(resumed.steps_dispatched(), 1);

    let outcome = controller.run(&mut resumed).await.unwrap();
    assert_eq!(outcome.status, SessionStatus::Completed);
    assert_eq!(outcome.steps_dispatched, 2);
    assert_eq!(outcome.final_outputs["done_B"], json!(true));
    assert_eq!(backend.calls_for("A"), 1);
    assert_eq!(backend.calls_for("B"), 1);
}

#[tokio::test]
async fn test_deadlock_reported_with_pending_steps() {
    let mut ctx = ExecutionContext::new("q");
    ctx.seed_plan(
        GraphFragment::new()
            .with_node(NodeSpec::new("A", AgentRole::Thinker))
            .with_node(NodeSpec::new("B", AgentRole::Thinker))
            .with_edge(PlanEdge::new("A", "B")),
    )
    .unwrap();

    // A snapshot whose graph says A finished but whose completed list
    // doesn't: B waits on A forever.
    let mut record: Value = serde_json::from_str(&ctx.snapshot().unwrap()).unwrap();
    for node in record["plan_graph"]["nodes"].as_array_mut().unwrap() {
        if node["id"] == "A" {
            node["status"] = json!("completed");
        }
    }
    let mut ctx = ExecutionContext::restore(&record.to_string()).unwrap();

    let controller = controller_for(
        AgentRunner::new(Arc::new(ScriptedBackend::new())),
        FlowConfig::default(),
    );
    let err = controller.run(&mut ctx).await.unwrap_err();

    match err {
        StepflowError::Deadlock { pending } => assert_eq!(pending, vec!["B"]),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(ctx.status(), SessionStatus::Deadlocked);
}

#[tokio::test]
async fn test_resume_reruns_only_unfinished_steps() {
    let archive = Arc::new(SqliteArchive::in_memory().unwrap());
    let first = ScriptedBackend::new()
        .reply("A", outputs_reply(json!({"idea_A": "x"})))
        .hang("B");
    let controller = controller_for(AgentRunner::new(Arc::new(first)), FlowConfig::default())
        .with_archive(archive.clone());

    let mut ctx = ExecutionContext::new("q")
        .with_deadline(Utc::now() + chrono::Duration::milliseconds(200));
    ctx.seed_plan(
        GraphFragment::new()
            .with_node(NodeSpec::new("A", AgentRole::Thinker))
            .with_node(NodeSpec::new("B", AgentRole::Thinker).with_max_retries(2))
            .with_edge(PlanEdge::new("A", "B")),
    )
    .unwrap();
    assert!(controller.run(&mut ctx).await.is_err());

    let saved = archive.load(&ctx.session_id().0).unwrap().unwrap();
    let mut resumed = ExecutionContext::restore(&saved.snapshot).unwrap();
    resumed.set_deadline(None);
    assert_eq!(resumed.graph().get("B").unwrap().status, NodeStatus::Failed);

    // A timed-out step goes back to pending for another attempt.
    resumed.requeue("B").unwrap();

    let second = Arc::new(ScriptedBackend::new().reply("B", outputs_reply(json!({"done_B": true}))));
    let controller = controller_for(AgentRunner::new(second.clone()), FlowConfig::default());
    let outcome = controller.run(&mut resumed).await.unwrap();

    assert_eq!(outcome.status, SessionStatus::Completed);
    assert_eq!(second.calls_for("A"), 0);
    assert_eq!(second.calls_for("B"), 1);
}
