//! Scheduler tests.
//!
//! Every test runs against an in-memory SQLite database and `MockAgent`
//! doubles registered in a real `AgentRegistry`, so the full
//! dispatch → persist → status path is exercised.

use std::sync::atomic::{AtomicUsize, Ordering};

use agents::mock::MockAgent;
use agents::{Agent, AgentRegistration, AgentRegistry};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;

use super::*;
use crate::dag::validate_steps;
use crate::models::{HandoffDraft, HandoffType, RetryPolicy};

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

struct Harness {
    scheduler: Scheduler,
    registry: Arc<AgentRegistry>,
    handoffs: HandoffCatalog,
}

impl Harness {
    async fn new() -> Self {
        Self::with_config(EngineConfig::default()).await
    }

    async fn with_config(config: EngineConfig) -> Self {
        let pool = db::pool::migrated_memory_pool().await.unwrap();
        let storage = Storage::with_ttl_cache(pool.clone(), Duration::from_secs(60));
        let registry = Arc::new(AgentRegistry::new());
        let handoffs = HandoffCatalog::new(pool);
        let scheduler = Scheduler::new(storage, registry.clone(), handoffs.clone(), config);
        Self { scheduler, registry, handoffs }
    }

    fn register(&self, id: &str, agent: MockAgent) -> Arc<MockAgent> {
        let agent = Arc::new(agent);
        self.registry.register_agent(AgentRegistration::new(id), agent.clone());
        agent
    }

    async fn run(&self, workflow: WorkflowDefinition, input: Value) -> Execution {
        self.run_with(workflow, input, ExecuteOptions::default()).await
    }

    async fn run_with(&self, workflow: WorkflowDefinition, input: Value, options: ExecuteOptions) -> Execution {
        let started = self.scheduler.execute(workflow, input, options).await.unwrap();
        self.scheduler.wait(started.id).await.unwrap()
    }
}

fn workflow(steps: Vec<StepDefinition>) -> WorkflowDefinition {
    validate_steps(&steps).expect("test workflow must be valid");
    let now = Utc::now();
    WorkflowDefinition {
        id: Uuid::new_v4(),
        name: "test".into(),
        description: String::new(),
        version: 1,
        tags: Default::default(),
        metadata: Default::default(),
        required_inputs: Vec::new(),
        steps,
        created_at: now,
        updated_at: now,
    }
}

fn fast_retries(max_retries: u32) -> RetryPolicy {
    RetryPolicy {
        max_retries,
        backoff_factor: 2.0,
        initial_delay_ms: 1,
    }
}

fn step<'a>(exec: &'a Execution, id: &str) -> &'a StepResult {
    exec.step(id).unwrap_or_else(|| panic!("no step '{id}'"))
}

/// Tracks how many calls are in flight at once.
#[derive(Default)]
struct Gauge {
    current: AtomicUsize,
    peak: AtomicUsize,
}

#[async_trait]
impl Agent for Gauge {
    async fn handle(&self, _input: Value, _ctx: &InvocationContext) -> Result<Value, AgentError> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(30)).await;
        self.current.fetch_sub(1, Ordering::SeqCst);
        Ok(json!({}))
    }
}

// ============================================================
// Ordering and data flow
// ============================================================

#[tokio::test]
async fn linear_chain_passes_outputs_downstream() {
    let h = Harness::new().await;
    h.register(
        "double",
        MockAgent::from_fn("double", |input| {
            Ok(json!({ "value": input["value"].as_i64().unwrap_or_default() * 2 }))
        }),
    );

    let wf = workflow(vec![
        StepDefinition::new("a", "double").input("value", "input.n"),
        StepDefinition::new("b", "double").depends_on(["a"]).input("value", "steps.a.value"),
        StepDefinition::new("c", "double")
            .depends_on(["b"])
            .input("value", "steps.b.value")
            .output("final", "output.value"),
    ]);

    let exec = h.run(wf, json!({ "n": 3 })).await;

    assert_eq!(exec.status, ExecutionStatus::Completed);
    assert_eq!(exec.dispatch_order, vec!["a", "b", "c"]);
    assert_eq!(exec.outputs["a"], json!({ "value": 6 }));
    assert_eq!(exec.outputs["final"], json!(24));
    assert!(!exec.outputs.contains_key("c"));

    let result = h.scheduler.get_result(exec.id).await.unwrap();
    assert_eq!(result.outputs, exec.outputs);
}

#[tokio::test]
async fn independent_branches_run_concurrently() {
    let h = Harness::new().await;
    h.register("fast", MockAgent::returning("fast", json!({})));
    h.register("slow", MockAgent::returning("slow", json!({})).with_delay(Duration::from_millis(60)));

    let wf = workflow(vec![
        StepDefinition::new("root", "fast"),
        StepDefinition::new("left", "slow").depends_on(["root"]),
        StepDefinition::new("right", "slow").depends_on(["root"]),
        StepDefinition::new("join", "fast").depends_on(["left", "right"]),
    ]);

    let exec = h.run(wf, json!({})).await;

    assert_eq!(exec.status, ExecutionStatus::Completed);
    assert_eq!(exec.dispatch_order, vec!["root", "left", "right", "join"]);

    let (left, right, join) = (step(&exec, "left"), step(&exec, "right"), step(&exec, "join"));
    assert!(right.started_at.unwrap() < left.finished_at.unwrap(), "branches overlapped");
    assert!(join.started_at.unwrap() >= left.finished_at.unwrap());
    assert!(join.started_at.unwrap() >= right.finished_at.unwrap());
}

#[tokio::test]
async fn fan_out_completes_when_the_later_branch_returns_first() {
    let h = Harness::new().await;
    h.register("fast", MockAgent::returning("fast", json!({ "from": "fast" })));
    h.register(
        "slow",
        MockAgent::returning("slow", json!({ "from": "slow" })).with_delay(Duration::from_millis(50)),
    );

    // `b` is declared (and dispatched) before `c`, but `c` answers first.
    let wf = workflow(vec![
        StepDefinition::new("a", "fast"),
        StepDefinition::new("b", "slow").depends_on(["a"]),
        StepDefinition::new("c", "fast").depends_on(["a"]),
    ]);
    let exec = h.run(wf, json!({})).await;

    assert_eq!(exec.status, ExecutionStatus::Completed);
    assert_eq!(exec.dispatch_order, vec!["a", "b", "c"]);
    let (b, c) = (step(&exec, "b"), step(&exec, "c"));
    assert_eq!(b.status, StepStatus::Succeeded);
    assert_eq!(c.status, StepStatus::Succeeded);
    assert!(c.finished_at.unwrap() < b.finished_at.unwrap(), "c should finish first");
    assert_eq!(exec.outputs["b"], json!({ "from": "slow" }));
    assert_eq!(exec.outputs["c"], json!({ "from": "fast" }));
}

#[tokio::test]
async fn concurrency_bound_limits_agent_calls() {
    let h = Harness::with_config(EngineConfig {
        max_concurrent_steps: Some(1),
        ..EngineConfig::default()
    })
    .await;
    let gauge = Arc::new(Gauge::default());
    h.registry.register_agent(AgentRegistration::new("gauge"), gauge.clone());

    let wf = workflow(vec![
        StepDefinition::new("a", "gauge"),
        StepDefinition::new("b", "gauge"),
        StepDefinition::new("c", "gauge"),
    ]);
    let exec = h.run(wf, json!({})).await;

    assert_eq!(exec.status, ExecutionStatus::Completed);
    assert_eq!(gauge.peak.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn empty_input_mapping_receives_whole_input() {
    let h = Harness::new().await;
    let echo = h.register("echo", MockAgent::from_fn("echo", |input| Ok(input.clone())));

    let wf = workflow(vec![StepDefinition::new("only", "echo")]);
    let exec = h.run(wf, json!({ "q": "hello" })).await;

    assert_eq!(echo.inputs(), vec![json!({ "q": "hello" })]);
    assert_eq!(exec.outputs["only"], json!({ "q": "hello" }));
}

// ============================================================
// Input contract
// ============================================================

#[tokio::test]
async fn missing_required_input_creates_nothing() {
    let h = Harness::new().await;
    let mut wf = workflow(vec![StepDefinition::new("a", "echo")]);
    wf.required_inputs = vec!["customer_id".into()];
    let wf_id = wf.id;

    let err = h
        .scheduler
        .execute(wf.clone(), json!({ "other": 1 }), ExecuteOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidInput(ref m) if m.contains("customer_id")));

    let err = h
        .scheduler
        .execute(wf, json!([1, 2]), ExecuteOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidInput);

    let page = h.scheduler.list_executions(wf_id, None, 20).await.unwrap();
    assert!(page.items.is_empty());
}

// ============================================================
// Failure handling
// ============================================================

#[tokio::test]
async fn transient_failures_are_retried_until_success() {
    let h = Harness::new().await;
    let flaky = h.register("flaky", MockAgent::flaky("flaky", 2, json!({ "ok": true })));

    let wf = workflow(vec![StepDefinition::new("a", "echo").retry(fast_retries(2))]);
    let exec = h.run(wf, json!({})).await;

    assert_eq!(exec.status, ExecutionStatus::Completed);
    let a = step(&exec, "a");
    assert_eq!(a.status, StepStatus::Succeeded);
    assert_eq!(a.attempts, 3);
    assert_eq!(flaky.call_count(), 3);
    assert!(a.error.is_none());
}

#[tokio::test]
async fn exhausted_retries_fail_the_step_and_skip_dependents() {
    let h = Harness::new().await;
    let broken = h.register("broken", MockAgent::failing("broken", "upstream 503"));
    let never = h.register("never", MockAgent::returning("never", json!({})));

    let wf = workflow(vec![
        StepDefinition::new("a", "broken").retry(fast_retries(2)),
        StepDefinition::new("b", "never").depends_on(["a"]),
        StepDefinition::new("c", "never").depends_on(["b"]),
        StepDefinition::new("side", "never"),
    ]);
    let exec = h.run(wf, json!({})).await;

    assert_eq!(exec.status, ExecutionStatus::Failed);
    assert_eq!(broken.call_count(), 3);

    let a = step(&exec, "a");
    assert_eq!(a.status, StepStatus::Failed);
    assert_eq!(a.error.as_ref().unwrap().kind, ErrorCode::AgentError);
    for id in ["b", "c"] {
        assert_eq!(step(&exec, id).skip_reason, Some(SkipReason::UpstreamFailed), "{id}");
    }
    assert_eq!(step(&exec, "side").status, StepStatus::Succeeded);
    assert_eq!(never.call_count(), 1);
    assert_eq!(exec.error.as_ref().unwrap().kind, ErrorCode::AgentError);
}

#[tokio::test]
async fn fatal_error_skips_retries_and_uses_fallback() {
    let h = Harness::new().await;
    let primary = h.register("primary", MockAgent::failing_fatal("primary", "bad credentials"));
    let backup = h.register("backup", MockAgent::returning("backup", json!({ "source": "backup" })));

    let wf = workflow(vec![StepDefinition::new("a", "primary")
        .retry(fast_retries(5))
        .fallback("backup")]);
    let exec = h.run(wf, json!({})).await;

    assert_eq!(exec.status, ExecutionStatus::Completed);
    let a = step(&exec, "a");
    assert_eq!(a.status, StepStatus::Succeeded);
    assert!(a.used_fallback);
    assert_eq!(a.agent_id, "backup");
    assert_eq!(primary.call_count(), 1);
    assert_eq!(backup.call_count(), 1);
    assert_eq!(exec.outputs["a"], json!({ "source": "backup" }));
}

#[tokio::test]
async fn unknown_agent_goes_to_fallback_which_gets_one_attempt() {
    let h = Harness::new().await;
    let backup = h.register("backup", MockAgent::failing("backup", "also down"));

    let wf = workflow(vec![StepDefinition::new("a", "ghost")
        .retry(fast_retries(3))
        .fallback("backup")]);
    let exec = h.run(wf, json!({})).await;

    assert_eq!(exec.status, ExecutionStatus::Failed);
    let a = step(&exec, "a");
    assert_eq!(a.attempts, 2);
    assert!(a.used_fallback);
    assert_eq!(backup.call_count(), 1);
}

#[tokio::test]
async fn step_timeout_is_reported_as_timeout() {
    let h = Harness::new().await;
    h.register("sleepy", MockAgent::returning("sleepy", json!({})).with_delay(Duration::from_millis(500)));

    let wf = workflow(vec![StepDefinition::new("a", "sleepy").timeout(Duration::from_millis(20))]);
    let exec = h.run(wf, json!({})).await;

    assert_eq!(exec.status, ExecutionStatus::Failed);
    let a = step(&exec, "a");
    assert_eq!(a.status, StepStatus::Failed);
    assert_eq!(a.error.as_ref().unwrap().kind, ErrorCode::Timeout);
}

#[tokio::test]
async fn unresolvable_input_mapping_fails_the_step() {
    let h = Harness::new().await;
    let agent = h.register("echo", MockAgent::returning("echo", json!({})));

    let wf = workflow(vec![StepDefinition::new("a", "echo").input("x", "input.missing")]);
    let exec = h.run(wf, json!({})).await;

    assert_eq!(exec.status, ExecutionStatus::Failed);
    assert_eq!(step(&exec, "a").error.as_ref().unwrap().kind, ErrorCode::MappingError);
    assert_eq!(step(&exec, "a").attempts, 1);
    assert_eq!(agent.call_count(), 0);
}

#[tokio::test]
async fn mapping_errors_are_retried_until_the_reference_resolves() {
    let h = Harness::new().await;
    h.register(
        "producer",
        MockAgent::returning("producer", json!({ "t": "abc" })).with_delay(Duration::from_millis(30)),
    );
    let consumer = h.register("consumer", MockAgent::from_fn("consumer", |input| Ok(input.clone())));

    // `reader` does not depend on `late`; it reads a workflow output that
    // only exists once `late` has finished.
    let wf = workflow(vec![
        StepDefinition::new("late", "producer").output("token", "output.t"),
        StepDefinition::new("reader", "consumer")
            .input("t", "outputs.token")
            .retry(RetryPolicy {
                max_retries: 3,
                backoff_factor: 2.0,
                initial_delay_ms: 20,
            }),
    ]);
    let exec = h.run(wf, json!({})).await;

    assert_eq!(exec.status, ExecutionStatus::Completed);
    let reader = step(&exec, "reader");
    assert_eq!(reader.status, StepStatus::Succeeded);
    assert!(reader.attempts >= 2, "attempts = {}", reader.attempts);
    assert_eq!(consumer.call_count(), 1);
    assert_eq!(consumer.inputs(), vec![json!({ "t": "abc" })]);
}

#[tokio::test]
async fn mapping_errors_exhaust_retries_then_fall_back() {
    let h = Harness::new().await;
    let primary = h.register("primary", MockAgent::returning("primary", json!({})));
    let backup = h.register("backup", MockAgent::returning("backup", json!({})));

    let wf = workflow(vec![StepDefinition::new("a", "primary")
        .input("x", "input.missing")
        .retry(fast_retries(2))
        .fallback("backup")]);
    let exec = h.run(wf, json!({})).await;

    assert_eq!(exec.status, ExecutionStatus::Failed);
    let a = step(&exec, "a");
    // Three mapped attempts for the primary, one for the fallback.
    assert_eq!(a.attempts, 4);
    assert!(a.used_fallback);
    assert_eq!(a.error.as_ref().unwrap().kind, ErrorCode::MappingError);
    assert_eq!(primary.call_count() + backup.call_count(), 0);
}

#[tokio::test]
async fn output_mapping_errors_retry_the_agent_call() {
    let h = Harness::new().await;
    let agent = h.register("echo", MockAgent::returning("echo", json!({ "v": 1 })));

    let wf = workflow(vec![StepDefinition::new("a", "echo")
        .output("v", "output.absent")
        .retry(fast_retries(1))]);
    let exec = h.run(wf, json!({})).await;

    assert_eq!(exec.status, ExecutionStatus::Failed);
    assert_eq!(step(&exec, "a").attempts, 2);
    assert_eq!(step(&exec, "a").error.as_ref().unwrap().kind, ErrorCode::MappingError);
    assert_eq!(agent.call_count(), 2);
}

// ============================================================
// Conditions
// ============================================================

#[tokio::test]
async fn false_condition_skips_step_without_blocking_dependents() {
    let h = Harness::new().await;
    let agent = h.register("echo", MockAgent::returning("echo", json!({ "score": 0.2 })));

    let wf = workflow(vec![
        StepDefinition::new("score", "echo"),
        StepDefinition::new("escalate", "echo")
            .depends_on(["score"])
            .when("steps.score.score > 0.5"),
        StepDefinition::new("report", "echo").depends_on(["escalate"]),
        StepDefinition::new("garbled", "echo").when("not a condition"),
    ]);
    let exec = h.run(wf, json!({})).await;

    assert_eq!(exec.status, ExecutionStatus::Completed);
    assert_eq!(step(&exec, "escalate").skip_reason, Some(SkipReason::ConditionFalse));
    assert_eq!(step(&exec, "garbled").skip_reason, Some(SkipReason::ConditionFalse));
    assert_eq!(step(&exec, "report").status, StepStatus::Succeeded);
    assert_eq!(agent.call_count(), 2);
}

// ============================================================
// Cancellation and deadlines
// ============================================================

#[tokio::test]
async fn cancel_is_immediate_idempotent_and_discards_late_results() {
    let h = Harness::new().await;
    let slow = h.register("slow", MockAgent::returning("slow", json!({})).with_delay(Duration::from_millis(200)));

    let wf = workflow(vec![
        StepDefinition::new("a", "slow"),
        StepDefinition::new("b", "slow").depends_on(["a"]),
    ]);
    let started = h.scheduler.execute(wf, json!({}), ExecuteOptions::default()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;

    assert!(matches!(
        h.scheduler.get_result(started.id).await,
        Err(EngineError::NotReady(_))
    ));

    let cancelled = h.scheduler.cancel(started.id).await.unwrap();
    assert_eq!(cancelled.status, ExecutionStatus::Cancelled);
    assert!(cancelled
        .steps
        .iter()
        .all(|s| s.skip_reason == Some(SkipReason::Cancelled)));

    let again = h.scheduler.cancel(started.id).await.unwrap();
    assert_eq!(again.status, ExecutionStatus::Cancelled);
    assert_eq!(again.finished_at, cancelled.finished_at);

    let waited = h.scheduler.wait(started.id).await.unwrap();
    assert_eq!(waited.status, ExecutionStatus::Cancelled);

    tokio::time::sleep(Duration::from_millis(300)).await;
    let settled = h.scheduler.get_status(started.id).await.unwrap();
    assert_eq!(settled.status, ExecutionStatus::Cancelled);
    assert_eq!(step(&settled, "a").status, StepStatus::Skipped);
    assert_eq!(slow.call_count(), 1);
    assert_eq!(h.scheduler.active_count(), 0);
}

#[tokio::test]
async fn cancel_of_unknown_execution_is_not_found() {
    let h = Harness::new().await;
    assert!(matches!(
        h.scheduler.cancel(Uuid::new_v4()).await,
        Err(EngineError::NotFound { .. })
    ));
}

#[tokio::test]
async fn execution_deadline_fails_running_and_skips_the_rest() {
    let h = Harness::new().await;
    h.register("slow", MockAgent::returning("slow", json!({})).with_delay(Duration::from_millis(500)));

    let wf = workflow(vec![
        StepDefinition::new("a", "slow"),
        StepDefinition::new("b", "slow").depends_on(["a"]),
    ]);
    let options = ExecuteOptions {
        timeout_ms: Some(40),
        ..ExecuteOptions::default()
    };
    let exec = h.run_with(wf, json!({}), options).await;

    assert_eq!(exec.status, ExecutionStatus::Failed);
    assert_eq!(exec.error.as_ref().unwrap().kind, ErrorCode::Timeout);
    assert_eq!(step(&exec, "a").error.as_ref().unwrap().kind, ErrorCode::Timeout);
    assert_eq!(step(&exec, "b").skip_reason, Some(SkipReason::TimedOut));
}

// ============================================================
// Handoffs
// ============================================================

#[tokio::test]
async fn firing_handoff_spawns_a_dynamic_step() {
    let h = Harness::new().await;
    h.register("triage", MockAgent::returning("triage", json!({ "topic": "billing", "ticket": 7 })));
    let billing = h.register("billing", MockAgent::from_fn("billing", |input| Ok(json!({ "handled": input["ticket"] }))));
    let tech = h.register("tech", MockAgent::returning("tech", json!({})));

    h.handoffs
        .register(
            HandoffDraft::new("triage", "billing", HandoffType::Conditional)
                .when(r#"output.topic == "billing""#)
                .map("ticket", "output.ticket"),
        )
        .await
        .unwrap();
    h.handoffs
        .register(HandoffDraft::new("triage", "tech", HandoffType::Conditional).when(r#"output.topic == "tech""#))
        .await
        .unwrap();

    let exec = h.run(workflow(vec![StepDefinition::new("triage", "triage")]), json!({})).await;

    assert_eq!(exec.status, ExecutionStatus::Completed);
    assert_eq!(exec.spawned_steps.len(), 1);
    let spawned = step(&exec, "triage->billing");
    assert_eq!(spawned.status, StepStatus::Succeeded);
    assert!(matches!(spawned.origin, crate::execution::StepOrigin::Handoff { depth: 1, .. }));
    assert_eq!(exec.outputs["triage->billing"], json!({ "handled": 7 }));
    assert_eq!(billing.inputs(), vec![json!({ "ticket": 7 })]);
    assert_eq!(tech.call_count(), 0);
}

#[tokio::test]
async fn handoff_chains_stop_at_max_depth() {
    let h = Harness::with_config(EngineConfig {
        max_handoff_depth: 2,
        ..EngineConfig::default()
    })
    .await;
    let looping = h.register("loop", MockAgent::returning("loop", json!({ "again": true })));
    h.handoffs
        .register(HandoffDraft::new("loop", "loop", HandoffType::Parallel))
        .await
        .unwrap();

    let exec = h.run(workflow(vec![StepDefinition::new("start", "loop")]), json!({})).await;

    assert_eq!(exec.status, ExecutionStatus::Completed);
    assert_eq!(exec.steps.len(), 3);
    assert_eq!(looping.call_count(), 3);
}

// ============================================================
// Status and listing
// ============================================================

#[tokio::test]
async fn status_is_readable_while_running_and_listed_afterwards() {
    let h = Harness::new().await;
    h.register("slow", MockAgent::returning("slow", json!({})).with_delay(Duration::from_millis(80)));

    let wf = workflow(vec![StepDefinition::new("a", "slow")]);
    let wf_id = wf.id;
    let started = h.scheduler.execute(wf, json!({}), ExecuteOptions::default()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let live = h.scheduler.get_status(started.id).await.unwrap();
    assert_eq!(live.status, ExecutionStatus::Running);
    assert_eq!(step(&live, "a").status, StepStatus::Running);

    let done = h.scheduler.wait(started.id).await.unwrap();
    assert_eq!(done.status, ExecutionStatus::Completed);

    let page = h.scheduler.list_executions(wf_id, None, 20).await.unwrap();
    assert_eq!(page.items.len(), 1);
    assert_eq!(page.items[0].id, started.id);
}
