//! Scheduler / dispatcher.
//!
//! `Scheduler` owns every in-flight execution of this process:
//! 1. `execute` checks the input contract, persists a `pending` execution
//!    and spawns one tokio task that drives it.
//! 2. The driver claims the execution (`running`) and repeatedly resolves
//!    readiness: steps whose dependencies all succeeded (or were skipped by
//!    their own condition) are dispatched, in insertion order, to the agent
//!    port. Steps behind a failed dependency are skipped.
//! 3. Agent calls run concurrently in a `JoinSet`; results are applied in
//!    completion order under the execution's mutex, and every state change
//!    is persisted.
//! 4. Failures are retried with exponential backoff, then handed to the
//!    fallback agent for a single attempt, then marked failed.
//! 5. Successful steps feed the handoff resolver, which may append dynamic
//!    steps to the execution.
//!
//! Cancellation and the execution deadline stop the driver immediately;
//! results that arrive afterwards are discarded.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use agents::{AgentError, AgentPort, InvocationContext};
use dashmap::DashMap;
use db::{repository::executions as exec_repo, DbError, Page, Storage};
use serde_json::Value;
use tokio::sync::{watch, Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::{
    condition,
    config::EngineConfig,
    error::{agent_error_code, ErrorCode},
    execution::{
        ErrorDetail, ExecuteOptions, Execution, ExecutionResult, ExecutionStatus, SkipReason,
        StepResult, StepStatus,
    },
    handoff::{plan_dynamic_steps, resolve_handoffs, HandoffCatalog},
    mapping::{build_step_input, map_step_output, MappingContext},
    models::{StepDefinition, WorkflowDefinition},
    EngineError,
};

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

/// Handle on an execution driven by this process.
struct ActiveRun {
    state: Arc<Mutex<Execution>>,
    cancel: CancellationToken,
    done: watch::Receiver<bool>,
}

struct Inner {
    storage: Storage,
    agents: Arc<dyn AgentPort>,
    handoffs: HandoffCatalog,
    config: EngineConfig,
    /// Global bound on agent calls in flight.
    permits: Option<Arc<Semaphore>>,
    active: DashMap<Uuid, ActiveRun>,
}

/// Messages from spawned work back to an execution's driver.
#[derive(Debug)]
enum StepEvent {
    Finished {
        step_id: String,
        attempt: u32,
        outcome: Result<Value, AgentError>,
    },
    RetryDue {
        step_id: String,
    },
}

#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    pub fn new(
        storage: Storage,
        agents: Arc<dyn AgentPort>,
        handoffs: HandoffCatalog,
        config: EngineConfig,
    ) -> Self {
        let permits = config
            .max_concurrent_steps
            .map(|n| Arc::new(Semaphore::new(n.max(1))));
        Self {
            inner: Arc::new(Inner {
                storage,
                agents,
                handoffs,
                config,
                permits,
                active: DashMap::new(),
            }),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Start an execution of `workflow` and return its initial snapshot.
    ///
    /// # Errors
    /// [`EngineError::InvalidInput`] when `input` is not an object or lacks a
    /// required field; nothing is created in that case.
    #[instrument(skip(self, workflow, input, options), fields(workflow_id = %workflow.id, version = workflow.version))]
    pub async fn execute(
        &self,
        workflow: WorkflowDefinition,
        input: Value,
        options: ExecuteOptions,
    ) -> Result<Execution, EngineError> {
        check_input(&workflow, &input)?;

        let mut exec = Execution::new(&workflow, input, &options);
        persist(&self.inner.storage, &mut exec).await?;

        let id = exec.id;
        let state = Arc::new(Mutex::new(exec.clone()));
        let cancel = CancellationToken::new();
        let (done_tx, done_rx) = watch::channel(false);
        self.inner.active.insert(
            id,
            ActiveRun {
                state: state.clone(),
                cancel: cancel.clone(),
                done: done_rx,
            },
        );

        let run = Run {
            inner: self.inner.clone(),
            workflow: Arc::new(workflow),
            state,
            cancel,
        };
        let guard = ActiveGuard {
            inner: self.inner.clone(),
            id,
            done: done_tx,
        };
        tokio::spawn(async move {
            let _guard = guard;
            if let Err(e) = run.drive().await {
                error!(execution_id = %id, error = %e, "execution aborted");
                run.abandon(ErrorDetail::from(&e), SkipReason::Cancelled).await;
            }
        });

        info!("execution '{}' submitted", id);
        Ok(exec)
    }

    /// Current snapshot. Reads the fast-state cache first and never waits
    /// on a running driver.
    pub async fn get_status(&self, execution_id: Uuid) -> Result<Execution, EngineError> {
        match self.inner.storage.load_execution(&execution_id.to_string()).await {
            Ok(row) => Execution::from_row(&row),
            Err(DbError::NotFound) => Err(EngineError::not_found("execution", execution_id)),
            Err(e) => Err(e.into()),
        }
    }

    /// Final outputs; [`EngineError::NotReady`] while the execution is live.
    pub async fn get_result(&self, execution_id: Uuid) -> Result<ExecutionResult, EngineError> {
        self.get_status(execution_id).await?.result()
    }

    /// Cancel an execution. Idempotent: a finished execution is returned
    /// unchanged.
    #[instrument(skip(self))]
    pub async fn cancel(&self, execution_id: Uuid) -> Result<Execution, EngineError> {
        let handle = self
            .inner
            .active
            .get(&execution_id)
            .map(|run| (run.state.clone(), run.cancel.clone()));

        let Some((state, token)) = handle else {
            // Not driven here: either finished, or orphaned by a restart.
            let mut exec = self.get_status(execution_id).await?;
            if exec.cancel()? {
                persist(&self.inner.storage, &mut exec).await?;
                info!("orphaned execution '{}' cancelled", execution_id);
            }
            return Ok(exec);
        };

        let mut exec = state.lock().await;
        if exec.cancel()? {
            persist(&self.inner.storage, &mut exec).await?;
            token.cancel();
            info!("execution '{}' cancelled", execution_id);
        } else {
            debug!("execution '{}' already {}", execution_id, exec.status);
        }
        Ok(exec.clone())
    }

    /// Wait for an execution driven by this process to finish and return
    /// its final snapshot.
    pub async fn wait(&self, execution_id: Uuid) -> Result<Execution, EngineError> {
        let done = self
            .inner
            .active
            .get(&execution_id)
            .map(|run| run.done.clone());

        if let Some(mut done) = done {
            // A dropped sender also means the driver is gone.
            let _ = done.wait_for(|finished| *finished).await;
        }
        self.get_status(execution_id).await
    }

    /// Page through the executions of one workflow, oldest first.
    pub async fn list_executions(
        &self,
        workflow_id: Uuid,
        cursor: Option<&str>,
        limit: i64,
    ) -> Result<Page<Execution>, EngineError> {
        let page = exec_repo::list_executions_for_workflow(
            self.inner.storage.pool(),
            &workflow_id.to_string(),
            cursor,
            limit,
        )
        .await?;
        let items = page
            .items
            .iter()
            .map(Execution::from_row)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Page { items, next_cursor: page.next_cursor })
    }

    /// Number of executions currently driven by this process.
    pub fn active_count(&self) -> usize {
        self.inner.active.len()
    }
}

/// Removes the run from the active map and wakes waiters, even if the
/// driver panicked.
struct ActiveGuard {
    inner: Arc<Inner>,
    id: Uuid,
    done: watch::Sender<bool>,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.inner.active.remove(&self.id);
        let _ = self.done.send(true);
    }
}

fn check_input(workflow: &WorkflowDefinition, input: &Value) -> Result<(), EngineError> {
    let Some(fields) = input.as_object() else {
        return Err(EngineError::InvalidInput("execution input must be a JSON object".into()));
    };
    let missing: Vec<&str> = workflow
        .required_inputs
        .iter()
        .filter(|f| !fields.contains_key(f.as_str()))
        .map(String::as_str)
        .collect();
    if !missing.is_empty() {
        return Err(EngineError::InvalidInput(format!(
            "missing required input field(s): {}",
            missing.join(", ")
        )));
    }
    Ok(())
}

async fn persist(storage: &Storage, exec: &mut Execution) -> Result<(), EngineError> {
    exec.updated_at = chrono::Utc::now();
    storage.save_execution(&exec.to_row()?).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Per-execution driver
// ---------------------------------------------------------------------------

enum Readiness {
    /// Some dependency has not finished yet.
    Blocked,
    /// Some dependency failed.
    Doomed,
    ConditionFalse,
    Ready,
}

struct Run {
    inner: Arc<Inner>,
    workflow: Arc<WorkflowDefinition>,
    state: Arc<Mutex<Execution>>,
    cancel: CancellationToken,
}

impl Run {
    #[instrument(skip(self), fields(workflow_id = %self.workflow.id))]
    async fn drive(&self) -> Result<(), EngineError> {
        let deadline = {
            let mut exec = self.state.lock().await;
            if exec.status.is_terminal() {
                return Ok(());
            }
            exec.transition(ExecutionStatus::Running)?;
            persist(&self.inner.storage, &mut exec).await?;
            info!(
                "execution '{}' running ({} steps)",
                exec.id,
                exec.steps.len()
            );
            exec.timeout_ms
                .map(|ms| Instant::now() + Duration::from_millis(ms))
        };

        let mut tasks: JoinSet<StepEvent> = JoinSet::new();

        loop {
            if self.advance(&mut tasks).await? {
                break;
            }
            if tasks.is_empty() {
                return Err(EngineError::Internal(
                    "scheduler stalled with no work in flight".into(),
                ));
            }

            let expiry = async {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    debug!("driver stopping after cancellation");
                    break;
                }
                _ = expiry => {
                    warn!("execution deadline exceeded");
                    self.abandon(
                        ErrorDetail::new(ErrorCode::Timeout, "execution deadline exceeded"),
                        SkipReason::TimedOut,
                    )
                    .await;
                    break;
                }
                Some(joined) = tasks.join_next() => {
                    let event = joined
                        .map_err(|e| EngineError::Internal(format!("step task failed: {e}")))?;
                    self.handle(event, &mut tasks).await?;
                }
            }
        }

        // In-flight calls may still finish; nobody listens any more.
        tasks.abort_all();
        Ok(())
    }

    /// Resolve readiness until nothing changes. Returns `true` once the
    /// execution is terminal.
    async fn advance(&self, tasks: &mut JoinSet<StepEvent>) -> Result<bool, EngineError> {
        let mut guard = self.state.lock().await;
        let exec = &mut *guard;
        if exec.status.is_terminal() {
            return Ok(true);
        }

        let mut dirty = false;
        loop {
            let mut progressed = false;
            for idx in 0..exec.steps.len() {
                let step = &exec.steps[idx];
                if step.status != StepStatus::Waiting || step.retry_at.is_some() {
                    continue;
                }
                let def = self.definition(exec, &step.step_id)?;

                match readiness(exec, &def) {
                    Readiness::Blocked => continue,
                    Readiness::Doomed => {
                        debug!("step '{}' skipped: upstream failed", def.id);
                        exec.steps[idx].skip(SkipReason::UpstreamFailed)?;
                    }
                    Readiness::ConditionFalse => {
                        info!("step '{}' skipped: condition is false", def.id);
                        exec.steps[idx].skip(SkipReason::ConditionFalse)?;
                    }
                    Readiness::Ready => {
                        exec.steps[idx].mark_ready()?;
                        self.dispatch(exec, idx, &def, tasks)?;
                    }
                }
                progressed = true;
            }
            dirty |= progressed;
            if !progressed {
                break;
            }
        }

        if exec.is_settled() {
            finish(exec)?;
            persist(&self.inner.storage, exec).await?;
            return Ok(true);
        }
        if dirty {
            persist(&self.inner.storage, exec).await?;
        }
        Ok(false)
    }

    /// Start an attempt against the step's own agent.
    fn dispatch(
        &self,
        exec: &mut Execution,
        idx: usize,
        def: &StepDefinition,
        tasks: &mut JoinSet<StepEvent>,
    ) -> Result<(), EngineError> {
        self.start_attempt(exec, idx, def, def.agent_id.clone(), false, tasks)
    }

    /// Count a new attempt, resolve the step input and spawn the agent call.
    /// An input that does not resolve fails the attempt with `MappingError`.
    fn start_attempt(
        &self,
        exec: &mut Execution,
        idx: usize,
        def: &StepDefinition,
        agent_id: String,
        fallback: bool,
        tasks: &mut JoinSet<StepEvent>,
    ) -> Result<(), EngineError> {
        exec.steps[idx].mark_running(&agent_id, fallback)?;
        if !exec.dispatch_order.contains(&def.id) {
            exec.dispatch_order.push(def.id.clone());
        }

        let input = match step_input(exec, def) {
            Ok(input) => input,
            Err(e) => {
                warn!("step '{}' input mapping failed: {}", def.id, e);
                return self.after_failure(exec, idx, def, ErrorDetail::from(&e), true, tasks);
            }
        };

        let attempt = exec.steps[idx].attempts;
        let ctx = InvocationContext {
            workflow_id: exec.workflow_id.to_string(),
            execution_id: exec.id.to_string(),
            step_id: def.id.clone(),
            attempt,
        };
        let timeout = def.effective_timeout(self.inner.config.default_step_timeout_ms);
        let agents = self.inner.agents.clone();
        let permits = self.inner.permits.clone();
        debug!("step '{}' attempt {} dispatched to agent '{}'", def.id, attempt, agent_id);

        tasks.spawn(async move {
            let step_id = ctx.step_id.clone();
            let outcome = call_agent(agents, permits, agent_id, input, timeout, ctx).await;
            StepEvent::Finished { step_id, attempt, outcome }
        });
        Ok(())
    }

    async fn handle(&self, event: StepEvent, tasks: &mut JoinSet<StepEvent>) -> Result<(), EngineError> {
        let mut guard = self.state.lock().await;
        let exec = &mut *guard;
        if exec.status.is_terminal() {
            debug!(?event, "discarding event for finished execution");
            return Ok(());
        }

        match event {
            StepEvent::RetryDue { step_id } => {
                // Back to plain `waiting`; the next readiness pass redispatches.
                exec.require_step_mut(&step_id)?.retry_at = None;
                Ok(())
            }
            StepEvent::Finished { step_id, attempt, outcome } => {
                let step = exec.require_step_mut(&step_id)?;
                if step.status != StepStatus::Running || step.attempts != attempt {
                    debug!("discarding stale result for step '{}' attempt {}", step_id, attempt);
                    return Ok(());
                }
                match outcome {
                    Ok(output) => self.on_success(exec, &step_id, output, tasks).await?,
                    Err(e) => self.on_failure(exec, &step_id, e, tasks)?,
                }
                persist(&self.inner.storage, exec).await
            }
        }
    }

    async fn on_success(
        &self,
        exec: &mut Execution,
        step_id: &str,
        output: Value,
        tasks: &mut JoinSet<StepEvent>,
    ) -> Result<(), EngineError> {
        let def = self.definition(exec, step_id)?;

        let mapped = {
            let steps = exec.step_outputs();
            let ctx = MappingContext::new(&exec.input, &steps, &exec.outputs);
            map_step_output(&def, &output, &ctx)
        };
        let entries = match mapped {
            Ok(entries) => entries,
            Err(e) => {
                warn!("step '{}' output mapping failed: {}", step_id, e);
                let idx = step_index(exec, step_id)?;
                return self.after_failure(exec, idx, &def, ErrorDetail::from(&e), true, tasks);
            }
        };

        exec.outputs.extend(entries);
        let step = exec.require_step_mut(step_id)?;
        step.succeed(output.clone())?;
        info!("step '{}' succeeded after {} attempt(s)", step_id, step.attempts);

        let (agent_id, depth) = (step.agent_id.clone(), step.origin.depth());
        if depth < self.inner.config.max_handoff_depth {
            self.spawn_handoffs(exec, &def, &agent_id, depth, &output).await;
        }
        Ok(())
    }

    /// Append dynamic steps for every handoff that fires on `output`.
    async fn spawn_handoffs(
        &self,
        exec: &mut Execution,
        source: &StepDefinition,
        agent_id: &str,
        depth: u32,
        output: &Value,
    ) {
        let handoffs = match self.inner.handoffs.for_source(agent_id).await {
            Ok(handoffs) if !handoffs.is_empty() => handoffs,
            Ok(_) => return,
            Err(e) => {
                warn!("loading handoffs for agent '{}' failed: {}", agent_id, e);
                return;
            }
        };

        let planned = {
            let steps = exec.step_outputs();
            let ctx = MappingContext::new(&exec.input, &steps, &exec.outputs).with_current(output);
            let fired = resolve_handoffs(&handoffs, &ctx);
            let taken: HashSet<String> = exec.steps.iter().map(|s| s.step_id.clone()).collect();
            plan_dynamic_steps(source, depth, fired, &taken)
        };

        for (step, origin) in planned {
            info!("handoff from step '{}' spawned step '{}'", source.id, step.id);
            exec.steps.push(StepResult::new(&step, origin));
            exec.spawned_steps.push(step);
        }
    }

    fn on_failure(
        &self,
        exec: &mut Execution,
        step_id: &str,
        err: AgentError,
        tasks: &mut JoinSet<StepEvent>,
    ) -> Result<(), EngineError> {
        let def = self.definition(exec, step_id)?;
        let idx = step_index(exec, step_id)?;
        let detail = ErrorDetail::new(agent_error_code(&err), err.to_string());
        self.after_failure(exec, idx, &def, detail, err.is_retryable(), tasks)
    }

    /// Retry, fall back or fail a step whose current attempt failed.
    ///
    /// Retries are allowed while `attempts <= max_retries` and the fallback
    /// has not been used; the fallback then gets exactly one attempt.
    fn after_failure(
        &self,
        exec: &mut Execution,
        idx: usize,
        def: &StepDefinition,
        detail: ErrorDetail,
        retryable: bool,
        tasks: &mut JoinSet<StepEvent>,
    ) -> Result<(), EngineError> {
        let step = &mut exec.steps[idx];

        if !step.used_fallback && retryable && step.attempts <= def.retry_policy.max_retries {
            let delay = def.retry_policy.delay_for(step.attempts);
            warn!(
                "step '{}' attempt {} failed, retrying in {:?}: {}",
                def.id, step.attempts, delay, detail.message
            );
            step.schedule_retry(detail, delay)?;
            let step_id = def.id.clone();
            tasks.spawn(async move {
                tokio::time::sleep(delay).await;
                StepEvent::RetryDue { step_id }
            });
            return Ok(());
        }

        match def.fallback_agent_id.clone() {
            Some(fallback) if !step.used_fallback => {
                warn!(
                    "step '{}' failed ({}), falling back to agent '{}'",
                    def.id, detail.message, fallback
                );
                step.error = Some(detail);
                self.start_attempt(exec, idx, def, fallback, true, tasks)
            }
            _ => {
                error!(
                    "step '{}' failed after {} attempt(s): {}",
                    def.id, step.attempts, detail.message
                );
                step.fail(detail)
            }
        }
    }

    /// Stop everything: running steps fail with `detail`, the rest are
    /// skipped for `reason`, and the execution fails.
    async fn abandon(&self, detail: ErrorDetail, reason: SkipReason) {
        let mut exec = self.state.lock().await;
        if exec.status.is_terminal() {
            return;
        }
        for step in exec.steps.iter_mut().filter(|s| !s.status.is_terminal()) {
            let outcome = if step.status == StepStatus::Running {
                step.fail(detail.clone())
            } else {
                step.skip(reason)
            };
            if let Err(e) = outcome {
                error!("failed to settle step '{}': {}", step.step_id, e);
            }
        }
        exec.error = Some(detail);
        if let Err(e) = exec.transition(ExecutionStatus::Failed) {
            error!("failed to mark execution failed: {}", e);
            return;
        }
        if let Err(e) = persist(&self.inner.storage, &mut exec).await {
            error!("failed to persist abandoned execution: {}", e);
        }
    }

    fn definition(&self, exec: &Execution, step_id: &str) -> Result<StepDefinition, EngineError> {
        exec.definition(&self.workflow, step_id)
            .cloned()
            .ok_or_else(|| EngineError::Internal(format!("no definition for step '{step_id}'")))
    }
}

fn readiness(exec: &Execution, def: &StepDefinition) -> Readiness {
    let mut blocked = false;
    for dep in &def.depends_on {
        match exec.step(dep) {
            Some(r) if r.blocks_dependents() => return Readiness::Doomed,
            Some(r) if r.satisfies_dependents() => {}
            _ => blocked = true,
        }
    }
    if blocked {
        return Readiness::Blocked;
    }

    if let Some(expr) = &def.condition {
        let steps = exec.step_outputs();
        let ctx = MappingContext::new(&exec.input, &steps, &exec.outputs);
        if !condition::holds(expr, &ctx) {
            return Readiness::ConditionFalse;
        }
    }
    Readiness::Ready
}

fn step_index(exec: &Execution, step_id: &str) -> Result<usize, EngineError> {
    exec.steps
        .iter()
        .position(|s| s.step_id == step_id)
        .ok_or_else(|| EngineError::not_found("step", step_id))
}

fn step_input(exec: &Execution, def: &StepDefinition) -> Result<Value, EngineError> {
    let steps = exec.step_outputs();
    let ctx = MappingContext::new(&exec.input, &steps, &exec.outputs);
    build_step_input(def, &ctx)
}

/// Settle the overall status once every step is terminal.
fn finish(exec: &mut Execution) -> Result<(), EngineError> {
    let failed: Vec<&StepResult> = exec.failed_steps().collect();
    if failed.is_empty() {
        exec.transition(ExecutionStatus::Completed)?;
        info!("execution '{}' completed", exec.id);
        return Ok(());
    }

    let kind = failed[0]
        .error
        .as_ref()
        .map(|e| e.kind)
        .unwrap_or(ErrorCode::AgentError);
    let ids: Vec<&str> = failed.iter().map(|s| s.step_id.as_str()).collect();
    let detail = ErrorDetail::new(kind, format!("step(s) failed: {}", ids.join(", ")));
    exec.error = Some(detail);
    exec.transition(ExecutionStatus::Failed)?;
    error!("execution '{}' failed", exec.id);
    Ok(())
}

/// One agent call, bounded by the global permit pool and `timeout`.
///
/// The call runs in its own task so a panicking agent surfaces as a fatal
/// error instead of tearing down the driver.
async fn call_agent(
    agents: Arc<dyn AgentPort>,
    permits: Option<Arc<Semaphore>>,
    agent_id: String,
    input: Value,
    timeout: Duration,
    ctx: InvocationContext,
) -> Result<Value, AgentError> {
    let _permit = match permits {
        Some(semaphore) => Some(
            semaphore
                .acquire_owned()
                .await
                .map_err(|_| AgentError::Fatal("scheduler is shutting down".into()))?,
        ),
        None => None,
    };

    let mut handle = tokio::spawn(async move { agents.invoke(&agent_id, input, timeout, &ctx).await });
    match tokio::time::timeout(timeout, &mut handle).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_err)) => Err(AgentError::Fatal(format!("agent task failed: {join_err}"))),
        Err(_) => {
            handle.abort();
            Err(AgentError::Timeout(timeout))
        }
    }
}

#[cfg(test)]
#[path = "scheduler_tests.rs"]
mod tests;
