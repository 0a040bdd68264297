//! Execution state machine.
//!
//! An [`Execution`] is one run of a workflow version. Its overall status
//! moves forward only:
//!
//! ```text
//! pending ──► running ──► completed | failed | cancelled
//!    │
//!    └──────► cancelled | failed
//! ```
//!
//! Each step has its own [`StepResult`] whose terminal statuses
//! (`succeeded`, `failed`, `skipped`) are final.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use db::models::ExecutionRow;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{EngineError, ErrorCode};
use crate::models::{StepDefinition, WorkflowDefinition};

// ---------------------------------------------------------------------------
// Statuses
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn can_transition_to(self, next: Self) -> bool {
        use ExecutionStatus::*;
        matches!(
            (self, next),
            (Pending, Running | Cancelled | Failed) | (Running, Completed | Failed | Cancelled)
        )
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ExecutionStatus {
    type Err = EngineError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(EngineError::InvalidInput(format!("unknown execution status: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Waiting,
    Ready,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Skipped)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// The step's own condition evaluated false.
    ConditionFalse,
    /// A dependency failed or was itself skipped for this reason.
    UpstreamFailed,
    Cancelled,
    /// The execution deadline passed before the step could finish.
    TimedOut,
}

/// Error summary attached to a failed step or execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub kind: ErrorCode,
    pub message: String,
}

impl ErrorDetail {
    pub fn new(kind: ErrorCode, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }
}

impl From<&EngineError> for ErrorDetail {
    fn from(e: &EngineError) -> Self {
        Self::new(e.code(), e.to_string())
    }
}

/// Where a step came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepOrigin {
    #[default]
    Declared,
    Handoff {
        handoff_id: Uuid,
        source_step: String,
        depth: u32,
    },
}

impl StepOrigin {
    pub fn depth(&self) -> u32 {
        match self {
            Self::Declared => 0,
            Self::Handoff { depth, .. } => *depth,
        }
    }
}

/// One entry of a step's status trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusChange {
    pub status: StepStatus,
    pub attempt: u32,
    pub at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// StepResult
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub step_id: String,
    /// Agent of the latest attempt; the fallback once it has been tried.
    pub agent_id: String,
    pub status: StepStatus,
    pub attempts: u32,
    #[serde(default)]
    pub used_fallback: bool,
    pub output: Option<Value>,
    pub error: Option<ErrorDetail>,
    pub skip_reason: Option<SkipReason>,
    /// Set while a retry is scheduled; the step is not dispatchable until
    /// it clears.
    #[serde(default)]
    pub retry_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub origin: StepOrigin,
    #[serde(default)]
    pub history: Vec<StatusChange>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl StepResult {
    pub fn new(step: &StepDefinition, origin: StepOrigin) -> Self {
        Self {
            step_id: step.id.clone(),
            agent_id: step.agent_id.clone(),
            status: StepStatus::Waiting,
            attempts: 0,
            used_fallback: false,
            output: None,
            error: None,
            skip_reason: None,
            retry_at: None,
            origin,
            history: vec![StatusChange {
                status: StepStatus::Waiting,
                attempt: 0,
                at: Utc::now(),
            }],
            started_at: None,
            finished_at: None,
        }
    }

    fn set_status(&mut self, status: StepStatus) -> Result<(), EngineError> {
        if self.status.is_terminal() {
            return Err(EngineError::InvalidTransition {
                from: format!("{:?}", self.status).to_lowercase(),
                to: format!("{status:?}").to_lowercase(),
            });
        }
        let now = Utc::now();
        self.status = status;
        self.history.push(StatusChange { status, attempt: self.attempts, at: now });
        if status.is_terminal() {
            self.finished_at = Some(now);
            self.retry_at = None;
        }
        Ok(())
    }

    pub fn mark_ready(&mut self) -> Result<(), EngineError> {
        self.retry_at = None;
        self.set_status(StepStatus::Ready)
    }

    /// Start a new attempt against `agent_id`.
    pub fn mark_running(&mut self, agent_id: &str, fallback: bool) -> Result<(), EngineError> {
        self.attempts += 1;
        self.agent_id = agent_id.to_string();
        self.used_fallback |= fallback;
        self.started_at.get_or_insert_with(Utc::now);
        self.set_status(StepStatus::Running)
    }

    pub fn succeed(&mut self, output: Value) -> Result<(), EngineError> {
        self.set_status(StepStatus::Succeeded)?;
        self.output = Some(output);
        self.error = None;
        Ok(())
    }

    pub fn fail(&mut self, error: ErrorDetail) -> Result<(), EngineError> {
        self.set_status(StepStatus::Failed)?;
        self.error = Some(error);
        Ok(())
    }

    pub fn skip(&mut self, reason: SkipReason) -> Result<(), EngineError> {
        self.set_status(StepStatus::Skipped)?;
        self.skip_reason = Some(reason);
        Ok(())
    }

    /// Park a failed attempt until `delay` has passed.
    pub fn schedule_retry(&mut self, error: ErrorDetail, delay: Duration) -> Result<(), EngineError> {
        self.set_status(StepStatus::Waiting)?;
        self.error = Some(error);
        self.retry_at = Some(Utc::now() + chrono::Duration::milliseconds(delay.as_millis() as i64));
        Ok(())
    }

    /// Whether this step lets its dependents proceed.
    pub fn satisfies_dependents(&self) -> bool {
        match self.status {
            StepStatus::Succeeded => true,
            StepStatus::Skipped => self.skip_reason == Some(SkipReason::ConditionFalse),
            _ => false,
        }
    }

    /// Whether this step dooms its dependents.
    pub fn blocks_dependents(&self) -> bool {
        self.status == StepStatus::Failed
            || (self.status == StepStatus::Skipped && !self.satisfies_dependents())
    }
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

/// Caller-tunable knobs for one execution.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecuteOptions {
    #[serde(default)]
    pub priority: i32,
    /// Overall deadline for the execution.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub workflow_version: u32,
    pub status: ExecutionStatus,
    /// Immutable snapshot of the caller's input.
    pub input: Value,
    pub steps: Vec<StepResult>,
    /// Steps created at runtime by handoffs.
    #[serde(default)]
    pub spawned_steps: Vec<StepDefinition>,
    /// Step ids in the order they were first dispatched.
    #[serde(default)]
    pub dispatch_order: Vec<String>,
    pub outputs: Map<String, Value>,
    pub error: Option<ErrorDetail>,
    pub priority: i32,
    pub timeout_ms: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Execution {
    pub fn new(workflow: &WorkflowDefinition, input: Value, options: &ExecuteOptions) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            workflow_id: workflow.id,
            workflow_version: workflow.version,
            status: ExecutionStatus::Pending,
            input,
            steps: workflow
                .steps
                .iter()
                .map(|s| StepResult::new(s, StepOrigin::Declared))
                .collect(),
            spawned_steps: Vec::new(),
            dispatch_order: Vec::new(),
            outputs: Map::new(),
            error: None,
            priority: options.priority,
            timeout_ms: options.timeout_ms,
            created_at: now,
            started_at: None,
            finished_at: None,
            updated_at: now,
        }
    }

    /// Move the overall status forward.
    ///
    /// # Errors
    /// [`EngineError::InvalidTransition`] for any move the lattice forbids.
    pub fn transition(&mut self, next: ExecutionStatus) -> Result<(), EngineError> {
        if !self.status.can_transition_to(next) {
            return Err(EngineError::InvalidTransition {
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        let now = Utc::now();
        self.status = next;
        self.updated_at = now;
        if next == ExecutionStatus::Running {
            self.started_at = Some(now);
        }
        if next.is_terminal() {
            self.finished_at = Some(now);
        }
        Ok(())
    }

    /// Cancel a live execution. Returns `false` when it had already finished.
    pub fn cancel(&mut self) -> Result<bool, EngineError> {
        if self.status.is_terminal() {
            return Ok(false);
        }
        self.transition(ExecutionStatus::Cancelled)?;
        for step in self.steps.iter_mut().filter(|s| !s.status.is_terminal()) {
            step.skip(SkipReason::Cancelled)?;
        }
        Ok(true)
    }

    pub fn step(&self, step_id: &str) -> Option<&StepResult> {
        self.steps.iter().find(|s| s.step_id == step_id)
    }

    pub fn step_mut(&mut self, step_id: &str) -> Option<&mut StepResult> {
        self.steps.iter_mut().find(|s| s.step_id == step_id)
    }

    /// Look up a step, failing with `NotFound` when it does not exist.
    pub fn require_step_mut(&mut self, step_id: &str) -> Result<&mut StepResult, EngineError> {
        self.step_mut(step_id)
            .ok_or_else(|| EngineError::not_found("step", step_id))
    }

    /// Definition of `step_id`, declared or spawned.
    pub fn definition<'a>(
        &'a self,
        workflow: &'a WorkflowDefinition,
        step_id: &str,
    ) -> Option<&'a StepDefinition> {
        workflow
            .step(step_id)
            .or_else(|| self.spawned_steps.iter().find(|s| s.id == step_id))
    }

    /// Outputs of every succeeded step, keyed by step id.
    pub fn step_outputs(&self) -> BTreeMap<String, Value> {
        self.steps
            .iter()
            .filter_map(|s| Some((s.step_id.clone(), s.output.clone()?)))
            .collect()
    }

    /// No step is waiting, ready or running.
    pub fn is_settled(&self) -> bool {
        self.steps.iter().all(|s| s.status.is_terminal())
    }

    pub fn failed_steps(&self) -> impl Iterator<Item = &StepResult> {
        self.steps.iter().filter(|s| s.status == StepStatus::Failed)
    }

    pub fn to_row(&self) -> Result<ExecutionRow, EngineError> {
        Ok(ExecutionRow {
            id: self.id.to_string(),
            workflow_id: self.workflow_id.to_string(),
            workflow_version: i64::from(self.workflow_version),
            status: self.status.to_string(),
            priority: i64::from(self.priority),
            snapshot: serde_json::to_string(self)?,
            created_at: self.created_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
            updated_at: self.updated_at,
        })
    }

    pub fn from_row(row: &ExecutionRow) -> Result<Self, EngineError> {
        Ok(serde_json::from_str(&row.snapshot)?)
    }

    /// Final outputs and status, once the execution is terminal.
    pub fn result(&self) -> Result<ExecutionResult, EngineError> {
        if !self.status.is_terminal() {
            return Err(EngineError::NotReady(self.id.to_string()));
        }
        Ok(ExecutionResult {
            execution_id: self.id,
            workflow_id: self.workflow_id,
            status: self.status,
            outputs: self.outputs.clone(),
            error: self.error.clone(),
            finished_at: self.finished_at,
        })
    }
}

/// Aggregated outputs of a finished execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub execution_id: Uuid,
    pub workflow_id: Uuid,
    pub status: ExecutionStatus,
    pub outputs: Map<String, Value>,
    pub error: Option<ErrorDetail>,
    pub finished_at: Option<DateTime<Utc>>,
}
