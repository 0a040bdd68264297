//! `engine` crate — workflow models, DAG validation, the execution state
//! machine, the scheduler, handoffs and the orchestrator facade.

pub mod catalog;
pub mod condition;
pub mod config;
pub mod dag;
pub mod error;
pub mod execution;
pub mod handoff;
pub mod mapping;
pub mod metrics;
pub mod models;
pub mod orchestrator;
pub mod scheduler;

pub use config::EngineConfig;
pub use dag::validate_steps;
pub use error::{EngineError, ErrorCode};
pub use execution::{
    ExecuteOptions, Execution, ExecutionResult, ExecutionStatus, SkipReason, StepResult, StepStatus,
};
pub use metrics::{ExecutionMetrics, TimeRange};
pub use models::{
    HandoffDefinition, HandoffDraft, HandoffType, RetryPolicy, StepDefinition, WorkflowDefinition,
    WorkflowDraft, WorkflowPatch,
};
pub use orchestrator::Orchestrator;
pub use scheduler::Scheduler;
