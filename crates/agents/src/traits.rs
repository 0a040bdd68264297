//! The agent contracts: [`Agent`] for implementations, [`AgentPort`] for
//! the engine's view of "something that can invoke an agent by id".

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::AgentError;

/// Context passed to every agent invocation.
///
/// Defined here (in the agents crate) so both the engine and individual agent
/// implementations can import it without a circular dependency.
#[derive(Debug, Clone, Default)]
pub struct InvocationContext {
    /// ID of the parent workflow.
    pub workflow_id: String,
    /// ID of the current execution run.
    pub execution_id: String,
    /// Step being executed (handoff steps use their synthetic id).
    pub step_id: String,
    /// 1-based attempt number for this step.
    pub attempt: u32,
}

/// The core agent trait.
///
/// Agents are opaque to the engine: they receive the resolved JSON input of a
/// step and return a JSON output.
#[async_trait]
pub trait Agent: Send + Sync {
    async fn handle(&self, input: Value, ctx: &InvocationContext) -> Result<Value, AgentError>;
}

/// Routing port the scheduler dispatches through.
///
/// Implementations must enforce `timeout` and report it as
/// [`AgentError::Timeout`].
#[async_trait]
pub trait AgentPort: Send + Sync {
    async fn invoke(
        &self,
        agent_id: &str,
        input: Value,
        timeout: Duration,
        ctx: &InvocationContext,
    ) -> Result<Value, AgentError>;
}
