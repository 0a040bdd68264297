//! Agent-level error type.

use std::time::Duration;

use thiserror::Error;

/// Errors returned through the agent port.
///
/// The scheduler uses the variant to decide retry behaviour:
/// - `Failed`   — transient domain failure; retried per the step's policy.
/// - `Fatal`    — permanent failure; retries are skipped, fallback still applies.
/// - `Timeout`  — the call exceeded the step timeout; retried like `Failed`.
/// - `NotFound` — no agent is registered under the requested id.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AgentError {
    /// Transient failure; the scheduler may retry the step.
    #[error("agent error: {0}")]
    Failed(String),

    /// Permanent failure; no retry should be attempted.
    #[error("fatal agent error: {0}")]
    Fatal(String),

    #[error("agent call timed out after {0:?}")]
    Timeout(Duration),

    #[error("agent '{0}' is not registered")]
    NotFound(String),
}

impl AgentError {
    /// Whether a retry with the same agent can plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Failed(_) | Self::Timeout(_))
    }
}
