//! Engine-level error types.

use agents::AgentError;
use db::DbError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error taxonomy shared by every caller-facing surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    InvalidInput,
    CyclicDependency,
    InvalidReference,
    NotFound,
    MappingError,
    Timeout,
    AgentError,
    Conflict,
    NotReady,
    Internal,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::InvalidInput => "InvalidInput",
            Self::CyclicDependency => "CyclicDependency",
            Self::InvalidReference => "InvalidReference",
            Self::NotFound => "NotFound",
            Self::MappingError => "MappingError",
            Self::Timeout => "Timeout",
            Self::AgentError => "AgentError",
            Self::Conflict => "Conflict",
            Self::NotReady => "NotReady",
            Self::Internal => "Internal",
        };
        f.write_str(s)
    }
}

/// Errors produced by the workflow engine (validation + execution).
#[derive(Debug, Error)]
pub enum EngineError {
    // ------ Validation errors ------

    /// Malformed request or workflow input.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Two or more steps share the same ID.
    #[error("duplicate step ID: '{0}'")]
    DuplicateStepId(String),

    /// A `depends_on` entry references a step that doesn't exist.
    #[error("step '{step_id}' depends on unknown step '{missing}'")]
    InvalidReference { step_id: String, missing: String },

    /// Topological sort left these steps unresolved.
    #[error("workflow graph contains a cycle involving {0:?}")]
    CyclicDependency(Vec<String>),

    // ------ Lookup / lifecycle errors ------

    #[error("{entity} '{id}' not found")]
    NotFound { entity: &'static str, id: String },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("execution '{0}' has not finished")]
    NotReady(String),

    /// Attempted to move a record backwards in its status lattice.
    #[error("invalid status transition {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    // ------ Execution errors ------

    /// A mapping expression could not be resolved.
    #[error("mapping error: {0}")]
    Mapping(String),

    #[error(transparent)]
    Agent(#[from] AgentError),

    // ------ Infrastructure ------

    /// Persistence error from the db crate.
    #[error("database error: {0}")]
    Database(#[from] DbError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Broken engine invariant.
    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Map to the caller-facing error code.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidInput(_) | Self::DuplicateStepId(_) => ErrorCode::InvalidInput,
            Self::InvalidReference { .. } => ErrorCode::InvalidReference,
            Self::CyclicDependency(_) => ErrorCode::CyclicDependency,
            Self::NotFound { .. } => ErrorCode::NotFound,
            Self::Conflict(_) | Self::InvalidTransition { .. } => ErrorCode::Conflict,
            Self::NotReady(_) => ErrorCode::NotReady,
            Self::Mapping(_) => ErrorCode::MappingError,
            Self::Agent(e) => agent_error_code(e),
            Self::Database(DbError::NotFound) => ErrorCode::NotFound,
            Self::Database(DbError::InvalidCursor(_)) => ErrorCode::InvalidInput,
            Self::Database(DbError::Conflict(_)) => ErrorCode::Conflict,
            Self::Database(_) | Self::Serialization(_) | Self::Internal(_) => ErrorCode::Internal,
        }
    }

    /// Structured detail for error envelopes, where one exists.
    pub fn details(&self) -> serde_json::Value {
        match self {
            Self::InvalidReference { step_id, missing } => {
                serde_json::json!({ "step_id": step_id, "missing": missing })
            }
            Self::CyclicDependency(steps) => serde_json::json!({ "steps": steps }),
            Self::DuplicateStepId(id) => serde_json::json!({ "step_id": id }),
            Self::NotFound { entity, id } => serde_json::json!({ "entity": entity, "id": id }),
            _ => serde_json::Value::Null,
        }
    }
}

pub(crate) fn agent_error_code(e: &AgentError) -> ErrorCode {
    match e {
        AgentError::Timeout(_) => ErrorCode::Timeout,
        AgentError::NotFound(_) => ErrorCode::NotFound,
        AgentError::Failed(_) | AgentError::Fatal(_) => ErrorCode::AgentError,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn codes_follow_the_taxonomy() {
        assert_eq!(EngineError::DuplicateStepId("a".into()).code(), ErrorCode::InvalidInput);
        assert_eq!(EngineError::Database(DbError::NotFound).code(), ErrorCode::NotFound);
        assert_eq!(
            EngineError::Database(DbError::InvalidCursor("x".into())).code(),
            ErrorCode::InvalidInput
        );
        assert_eq!(
            EngineError::Agent(AgentError::Timeout(Duration::from_secs(1))).code(),
            ErrorCode::Timeout
        );
        assert_eq!(EngineError::Agent(AgentError::Fatal("x".into())).code(), ErrorCode::AgentError);
        assert_eq!(ErrorCode::MappingError.to_string(), "MappingError");
    }
}
