//! Error envelope for every non-2xx response:
//!
//! ```json
//! { "error": { "code": "NotFound", "message": "...", "details": null, "request_id": "..." } }
//! ```

use axum::{
    extract::rejection::{JsonRejection, PathRejection, QueryRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use engine::{EngineError, ErrorCode};
use serde_json::{json, Value};
use tracing::{error, warn};

use crate::request_id;

#[derive(Debug)]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
    pub details: Value,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: Value::Null,
        }
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidInput, message)
    }
}

pub fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::InvalidInput | ErrorCode::CyclicDependency | ErrorCode::InvalidReference => {
            StatusCode::BAD_REQUEST
        }
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::Conflict | ErrorCode::NotReady => StatusCode::CONFLICT,
        ErrorCode::MappingError => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorCode::Timeout => StatusCode::GATEWAY_TIMEOUT,
        ErrorCode::AgentError => StatusCode::BAD_GATEWAY,
        ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        let code = e.code();
        // Storage failures stay in the logs.
        let message = if code == ErrorCode::Internal {
            error!(error = %e, "internal error");
            "internal error".to_string()
        } else {
            e.to_string()
        };
        Self {
            code,
            message,
            details: e.details(),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::invalid_input(rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self::invalid_input(rejection.body_text())
    }
}

impl From<PathRejection> for ApiError {
    fn from(rejection: PathRejection) -> Self {
        Self::invalid_input(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(self.code);
        if status.is_client_error() {
            warn!(code = %self.code, message = %self.message, "request rejected");
        }
        let body = json!({
            "error": {
                "code": self.code,
                "message": self.message,
                "details": self.details,
                "request_id": request_id::current(),
            }
        });
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_covers_the_taxonomy() {
        assert_eq!(status_for(ErrorCode::CyclicDependency), StatusCode::BAD_REQUEST);
        assert_eq!(status_for(ErrorCode::NotReady), StatusCode::CONFLICT);
        assert_eq!(status_for(ErrorCode::MappingError), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(status_for(ErrorCode::Timeout), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(status_for(ErrorCode::AgentError), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn internal_errors_hide_their_cause() {
        let err = ApiError::from(EngineError::Internal("disk on fire".into()));
        assert_eq!(err.code, ErrorCode::Internal);
        assert_eq!(err.message, "internal error");
    }
}
