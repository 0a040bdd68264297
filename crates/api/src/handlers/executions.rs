use axum::{
    extract::{rejection::PathRejection, Path, State},
    Json,
};
use engine::{Execution, ExecutionResult};
use uuid::Uuid;

use crate::{error::ApiError, AppState};

/// Status plus per-step breakdown.
pub async fn get_status(
    State(state): State<AppState>,
    id: Result<Path<Uuid>, PathRejection>,
) -> Result<Json<Execution>, ApiError> {
    let Path(id) = id?;
    Ok(Json(state.orchestrator.get_status(id).await?))
}

/// Idempotent; a finished execution is returned as-is.
pub async fn cancel(
    State(state): State<AppState>,
    id: Result<Path<Uuid>, PathRejection>,
) -> Result<Json<Execution>, ApiError> {
    let Path(id) = id?;
    Ok(Json(state.orchestrator.cancel(id).await?))
}

pub async fn get_result(
    State(state): State<AppState>,
    id: Result<Path<Uuid>, PathRejection>,
) -> Result<Json<ExecutionResult>, ApiError> {
    let Path(id) = id?;
    Ok(Json(state.orchestrator.get_result(id).await?))
}
