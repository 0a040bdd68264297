use axum::{
    extract::{
        rejection::{JsonRejection, PathRejection, QueryRejection},
        Path, Query, State,
    },
    http::StatusCode,
    Json,
};
use db::Page;
use engine::{HandoffDefinition, HandoffDraft};
use serde::Deserialize;
use uuid::Uuid;

use crate::{error::ApiError, AppState};

#[derive(Debug, Default, Deserialize)]
pub struct ListHandoffsParams {
    pub source_agent_id: Option<String>,
    pub cursor: Option<String>,
    pub limit: Option<i64>,
}

pub async fn create(
    State(state): State<AppState>,
    payload: Result<Json<HandoffDraft>, JsonRejection>,
) -> Result<(StatusCode, Json<HandoffDefinition>), ApiError> {
    let Json(draft) = payload?;
    let handoff = state.orchestrator.register_handoff(draft).await?;
    Ok((StatusCode::CREATED, Json(handoff)))
}

pub async fn list(
    State(state): State<AppState>,
    params: Result<Query<ListHandoffsParams>, QueryRejection>,
) -> Result<Json<Page<HandoffDefinition>>, ApiError> {
    let Query(params) = params?;
    let page = state
        .orchestrator
        .list_handoffs(
            params.source_agent_id.as_deref(),
            params.cursor.as_deref(),
            params.limit,
        )
        .await?;
    Ok(Json(page))
}

pub async fn get(
    State(state): State<AppState>,
    id: Result<Path<Uuid>, PathRejection>,
) -> Result<Json<HandoffDefinition>, ApiError> {
    let Path(id) = id?;
    Ok(Json(state.orchestrator.get_handoff(id).await?))
}
