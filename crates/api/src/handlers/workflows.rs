use axum::{
    extract::{
        rejection::{JsonRejection, PathRejection, QueryRejection},
        Path, Query, State,
    },
    http::StatusCode,
    Json,
};
use db::{models::WorkflowStatus, Page};
use engine::{ExecuteOptions, Execution, WorkflowDefinition, WorkflowDraft, WorkflowPatch};
use serde::Deserialize;
use serde_json::Value;
use uuid::Uuid;

use super::PageParams;
use crate::{error::ApiError, AppState};

#[derive(Debug, Default, Deserialize)]
pub struct ListWorkflowsParams {
    pub tag: Option<String>,
    #[serde(default)]
    pub status: WorkflowStatus,
    pub cursor: Option<String>,
    pub limit: Option<i64>,
}

/// Body of `POST /workflows/:id/execute`.
#[derive(Debug, Deserialize)]
pub struct ExecuteWorkflowDto {
    #[serde(default = "empty_object")]
    pub input: Value,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

fn empty_object() -> Value {
    Value::Object(Default::default())
}

pub async fn create(
    State(state): State<AppState>,
    payload: Result<Json<WorkflowDraft>, JsonRejection>,
) -> Result<(StatusCode, Json<WorkflowDefinition>), ApiError> {
    let Json(draft) = payload?;
    let workflow = state.orchestrator.create_workflow(draft).await?;
    Ok((StatusCode::CREATED, Json(workflow)))
}

pub async fn list(
    State(state): State<AppState>,
    params: Result<Query<ListWorkflowsParams>, QueryRejection>,
) -> Result<Json<Page<WorkflowDefinition>>, ApiError> {
    let Query(params) = params?;
    let page = state
        .orchestrator
        .list_workflows(
            params.tag.as_deref(),
            params.status,
            params.cursor.as_deref(),
            params.limit,
        )
        .await?;
    Ok(Json(page))
}

pub async fn get(
    State(state): State<AppState>,
    id: Result<Path<Uuid>, PathRejection>,
) -> Result<Json<WorkflowDefinition>, ApiError> {
    let Path(id) = id?;
    Ok(Json(state.orchestrator.get_workflow(id).await?))
}

pub async fn get_version(
    State(state): State<AppState>,
    path: Result<Path<(Uuid, u32)>, PathRejection>,
) -> Result<Json<WorkflowDefinition>, ApiError> {
    let Path((id, version)) = path?;
    Ok(Json(state.orchestrator.get_workflow_version(id, version).await?))
}

pub async fn update(
    State(state): State<AppState>,
    id: Result<Path<Uuid>, PathRejection>,
    payload: Result<Json<WorkflowPatch>, JsonRejection>,
) -> Result<Json<WorkflowDefinition>, ApiError> {
    let Path(id) = id?;
    let Json(patch) = payload?;
    Ok(Json(state.orchestrator.update_workflow(id, patch).await?))
}

pub async fn delete(
    State(state): State<AppState>,
    id: Result<Path<Uuid>, PathRejection>,
) -> Result<StatusCode, ApiError> {
    let Path(id) = id?;
    state.orchestrator.delete_workflow(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn execute(
    State(state): State<AppState>,
    id: Result<Path<Uuid>, PathRejection>,
    payload: Result<Json<ExecuteWorkflowDto>, JsonRejection>,
) -> Result<(StatusCode, Json<Execution>), ApiError> {
    let Path(id) = id?;
    let Json(dto) = payload?;
    let options = ExecuteOptions {
        priority: dto.priority,
        timeout_ms: dto.timeout_ms,
    };
    let execution = state.orchestrator.execute(id, dto.input, options).await?;
    Ok((StatusCode::ACCEPTED, Json(execution)))
}

pub async fn list_executions(
    State(state): State<AppState>,
    id: Result<Path<Uuid>, PathRejection>,
    params: Result<Query<PageParams>, QueryRejection>,
) -> Result<Json<Page<Execution>>, ApiError> {
    let Path(id) = id?;
    let Query(params) = params?;
    let page = state
        .orchestrator
        .list_executions(id, params.cursor.as_deref(), params.limit)
        .await?;
    Ok(Json(page))
}
