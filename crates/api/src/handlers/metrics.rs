use axum::{
    extract::{rejection::QueryRejection, Query, State},
    Json,
};
use engine::{ExecutionMetrics, TimeRange};
use serde::Deserialize;
use uuid::Uuid;

use crate::{error::ApiError, AppState};

#[derive(Debug, Default, Deserialize)]
pub struct MetricsParams {
    #[serde(default)]
    pub range: TimeRange,
    pub workflow_id: Option<Uuid>,
}

pub async fn get(
    State(state): State<AppState>,
    params: Result<Query<MetricsParams>, QueryRejection>,
) -> Result<Json<ExecutionMetrics>, ApiError> {
    let Query(params) = params?;
    let metrics = state
        .orchestrator
        .metrics(params.range, params.workflow_id)
        .await?;
    Ok(Json(metrics))
}
