use ::agents::AgentRegistration;
use axum::{extract::State, Json};

use crate::AppState;

pub async fn list(State(state): State<AppState>) -> Json<Vec<AgentRegistration>> {
    Json(state.orchestrator.list_agents())
}
