//! `api` crate — HTTP management API over the [`Orchestrator`].
//!
//! Exposes, under `/api/v1`:
//!   POST   /workflows                        GET /workflows
//!   GET    /workflows/:id                    PUT /workflows/:id
//!   DELETE /workflows/:id                    GET /workflows/:id/versions/:version
//!   POST   /workflows/:id/execute            GET /workflows/:id/executions
//!   GET    /executions/:id                   POST /executions/:id/cancel
//!   GET    /executions/:id/result
//!   POST   /handoffs                         GET /handoffs
//!   GET    /handoffs/:id
//!   GET    /agents
//!   GET    /metrics
//!
//! plus an unversioned `GET /health`.

pub mod error;
pub mod handlers;
pub mod request_id;

use axum::{
    extract::Request,
    routing::{get, post},
    Json, Router,
};
use engine::Orchestrator;
use handlers::{executions, handoffs, workflows};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Orchestrator,
}

impl AppState {
    pub fn new(orchestrator: Orchestrator) -> Self {
        Self { orchestrator }
    }
}

pub fn router(state: AppState) -> Router {
    let v1 = Router::new()
        .route("/workflows", post(workflows::create).get(workflows::list))
        .route(
            "/workflows/:id",
            get(workflows::get)
                .put(workflows::update)
                .delete(workflows::delete),
        )
        .route("/workflows/:id/versions/:version", get(workflows::get_version))
        .route("/workflows/:id/execute", post(workflows::execute))
        .route("/workflows/:id/executions", get(workflows::list_executions))
        .route("/executions/:id", get(executions::get_status))
        .route("/executions/:id/cancel", post(executions::cancel))
        .route("/executions/:id/result", get(executions::get_result))
        .route("/handoffs", post(handoffs::create).get(handoffs::list))
        .route("/handoffs/:id", get(handoffs::get))
        .route("/agents", get(handlers::agents::list))
        .route("/metrics", get(handlers::metrics::get));

    Router::new()
        .route("/health", get(health))
        .nest("/api/v1", v1)
        .layer(TraceLayer::new_for_http().make_span_with(|request: &Request| {
            tracing::info_span!(
                "http",
                method = %request.method(),
                uri = %request.uri(),
                request_id = %request_id::from_request(request),
            )
        }))
        // Outermost, so the trace span already sees the id.
        .layer(axum::middleware::from_fn(request_id::propagate))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// Bind `bind` and serve until ctrl-c.
pub async fn serve(bind: &str, state: AppState) -> std::io::Result<()> {
    let listener = TcpListener::bind(bind).await?;
    info!(addr = %listener.local_addr()?, "API listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use ::agents::{echo::EchoAgent, AgentRegistration, AgentRegistry};
    use axum::{
        body::{to_bytes, Body},
        http::{header, Method, StatusCode},
        response::Response,
    };
    use db::{pool::migrated_memory_pool, Storage};
    use engine::EngineConfig;
    use tower::ServiceExt;

    use super::*;

    async fn app() -> Router {
        let pool = migrated_memory_pool().await.unwrap();
        let storage = Storage::with_ttl_cache(pool, Duration::from_secs(60));
        let registry = Arc::new(AgentRegistry::new());
        registry.register_agent(AgentRegistration::new("echo"), Arc::new(EchoAgent));
        let orchestrator = Orchestrator::new(storage, registry, EngineConfig::default());
        router(AppState::new(orchestrator))
    }

    fn json_request(method: Method, uri: &str, body: Value) -> Request {
        Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn empty_request(method: Method, uri: &str) -> Request {
        Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    async fn body_json(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn echo_workflow() -> Value {
        json!({
            "name": "echo-twice",
            "steps": [
                { "id": "a", "name": "first", "agent_id": "echo" },
                { "id": "b", "name": "second", "agent_id": "echo", "depends_on": ["a"] }
            ]
        })
    }

    #[tokio::test]
    async fn health_is_ok() {
        let response = app().await.oneshot(empty_request(Method::GET, "/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn create_then_get_workflow() {
        let app = app().await;
        let response = app
            .clone()
            .oneshot(json_request(Method::POST, "/api/v1/workflows", echo_workflow()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let created = body_json(response).await;
        assert_eq!(created["version"], 1);

        let id = created["id"].as_str().unwrap();
        let response = app
            .oneshot(empty_request(Method::GET, &format!("/api/v1/workflows/{id}")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["name"], "echo-twice");
    }

    #[tokio::test]
    async fn unknown_workflow_uses_the_error_envelope() {
        let uri = format!("/api/v1/workflows/{}", uuid::Uuid::new_v4());
        let response = app().await.oneshot(empty_request(Method::GET, &uri)).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(response.headers().contains_key(request_id::REQUEST_ID_HEADER));

        let body = body_json(response).await;
        let error = &body["error"];
        assert_eq!(error["code"], "NotFound");
        assert!(error["message"].is_string());
        assert!(error.get("details").is_some());
        assert!(error["request_id"].is_string());
    }

    #[tokio::test]
    async fn incoming_request_id_is_echoed() {
        let mut request = empty_request(Method::GET, "/api/v1/workflows/not-a-uuid");
        request
            .headers_mut()
            .insert(request_id::REQUEST_ID_HEADER, "req-42".parse().unwrap());
        let response = app().await.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(response.headers()[request_id::REQUEST_ID_HEADER], "req-42");
        let body = body_json(response).await;
        assert_eq!(body["error"]["code"], "InvalidInput");
        assert_eq!(body["error"]["request_id"], "req-42");
    }

    #[tokio::test]
    async fn malformed_json_is_invalid_input() {
        let request = Request::builder()
            .method(Method::POST)
            .uri("/api/v1/workflows")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from("{not json"))
            .unwrap();
        let response = app().await.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["error"]["code"], "InvalidInput");
    }

    #[tokio::test]
    async fn cyclic_workflow_is_rejected() {
        let body = json!({
            "name": "loop",
            "steps": [
                { "id": "a", "name": "a", "agent_id": "echo", "depends_on": ["b"] },
                { "id": "b", "name": "b", "agent_id": "echo", "depends_on": ["a"] }
            ]
        });
        let response = app()
            .await
            .oneshot(json_request(Method::POST, "/api/v1/workflows", body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["error"]["code"], "CyclicDependency");
    }

    #[tokio::test]
    async fn execute_is_accepted_and_eventually_completes() {
        let app = app().await;
        let response = app
            .clone()
            .oneshot(json_request(Method::POST, "/api/v1/workflows", echo_workflow()))
            .await
            .unwrap();
        let id = body_json(response).await["id"].as_str().unwrap().to_string();

        let response = app
            .clone()
            .oneshot(json_request(
                Method::POST,
                &format!("/api/v1/workflows/{id}/execute"),
                json!({ "input": { "x": 1 } }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let execution_id = body_json(response).await["id"].as_str().unwrap().to_string();

        let mut status = Value::Null;
        for _ in 0..100 {
            let response = app
                .clone()
                .oneshot(empty_request(Method::GET, &format!("/api/v1/executions/{execution_id}")))
                .await
                .unwrap();
            status = body_json(response).await["status"].clone();
            if status == "completed" {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(status, "completed");

        let response = app
            .oneshot(empty_request(
                Method::GET,
                &format!("/api/v1/executions/{execution_id}/result"),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn agents_are_listed() {
        let response = app().await.oneshot(empty_request(Method::GET, "/api/v1/agents")).await.unwrap();
        let body = body_json(response).await;
        assert_eq!(body[0]["id"], "echo");
    }

    #[tokio::test]
    async fn bad_metrics_range_is_invalid_input() {
        let response = app()
            .await
            .oneshot(empty_request(Method::GET, "/api/v1/metrics?range=2y"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
