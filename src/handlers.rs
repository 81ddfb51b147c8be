//! Axum handlers for the control/status plane.
//!
//! The HTTP layer translates the facade's boolean returns into status codes:
//! a failed load is a 502 whose message is sourced from the model's
//! `error_detail`, a refused unload is a 409, and unknown model/mode names
//! are 404s.

use crate::errors::GantryError;
use crate::orchestrator::Orchestrator;
use crate::publish::StatusSnapshot;
use crate::selection::SelectionRequest;
use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
};
use futures_util::{Stream, StreamExt};
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{info, instrument};

/// Shared state for the control plane.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
}

impl IntoResponse for GantryError {
    fn into_response(self) -> Response {
        let body = Json(json!({ "error": self.to_string() }));
        (StatusCode::NOT_FOUND, body).into_response()
    }
}

/// List the registered model catalog.
pub async fn models(State(state): State<AppState>) -> Response {
    let models: Vec<_> = state
        .orchestrator
        .registry()
        .all()
        .map(|d| d.as_ref().clone())
        .collect();
    Json(json!({ "models": models })).into_response()
}

pub async fn status(State(state): State<AppState>) -> Json<StatusSnapshot> {
    Json(state.orchestrator.get_status().await)
}

pub async fn quick_status(State(state): State<AppState>) -> Response {
    Json(state.orchestrator.get_quick_status().await).into_response()
}

#[instrument(skip(state))]
pub async fn load_model(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Response, GantryError> {
    info!(model = %name, "load requested over HTTP");
    if state.orchestrator.load(&name).await? {
        Ok(Json(json!({ "ok": true })).into_response())
    } else {
        let error = state
            .orchestrator
            .error_detail(&name)
            .unwrap_or_else(|| "load failed".to_string());
        Ok((StatusCode::BAD_GATEWAY, Json(json!({ "ok": false, "error": error }))).into_response())
    }
}

#[instrument(skip(state))]
pub async fn unload_model(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Response, GantryError> {
    info!(model = %name, "unload requested over HTTP");
    if state.orchestrator.unload(&name).await? {
        Ok(Json(json!({ "ok": true })).into_response())
    } else {
        Ok((
            StatusCode::CONFLICT,
            Json(json!({
                "ok": false,
                "error": "unload refused: backend is externally supervised or a transition is in flight"
            })),
        )
            .into_response())
    }
}

#[instrument(skip(state))]
pub async fn switch_mode(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Response, GantryError> {
    let results = state.orchestrator.switch_mode(&name).await?;
    Ok(Json(json!({ "mode": name, "results": results })).into_response())
}

pub async fn select_model(
    State(state): State<AppState>,
    Json(request): Json<SelectionRequest>,
) -> Response {
    let model = state.orchestrator.select(&request).await;
    Json(json!({ "model": model })).into_response()
}

/// Live status feed. Each lifecycle transition produces one SSE event with a
/// full snapshot; lagged receivers simply skip to the next snapshot.
pub async fn status_stream(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = state.orchestrator.snapshot_stream();
    let stream = BroadcastStream::new(rx).filter_map(|snapshot| async move {
        let snapshot = snapshot.ok()?;
        Event::default().json_data(&snapshot).ok().map(Ok)
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InferenceBackend;
    use crate::build_router;
    use crate::config::Catalog;
    use crate::resources::VramProbe;
    use crate::testing::{StaticProbe, StubBackend};
    use axum_test::TestServer;
    use serde_json::json;

    fn catalog() -> Catalog {
        serde_json::from_value(json!({
            "models": {
                "chat": {
                    "backend": "local_runtime",
                    "purpose": "chat",
                    "memory_cost_gb": 4.0,
                    "max_context_tokens": 8192,
                    "endpoint": "http://localhost:11434"
                },
                "vllm-big": {
                    "backend": "accelerated_container",
                    "purpose": "reasoning",
                    "memory_cost_gb": 20.0,
                    "max_context_tokens": 32768,
                    "endpoint": "http://localhost:8000"
                }
            },
            "modes": {
                "standard": { "models": ["chat"] },
                "deep": { "models": ["vllm-big"], "solo": true }
            },
            "budget": { "total_capacity_gb": 64.0 }
        }))
        .unwrap()
    }

    fn server() -> (TestServer, Arc<StubBackend>) {
        let backend = Arc::new(StubBackend::default());
        let orchestrator = Arc::new(Orchestrator::new(
            &catalog(),
            Arc::clone(&backend) as Arc<dyn InferenceBackend>,
            Arc::new(StaticProbe::new(0.0)) as Arc<dyn VramProbe>,
        ));
        let router = build_router(AppState { orchestrator });
        (TestServer::new(router).unwrap(), backend)
    }

    #[tokio::test]
    async fn load_and_status_round_trip() {
        let (server, backend) = server();

        let response = server.post("/v1/models/chat/load").await;
        assert_eq!(response.status_code(), 200);
        assert_eq!(backend.warm_calls("chat"), 1);

        let response = server.get("/v1/status").await;
        assert_eq!(response.status_code(), 200);
        let body: serde_json::Value = response.json();
        assert_eq!(body["models"]["chat"]["status"], "loaded");
        assert_eq!(body["budget"]["total_capacity_gb"], 64.0);
    }

    #[tokio::test]
    async fn unknown_model_is_404() {
        let (server, _backend) = server();
        let response = server.post("/v1/models/ghost/load").await;
        assert_eq!(response.status_code(), 404);
        let body: serde_json::Value = response.json();
        assert_eq!(body["error"], "unknown model: ghost");
    }

    #[tokio::test]
    async fn failed_load_is_502_with_detail() {
        let (server, backend) = server();
        backend.fail_warm("chat");

        let response = server.post("/v1/models/chat/load").await;
        assert_eq!(response.status_code(), 502);
        let body: serde_json::Value = response.json();
        assert_eq!(body["ok"], false);
        assert!(body["error"].as_str().unwrap().contains("stubbed warm failure"));
    }

    #[tokio::test]
    async fn container_unload_is_409() {
        let (server, _backend) = server();
        server.post("/v1/models/vllm-big/load").await;

        let response = server.post("/v1/models/vllm-big/unload").await;
        assert_eq!(response.status_code(), 409);
    }

    #[tokio::test]
    async fn mode_switch_returns_per_model_map() {
        let (server, _backend) = server();
        let response = server.post("/v1/modes/standard").await;
        assert_eq!(response.status_code(), 200);
        let body: serde_json::Value = response.json();
        assert_eq!(body["results"]["chat"], true);

        let response = server.post("/v1/modes/ghost").await;
        assert_eq!(response.status_code(), 404);
    }

    #[tokio::test]
    async fn select_endpoint_picks_a_model() {
        let (server, _backend) = server();
        let response = server
            .post("/v1/select")
            .json(&json!({
                "request_type": "chat",
                "complexity": "low",
                "domain": "general",
                "context_size": 512
            }))
            .await;
        assert_eq!(response.status_code(), 200);
        let body: serde_json::Value = response.json();
        assert_eq!(body["model"], "chat");
    }

    #[tokio::test]
    async fn quick_status_lists_loaded_models() {
        let (server, _backend) = server();
        server.post("/v1/models/chat/load").await;

        let response = server.get("/v1/status/quick").await;
        assert_eq!(response.status_code(), 200);
        let body: serde_json::Value = response.json();
        assert_eq!(body["current_mode"], "standard");
        assert_eq!(body["loaded_models"], json!(["chat"]));
    }
}
