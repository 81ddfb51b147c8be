//! Gantry - a multi-model accelerator-memory orchestrator
//!
//! This library coordinates which models occupy limited accelerator memory at
//! any moment: a declarative registry, lifecycle control with budget-aware
//! eviction, named operating modes, request-to-model selection, and a
//! push-based status feed, all exposed over a small HTTP control plane.

use axum::Router;
use axum::routing::{get, post};
use axum_prometheus::{
    GenericMetricLayer, Handle, PrometheusMetricLayerBuilder,
    metrics_exporter_prometheus::PrometheusHandle,
};
use std::borrow::Cow;
use tracing::{info, instrument};

pub mod backend;
pub mod config;
pub mod errors;
pub mod eviction;
pub mod handlers;
pub mod lifecycle;
pub mod modes;
pub mod orchestrator;
pub mod publish;
pub mod registry;
pub mod resources;
pub mod selection;
pub mod state;
pub mod testing;
pub mod usage;

pub use handlers::AppState;
pub use orchestrator::Orchestrator;

/// Build the control/status router.
///
/// Routes:
/// - `GET /v1/models` - the registered catalog
/// - `GET /v1/status` - full runtime snapshot
/// - `GET /v1/status/quick` - reduced, cached snapshot for frequent polling
/// - `GET /v1/status/stream` - SSE feed of snapshots on every transition
/// - `POST /v1/models/{name}/load` / `.../unload` - explicit lifecycle control
/// - `POST /v1/modes/{name}` - switch the resident model set
/// - `POST /v1/select` - pick a model for a request shape
#[instrument(skip(state))]
pub fn build_router(state: AppState) -> Router {
    info!("Building router");
    Router::new()
        .route("/v1/models", get(handlers::models))
        .route("/v1/status", get(handlers::status))
        .route("/v1/status/quick", get(handlers::quick_status))
        .route("/v1/status/stream", get(handlers::status_stream))
        .route("/v1/models/{name}/load", post(handlers::load_model))
        .route("/v1/models/{name}/unload", post(handlers::unload_model))
        .route("/v1/modes/{name}", post(handlers::switch_mode))
        .route("/v1/select", post(handlers::select_model))
        .with_state(state)
}

/// Builds a router for the metrics endpoint.
#[instrument(skip(handle))]
pub fn build_metrics_router(handle: PrometheusHandle) -> Router {
    info!("Building metrics router");
    Router::new().route(
        "/metrics",
        axum::routing::get(move || async move { handle.render() }),
    )
}

type MetricsLayerAndHandle = (
    GenericMetricLayer<'static, PrometheusHandle, Handle>,
    PrometheusHandle,
);

/// Builds a layer and handle for prometheus metrics collection.
///
/// The `'static` bound on the prefix is required by the Prometheus metrics
/// layer, which holds it for the life of the process.
pub fn build_metrics_layer_and_handle(
    prefix: impl Into<Cow<'static, str>>,
) -> MetricsLayerAndHandle {
    info!("Building metrics layer");
    PrometheusMetricLayerBuilder::new()
        .with_prefix(prefix)
        .enable_response_body_size(true)
        .with_endpoint_label_type(axum_prometheus::EndpointLabel::Exact)
        .with_default_metrics()
        .build_pair()
}
