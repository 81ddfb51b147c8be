use clap::Parser as _;
use gantry::backend::HttpRuntimeClient;
use gantry::config::{Catalog, Cli};
use gantry::resources::NvidiaSmiProbe;
use gantry::{
    AppState, Orchestrator, build_metrics_layer_and_handle, build_metrics_router, build_router,
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info, instrument};

#[tokio::main]
#[instrument]
pub async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse().validate()?;
    info!("Starting gantry with config: {:?}", cli);

    let catalog = Catalog::from_file(&cli.catalog).await?;

    let orchestrator = Arc::new(Orchestrator::new(
        &catalog,
        Arc::new(HttpRuntimeClient::default()),
        Arc::new(NvidiaSmiProbe::default()),
    ));
    orchestrator.log_runtime_inventory().await;

    let (prometheus_layer, metric_handle) = build_metrics_layer_and_handle(cli.metrics_prefix);
    let router = build_router(AppState { orchestrator }).layer(prometheus_layer);

    if cli.metrics {
        let metrics_router = build_metrics_router(metric_handle);
        let metrics_addr = format!("0.0.0.0:{}", cli.metrics_port);
        let metrics_listener = TcpListener::bind(&metrics_addr).await?;
        info!("Metrics server listening on {}", metrics_addr);
        tokio::spawn(async move {
            if let Err(e) = axum::serve(metrics_listener, metrics_router).await {
                error!("Metrics server error: {}", e);
            }
        });
    }

    let bind_addr = format!("0.0.0.0:{}", cli.port);
    let listener = TcpListener::bind(&bind_addr).await?;
    info!("Gantry control plane listening on {}", bind_addr);

    axum::serve(listener, router).await?;

    Ok(())
}
