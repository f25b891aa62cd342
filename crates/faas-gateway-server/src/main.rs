use color_eyre::eyre::{self, WrapErr};
use faas_executor::{BuildPipeline, DockerRuntime, InvocationEngine, TelemetryPipeline};
use faas_gateway_server::{create_app, AppState, ControlPlaneConfig, FunctionService, DEFAULT_LOG_FILTER};
use faas_store::{JsonFileMetricStore, JsonFileRegistry};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> eyre::Result<()> {
    dotenvy::dotenv().ok();
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .init();

    let config = ControlPlaneConfig::from_env()?;
    info!(?config, "Starting FaaS control plane");

    let runtime = Arc::new(DockerRuntime::connect_with_local_defaults()?);
    runtime
        .ping()
        .await
        .wrap_err("Docker engine is not reachable")?;

    let registry = Arc::new(JsonFileRegistry::open(&config.registry_path).await?);
    let metric_store = Arc::new(JsonFileMetricStore::open(&config.metrics_path).await?);
    let (metrics, telemetry) = TelemetryPipeline::spawn(metric_store, config.telemetry_capacity);

    let engine = InvocationEngine::new(runtime.clone(), config.build_transport()?, metrics);
    let builder = BuildPipeline::new(runtime, config.transport);
    let app = create_app(AppState::new(FunctionService::new(registry, builder, engine)));

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .wrap_err_with(|| format!("Failed to bind {}", config.listen_addr))?;
    info!(addr = %config.listen_addr, transport = %config.transport, "FaaS control plane listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // The router and its metric senders are gone; wait for in-flight metrics.
    info!("Shutting down, persisting metrics...");
    if let Err(e) = telemetry.shutdown().await {
        warn!(error = %e, "Telemetry shutdown failed");
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Received shutdown signal");
}
