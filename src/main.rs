use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing_subscriber::EnvFilter;

use llm_gateway::api::{self, AppState};
use llm_gateway::config::Settings;
use llm_gateway::monitoring::spawn_alert_monitor;

#[tokio::main]
async fn main() -> Result<()> {
    let settings = Settings::from_env()?;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(settings.log_level.to_lowercase()))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    tracing::info!("Inference backend: {}", settings.ollama_base_url);
    tracing::info!("Vector store: {:?} ({})", settings.vector_backend, settings.qdrant_url);
    tracing::info!(
        "Response cache: {:?} (enabled: {})",
        settings.cache_backend,
        settings.cache_enabled
    );

    let prometheus = PrometheusBuilder::new()
        .install_recorder()
        .context("Failed to install Prometheus recorder")?;

    let state = AppState::from_settings(settings.clone())
        .await
        .context("Failed to initialise application state")?
        .with_prometheus(prometheus);
    let state = Arc::new(state);

    if settings.monitoring_enabled && settings.alert_check_interval_secs > 0 {
        spawn_alert_monitor(
            state.metrics.clone(),
            Duration::from_secs(settings.alert_check_interval_secs),
            settings.alert_error_rate_threshold,
            settings.alert_response_time_threshold,
        );
        tracing::info!(
            "Alert monitor running every {}s",
            settings.alert_check_interval_secs
        );
    }

    let app = api::router(state);

    let address = format!("{}:{}", settings.host, settings.port);
    let listener = tokio::net::TcpListener::bind(&address)
        .await
        .with_context(|| format!("Failed to bind {}", address))?;
    tracing::info!("Gateway listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
