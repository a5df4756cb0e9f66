// Bus server entry point.
use anyhow::{Context, Result};
use bus::app::AppState;
use bus::config::ServiceConfig;
use bus::{app, observability};
use murmur_core::TopicManager;
use std::sync::Arc;
use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> Result<()> {
    let metrics_handle = observability::init_observability();
    let config = ServiceConfig::from_env_or_yaml().context("load configuration")?;

    let manager = TopicManager::new(config.bus_config());
    let state = AppState::new(manager.clone());
    let router = app::build_router(state);

    let listener = TcpListener::bind(config.http_bind)
        .await
        .with_context(|| format!("bind {}", config.http_bind))?;
    tracing::info!(addr = %listener.local_addr()?, "bus listening");

    let metrics_task = {
        let metrics_bind = config.metrics_bind;
        tokio::spawn(async move {
            if let Err(err) = observability::serve_metrics(metrics_handle, metrics_bind).await {
                tracing::warn!(error = %err, "metrics listener exited");
            }
        })
    };

    axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown(shutdown_signal(manager))
        .await
        .context("serve")?;

    metrics_task.abort();
    tracing::info!("bus stopped");
    Ok(())
}

/// Resolves once the bus has drained: topics are flushed before the
/// listener stops accepting, so subscribers get their final batches.
async fn shutdown_signal(manager: Arc<TopicManager>) {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
    manager.shutdown_all().await;
}
