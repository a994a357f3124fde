use anyhow::Result;
use std::sync::Arc;
use topo::{load_config, ManagementContext, TopoConfig};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "topo=info".into()),
        )
        .init();

    let config = match std::env::var("TOPO_CONFIG") {
        Ok(path) => load_config(&path)?,
        Err(_) => TopoConfig::default(),
    }
    .with_env_overrides();

    info!(
        workers = config.tasks.worker_count,
        listener_concurrency = config.bus.listener_concurrency,
        "Topo starting..."
    );

    let mgmt = Arc::new(ManagementContext::new(config));

    tokio::signal::ctrl_c().await?;
    info!(entities = mgmt.entities().len(), "Shutting down");
    mgmt.shutdown();

    Ok(())
}
