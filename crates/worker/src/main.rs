use std::sync::Arc;

use anyhow::Context;

use maintops_infra::{OutboxConfig, PostgresOutboxStore};
use maintops_maintenance::{MaintenanceNotifier, TracingSink};
use maintops_worker::{WorkerGroup, maintenance_registry};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    maintops_observability::init();

    let config = OutboxConfig::from_env().context("invalid outbox configuration")?;
    let database_url = config.require_database_url()?.to_string();

    // one connection per worker plus headroom for operator queries
    let max_connections = u32::try_from(config.worker_count)
        .unwrap_or(u32::MAX)
        .saturating_add(2);
    let store = PostgresOutboxStore::connect(&database_url, max_connections)
        .await
        .context("failed to connect to the outbox database")?;
    store.ensure_schema().await?;

    let registry = maintenance_registry(MaintenanceNotifier::new(TracingSink))?;

    tracing::info!(
        workers = config.worker_count,
        poll_interval_ms = config.poll_interval.as_millis() as u64,
        batch_size = config.batch_size,
        "starting outbox workers"
    );
    let mut group = WorkerGroup::new(Arc::new(store), Arc::new(registry), config);
    group.start_all();

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    tracing::info!("shutdown requested, finishing in-flight messages");
    group.shutdown().await;

    Ok(())
}
