use std::sync::Arc;

use identityd_infra::outbox::TracingSender;
use identityd_infra::{PostgresStore, Settings};
use identityd_worker::{Stores, Worker};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::load()?;
    identityd_observability::init(settings.observability.format);

    let stores = match &settings.database_url {
        Some(url) => {
            let store = PostgresStore::connect(url).await?;
            store.migrate().await?;
            Stores::postgres(store)
        }
        None => {
            tracing::warn!("database_url not set; using in-memory stores");
            Stores::in_memory()
        }
    };

    let mut worker = Worker::build(&settings, stores, Arc::new(TracingSender::new()))?;
    worker.start()?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown requested");

    // Joining task threads blocks; keep it off the runtime.
    tokio::task::spawn_blocking(move || worker.shutdown()).await?;
    Ok(())
}
