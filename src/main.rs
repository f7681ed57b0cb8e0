use std::sync::Arc;

use tracing_subscriber::prelude::*;
use tubely::{
    api::{router, AssetServing},
    blob::{AssetStore, DiskStore, MemoryStore, ObjectStorage},
    config::{Config, StorageMode},
    database::Database,
    probe::FfProbe,
    storage::{ensure_storage_root, LocalAssets, LocationStrategy, ObjectAssets},
    upload::{Limits, Uploader},
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().without_time())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = Config::from_env()?;
    let db = Database::new(&config.database_url).await?;

    let local = LocalAssets::new(&config.assets_root, config.port);
    let (assets, locator, serving): (Arc<dyn AssetStore>, Arc<dyn LocationStrategy>, _) =
        match &config.storage {
            StorageMode::Memory => (
                Arc::new(MemoryStore::new()),
                Arc::new(local),
                AssetServing::Store,
            ),
            StorageMode::Local => {
                ensure_storage_root(&config.assets_root).await?;
                (
                    Arc::new(DiskStore::new(&config.assets_root)),
                    Arc::new(local),
                    AssetServing::Disk(config.assets_root.clone()),
                )
            }
            StorageMode::ObjectStorage { bucket, region } => (
                Arc::new(ObjectStorage::s3(bucket, region)?),
                Arc::new(ObjectAssets::new(bucket, region)),
                AssetServing::External,
            ),
        };

    let uploader = Uploader::new(
        Arc::new(db),
        assets,
        locator,
        Arc::new(FfProbe::new(&config.ffprobe_path)),
    )
    .with_limits(Limits {
        probe_timeout: config.probe_timeout,
        ..Limits::default()
    });

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port)).await?;
    tracing::info!(port = config.port, storage = ?config.storage, "serving");
    axum::serve(listener, router(uploader, serving)).await?;
    Ok(())
}
