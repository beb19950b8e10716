mod app;
mod config;
mod engine;
mod models;
mod services;

use std::sync::Arc;

use anyhow::Result;
use tracing_subscriber::EnvFilter;

use app::App;
use services::storage::MemoryStore;
use services::{Database, KeyValueStore, SettingsService};

async fn run() -> Result<()> {
    let store: Arc<dyn KeyValueStore> = if std::env::var_os("MURMUR_EPHEMERAL").is_some() {
        tracing::info!("Ephemeral session, nothing will be saved");
        Arc::new(MemoryStore::new())
    } else {
        Arc::new(Database::new()?)
    };

    let settings =
        SettingsService::load(store.as_ref()).with_overrides(|name| std::env::var(name).ok());
    tracing::debug!("Using {} at {}", settings.model, settings.base_url);

    App::new(store, settings).run().await
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let runtime = tokio::runtime::Runtime::new()?;
    let result = runtime.block_on(run());
    // A blocked stdin read must not hold the process open.
    runtime.shutdown_background();
    result
}
