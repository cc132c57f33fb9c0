//! Deduplication, batched store writes and run orchestration.

pub mod config;
pub mod dedup;
pub mod engine;
pub mod pipeline;

use std::sync::Arc;

use anyhow::Result;
use hsync_storage::{DocumentStore, FirestoreStore};

pub use config::{parse_statuses, ConfigError, StoreSettings, SyncConfig};
pub use dedup::{dedup, DeduplicatedSet};
pub use engine::{RecordFailure, SyncEngine, SyncError, UpsertReport, WriteOutcome};
pub use pipeline::{
    display_count, render_brief, scrape_to_file, RunOutcome, RunSummary, Stage, SyncPipeline,
};

pub const CRATE_NAME: &str = "hsync-sync";

/// Resolve credentials and build the remote store client.
pub fn connect_store(config: &SyncConfig) -> Result<Arc<dyn DocumentStore>, ConfigError> {
    let credentials = config.credentials()?;
    let store = FirestoreStore::new(credentials, config.collection.clone(), config.http_timeout())
        .map_err(ConfigError::StoreClient)?;
    Ok(Arc::new(store))
}

pub async fn run_sync_once_from_env() -> Result<RunSummary> {
    run_sync_once(SyncConfig::from_env()?).await
}

/// Check the input file and credentials, then run one sync against the remote store.
pub async fn run_sync_once(config: SyncConfig) -> Result<RunSummary> {
    config.require_input()?;
    let store = connect_store(&config)?;
    Ok(SyncPipeline::new(config, store).run_once().await)
}
