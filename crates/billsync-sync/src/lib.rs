//! Bill sync job engine: job lifecycle, resumable batches, validation and
//! idempotent storage of legislative bill records.

use std::sync::Arc;

use anyhow::{Context, Result};
use billsync_adapters::{LegislatureSource, MirrorSource, RemoteSource};
use billsync_core::TypeRange;
use billsync_storage::{ArtifactStore, FtpFetcher, HttpFetcher};
use tracing::info;

mod batch;
mod config;
mod controller;
mod error;
mod scheduler;
mod store;
mod upsert;
mod validate;

pub use batch::{BatchConfig, BatchProcessor, BatchSummary, ItemFailure, ItemOutcome};
pub use config::{BillTypeConfig, BillTypeRegistry, SyncConfig};
pub use controller::JobController;
pub use error::JobError;
pub use scheduler::maybe_build_scheduler;
pub use store::{Checkpoint, MemorySyncStore, PgSyncStore, StoreError, SyncStore};
pub use upsert::{upsert, UpsertOutcome};
pub use validate::{validate, Violation};

pub const CRATE_NAME: &str = "billsync-sync";

/// Configured pieces of a sync deployment: bill type registry, remote source
/// and job store.
pub struct SyncEngine {
    config: SyncConfig,
    registry: BillTypeRegistry,
    source: Arc<dyn RemoteSource>,
    store: Arc<dyn SyncStore>,
}

impl SyncEngine {
    pub fn new(
        config: SyncConfig,
        registry: BillTypeRegistry,
        source: Arc<dyn RemoteSource>,
        store: Arc<dyn SyncStore>,
    ) -> Self {
        Self {
            config,
            registry,
            source,
            store,
        }
    }

    /// Load `bill_types.yaml` and build the remote source for `config`, using
    /// `store` for jobs and bills.
    pub fn load(config: SyncConfig, store: Arc<dyn SyncStore>) -> Result<Self> {
        let registry = BillTypeRegistry::load(config.bill_types_path())?;
        let source = build_source(&config, &registry)?;
        Ok(Self::new(config, registry, source, store))
    }

    /// [`SyncEngine::load`] backed by Postgres at `DATABASE_URL`.
    pub async fn connect(config: SyncConfig) -> Result<Self> {
        let store = PgSyncStore::connect(&config.database_url)
            .await
            .context("connecting to sync database")?;
        Self::load(config, Arc::new(store))
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn registry(&self) -> &BillTypeRegistry {
        &self.registry
    }

    pub fn store(&self) -> Arc<dyn SyncStore> {
        self.store.clone()
    }

    pub async fn resolve_plan(&self) -> Result<Vec<TypeRange>> {
        self.registry.resolve_plan(self.source.as_ref()).await
    }

    /// Controller whose new jobs cover `plan`.
    pub fn controller(&self, plan: Vec<TypeRange>) -> JobController {
        let processor = BatchProcessor::new(
            self.store.clone(),
            self.source.clone(),
            self.config.session.clone(),
            self.config.batch_config(),
        )
        .with_artifacts(ArtifactStore::new(self.config.artifacts_dir.join("failed")));
        JobController::new(self.store.clone(), processor).with_plan(plan)
    }
}

fn build_source(config: &SyncConfig, registry: &BillTypeRegistry) -> Result<Arc<dyn RemoteSource>> {
    let layout = registry.layout(&config.session);
    if let Some(root) = &config.mirror_dir {
        info!(mirror = %root.display(), "reading documents from local mirror");
        return Ok(Arc::new(MirrorSource::new(root.clone(), layout)));
    }
    let http = HttpFetcher::new(config.http_client_config()).context("building http client")?;
    Ok(Arc::new(LegislatureSource::new(
        layout,
        FtpFetcher::new(config.ftp_config()),
        Arc::new(http),
    )))
}
