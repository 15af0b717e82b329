use crate::catalog::{CatalogReader, ListingTableRegistry};
use crate::enrich::apply_join_strategy;
use crate::planner::PartitionPlan;
use crate::storage::StorageManager;
use crate::udf::register_udfs;
use common::Result;
use common::config::Settings;
use datafusion::execution::context::{SessionConfig, SessionContext};
use std::sync::Arc;
use tracing::debug;

/// The query session for one run together with its catalog and storage access.
pub struct EtlContext {
    pub ctx: Arc<SessionContext>,
    pub storage: StorageManager,
    pub catalog: CatalogReader,
}

impl EtlContext {
    pub fn new(settings: &Settings, plan: &PartitionPlan) -> Result<Self> {
        let config = SessionConfig::new()
            .with_target_partitions(plan.target_partitions)
            .with_information_schema(false);
        let config = apply_join_strategy(config, settings.job.join_strategy);

        let ctx = Arc::new(SessionContext::new_with_config(config));
        register_udfs(&ctx, &settings.job.timestamp_format)?;

        let storage = StorageManager::new(settings.storage.s3.clone());
        let catalog = CatalogReader::new(
            ctx.clone(),
            settings.catalog.tables.clone(),
            Arc::new(ListingTableRegistry),
            storage.clone(),
        );

        debug!(
            target_partitions = plan.target_partitions,
            join_strategy = ?settings.job.join_strategy,
            "Created session context"
        );

        Ok(Self {
            ctx,
            storage,
            catalog,
        })
    }

    /// Releases every table registered during the run.
    pub async fn close(self) -> Result<()> {
        self.catalog.close().await
    }
}
