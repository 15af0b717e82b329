pub mod catalog;
pub mod context;
pub mod enrich;
pub mod mapping;
pub mod pipeline;
pub mod planner;
pub mod sink;
pub mod storage;
pub mod udf;

#[cfg(test)]
pub(crate) mod testing;

use common::Result;
use common::config::Settings;
use pipeline::{Pipeline, RunSummary};
use sink::partition::PartitionKey;
use storage::StorageManager;

/// Loads settings from `config_path` and runs the pipeline once.
pub async fn run_etl_pipeline(config_path: &str) -> Result<RunSummary> {
    let settings = Settings::new(config_path)?;
    Pipeline::new(settings).run().await
}

/// Partition keys committed at the configured destination.
pub async fn list_output_partitions(config_path: &str) -> Result<Vec<PartitionKey>> {
    let settings = Settings::new(config_path)?;
    let storage = StorageManager::new(settings.storage.s3.clone());
    sink::list_partitions(&storage, &settings.job.destination).await
}
