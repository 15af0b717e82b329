pub mod partition;
pub mod writer;

use crate::planner::PartitionPlan;
use crate::storage::{Location, StorageManager};
use common::config::NullPartitionPolicy;
use common::{Error, Result};
use datafusion::arrow::datatypes::{DataType, Schema, SchemaRef};
use datafusion::datasource::file_format::parquet::ParquetFormat;
use datafusion::datasource::listing::{
    ListingOptions, ListingTable, ListingTableConfig, ListingTableUrl,
};
use datafusion::prelude::*;
use futures::{StreamExt, TryStreamExt};
use object_store::ObjectStore;
use object_store::path::Path;
use partition::{PartitionKey, split_batch};
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};
use writer::{PART_FILE_NAME, PartitionFileWriter, PartitionStats, writer_properties};

pub const STAGING_DIR: &str = "_temporary";
pub const SUCCESS_MARKER: &str = "_SUCCESS";

/// Partition files fully written to the staging area of one run, not yet visible.
#[derive(Debug)]
pub struct StagedOutput {
    pub run_id: String,
    pub staging: Path,
    pub partitions: Vec<PartitionStats>,
    pub rows_dropped: usize,
}

impl StagedOutput {
    pub fn rows_written(&self) -> usize {
        self.partitions.iter().map(|p| p.rows).sum()
    }
}

/// Writes the enriched dataset as Hive-partitioned Parquet and replaces the
/// destination contents atomically from the reader's point of view.
pub struct SinkWriter {
    location: Location,
    storage: StorageManager,
    plan: PartitionPlan,
}

impl SinkWriter {
    pub fn new(location: Location, storage: StorageManager, plan: PartitionPlan) -> Self {
        Self {
            location,
            storage,
            plan,
        }
    }

    pub fn location(&self) -> &Location {
        &self.location
    }

    fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.location.store
    }

    fn staging_prefix(&self, run_id: &str) -> Path {
        self.location.prefix.child(STAGING_DIR).child(run_id)
    }

    fn file_schema(&self, schema: &Schema) -> SchemaRef {
        let fields: Vec<_> = schema
            .fields()
            .iter()
            .filter(|f| !self.plan.partition_by.contains(f.name()))
            .cloned()
            .collect();
        Arc::new(Schema::new_with_metadata(fields, schema.metadata().clone()))
    }

    /// Executes `df` and writes every partition under the run's staging
    /// directory. Nothing outside the staging directory is touched; on
    /// failure the staging directory is removed.
    pub async fn stage(&self, df: DataFrame, run_id: &str) -> Result<StagedOutput> {
        let staging = self.staging_prefix(run_id);
        match self.write_partitions(df, run_id, &staging).await {
            Ok(staged) => Ok(staged),
            Err(e) => {
                warn!(run_id, error = %e, "Write failed, removing staged files");
                self.abort(&staging).await;
                Err(e)
            }
        }
    }

    async fn write_partitions(
        &self,
        df: DataFrame,
        run_id: &str,
        staging: &Path,
    ) -> Result<StagedOutput> {
        let schema: Schema = df.schema().as_arrow().clone();
        let file_schema = self.file_schema(&schema);
        let props = writer_properties(run_id);

        // Input arrives ordered by partition key, so one file is open at a time.
        let mut current: Option<PartitionFileWriter> = None;
        let mut partitions: Vec<PartitionStats> = Vec::new();
        let mut rows_dropped = 0;

        let mut stream = df.execute_stream().await?;
        while let Some(batch) = stream.next().await {
            let batch = batch?;
            for (key, part) in split_batch(&batch, &self.plan.partition_by)? {
                if key.has_null() && self.plan.null_partitions == NullPartitionPolicy::Drop {
                    rows_dropped += part.num_rows();
                    continue;
                }

                let writer = match current.take() {
                    Some(writer) if writer.key() == key => writer,
                    previous => {
                        if let Some(previous) = previous {
                            partitions.push(previous.close().await?);
                        }
                        if partitions.last().is_some_and(|p| p.key >= key) {
                            return Err(Error::InvalidInput(format!(
                                "Partition {} arrived out of order; input must be sorted by {}",
                                key,
                                self.plan.partition_by.join(", ")
                            )));
                        }
                        PartitionFileWriter::try_new(
                            self.store().clone(),
                            key,
                            key.file_path(staging, PART_FILE_NAME),
                            file_schema.clone(),
                            props.clone(),
                            self.plan.row_group_bytes,
                        )?
                    }
                };
                current.insert(writer).write(&part).await?;
            }
        }

        if let Some(writer) = current {
            partitions.push(writer.close().await?);
        }

        if rows_dropped > 0 {
            info!(rows = rows_dropped, "Dropped rows with a null partition key");
        }

        Ok(StagedOutput {
            run_id: run_id.to_string(),
            staging: staging.clone(),
            partitions,
            rows_dropped,
        })
    }

    /// Replaces the destination contents with the staged partitions and
    /// writes `marker` as the `_SUCCESS` object.
    pub async fn commit<M: Serialize>(&self, staged: &StagedOutput, marker: &M) -> Result<()> {
        match self.publish(staged, marker).await {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(run_id = %staged.run_id, error = %e, "Commit failed, removing staged files");
                self.abort(&staged.staging).await;
                Err(e)
            }
        }
    }

    async fn publish<M: Serialize>(&self, staged: &StagedOutput, marker: &M) -> Result<()> {
        let store = self.store();
        let marker = serde_json::to_vec_pretty(marker)?;

        // Previous output, and staging areas left behind by failed runs.
        let staging_prefix = format!("{}/", staged.staging);
        let stale: Vec<Path> = store
            .list(Some(&self.location.prefix))
            .map_ok(|meta| meta.location)
            .try_filter(|path| futures::future::ready(!path.as_ref().starts_with(&staging_prefix)))
            .try_collect()
            .await?;
        for path in &stale {
            store.delete(path).await?;
        }
        debug!(deleted = stale.len(), "Cleared previous destination contents");

        for stats in &staged.partitions {
            let from = stats.key.file_path(&staged.staging, PART_FILE_NAME);
            let to = stats.key.file_path(&self.location.prefix, PART_FILE_NAME);
            store.rename(&from, &to).await?;
        }

        store
            .put(&self.location.prefix.child(SUCCESS_MARKER), marker.into())
            .await?;

        self.storage.prune_empty_dirs(&self.location).await?;

        info!(
            destination = %self.location.url,
            partitions = staged.partitions.len(),
            rows = staged.rows_written(),
            "Committed output"
        );
        Ok(())
    }

    async fn abort(&self, staging: &Path) {
        let store = self.store();
        let staged: Vec<Path> = match store
            .list(Some(staging))
            .map_ok(|meta| meta.location)
            .try_collect()
            .await
        {
            Ok(paths) => paths,
            Err(e) => {
                warn!(error = %e, "Cannot list staged files");
                return;
            }
        };

        for path in staged {
            if let Err(e) = store.delete(&path).await {
                warn!(path = %path, error = %e, "Cannot delete staged file");
            }
        }
        if let Err(e) = self.storage.prune_empty_dirs(&self.location).await {
            warn!(error = %e, "Cannot remove empty staging directories");
        }
    }
}

/// Reads committed output back with `pu_year` and `pu_month` recovered from
/// the directory names. Default partitions read as null.
pub async fn read_partitioned(
    ctx: &SessionContext,
    storage: &StorageManager,
    destination: &str,
) -> Result<DataFrame> {
    let location = storage.resolve(destination)?;
    storage.register_object_store(ctx, &location.url)?;

    let table_url = ListingTableUrl::parse(location.url.as_str())?;
    let options = ListingOptions::new(Arc::new(ParquetFormat::default()))
        .with_file_extension(".parquet")
        .with_table_partition_cols(vec![
            ("pu_year".to_string(), DataType::Utf8),
            ("pu_month".to_string(), DataType::Utf8),
        ]);

    let config = ListingTableConfig::new(table_url)
        .with_listing_options(options)
        .infer_schema(&ctx.state())
        .await?;
    let table = Arc::new(ListingTable::try_new(config)?);

    let df = ctx
        .read_table(table)?
        .with_column("pu_year", try_cast(col("pu_year"), DataType::Int32))?
        .with_column("pu_month", try_cast(col("pu_month"), DataType::Int32))?;
    Ok(df)
}

/// Lists the partition keys present under a committed destination.
pub async fn list_partitions(
    storage: &StorageManager,
    destination: &str,
) -> Result<Vec<PartitionKey>> {
    let location = storage.resolve(destination)?;
    let staging = format!("{}/", location.prefix.child(STAGING_DIR));

    let paths: Vec<Path> = location
        .store
        .list(Some(&location.prefix))
        .map_ok(|meta| meta.location)
        .try_collect()
        .await?;

    let keys: BTreeSet<PartitionKey> = paths
        .iter()
        .filter(|path| !path.as_ref().starts_with(&staging))
        .filter(|path| path.filename() == Some(PART_FILE_NAME))
        .filter_map(|path| PartitionKey::from_path(path.as_ref()))
        .collect();
    Ok(keys.into_iter().collect())
}
