use common::Result;
use common::config::{JobConfig, NullPartitionPolicy};
use datafusion::prelude::*;
use tracing::warn;

pub const PARTITION_COLUMNS: [&str; 2] = ["pu_year", "pu_month"];

pub const MIN_ROW_GROUP_BYTES: usize = 16 * 1024 * 1024;
pub const MAX_ROW_GROUP_BYTES: usize = 64 * 1024 * 1024;

/// Static physical layout of a run. Nothing here looks at the data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionPlan {
    pub target_partitions: usize,
    pub partition_by: Vec<String>,
    pub row_group_bytes: usize,
    pub null_partitions: NullPartitionPolicy,
}

impl PartitionPlan {
    pub fn from_job(job: &JobConfig) -> Self {
        let target_partitions = job
            .target_partitions
            .unwrap_or_else(default_target_partitions)
            .max(1);

        let row_group_bytes = job
            .row_group_bytes
            .clamp(MIN_ROW_GROUP_BYTES, MAX_ROW_GROUP_BYTES);
        if row_group_bytes != job.row_group_bytes {
            warn!(
                requested = job.row_group_bytes,
                applied = row_group_bytes,
                "row_group_bytes outside the 16-64 MiB range, clamped"
            );
        }

        Self {
            target_partitions,
            partition_by: PARTITION_COLUMNS.iter().map(|c| c.to_string()).collect(),
            row_group_bytes,
            null_partitions: job.null_partitions,
        }
    }

    /// Splits the fact dataset into `target_partitions` shards ahead of the joins.
    pub fn shard(&self, df: DataFrame) -> Result<DataFrame> {
        Ok(df.repartition(Partitioning::RoundRobinBatch(self.target_partitions))?)
    }
}

fn default_target_partitions() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        * 2
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::config::Settings;
    use datafusion::arrow::array::Int32Array;
    use datafusion::arrow::datatypes::{DataType, Field, Schema};
    use datafusion::arrow::record_batch::RecordBatch;
    use datafusion::physical_plan::ExecutionPlanProperties;
    use std::sync::Arc;

    fn job(extra: &str) -> JobConfig {
        Settings::from_toml_str(&format!(
            "[job]\ndestination = \"/tmp/out\"\n{}",
            extra
        ))
        .unwrap()
        .job
    }

    #[test]
    fn test_defaults() {
        let plan = PartitionPlan::from_job(&job(""));
        assert_eq!(plan.partition_by, vec!["pu_year", "pu_month"]);
        assert_eq!(plan.row_group_bytes, 32 * 1024 * 1024);
        assert_eq!(plan.null_partitions, NullPartitionPolicy::Drop);
        assert!(plan.target_partitions >= 2);
        assert_eq!(plan.target_partitions % 2, 0);
    }

    #[test]
    fn test_explicit_width() {
        let plan = PartitionPlan::from_job(&job("target_partitions = 3"));
        assert_eq!(plan.target_partitions, 3);
    }

    #[test]
    fn test_row_group_bytes_clamped() {
        let small = PartitionPlan::from_job(&job("row_group_bytes = 1024"));
        assert_eq!(small.row_group_bytes, MIN_ROW_GROUP_BYTES);

        let large = PartitionPlan::from_job(&job("row_group_bytes = 1073741824"));
        assert_eq!(large.row_group_bytes, MAX_ROW_GROUP_BYTES);

        let in_range = PartitionPlan::from_job(&job("row_group_bytes = 20000000"));
        assert_eq!(in_range.row_group_bytes, 20_000_000);
    }

    #[tokio::test]
    async fn test_shard_sets_partition_count() {
        let ctx = SessionContext::new();
        let plan = PartitionPlan::from_job(&job("target_partitions = 4"));
        let batch = RecordBatch::try_new(
            Arc::new(Schema::new(vec![Field::new("a", DataType::Int32, false)])),
            vec![Arc::new(Int32Array::from(vec![1, 2, 3]))],
        )
        .unwrap();
        let df = ctx.read_batch(batch).unwrap();

        let sharded = plan.shard(df).unwrap();
        let physical = sharded.create_physical_plan().await.unwrap();
        assert_eq!(physical.output_partitioning().partition_count(), 4);
    }
}
