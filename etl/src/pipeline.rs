use crate::context::EtlContext;
use crate::enrich::{
    DROPOFF_ZONE_KEY, JoinEnricher, MappedLookups, PAYMENT_TYPE_KEY, PICKUP_ZONE_KEY, RATE_CODE_KEY,
};
use crate::mapping::{LookupSpecs, SchemaMapper};
use crate::planner::PartitionPlan;
use crate::sink::SinkWriter;
use crate::sink::writer::PartitionStats;
use chrono::{DateTime, Utc};
use common::Result;
use common::config::{JoinStrategy, NullPartitionPolicy, Settings};
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

/// Outcome of one run. Also written as the `_SUCCESS` marker of the output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub destination: String,
    pub join_strategy: JoinStrategy,
    pub null_partitions: NullPartitionPolicy,
    pub target_partitions: usize,
    /// Fact rows read. Only known when the fact table is cached.
    pub fact_rows: Option<usize>,
    /// Fact rows without a match in at least one lookup.
    pub unmatched_rows: Option<usize>,
    pub null_partition_rows: usize,
    pub rows_written: usize,
    pub partitions: Vec<PartitionStats>,
}

pub struct Pipeline {
    settings: Settings,
    plan: PartitionPlan,
}

impl Pipeline {
    pub fn new(settings: Settings) -> Self {
        let plan = PartitionPlan::from_job(&settings.job);
        Self { settings, plan }
    }

    pub async fn run(&self) -> Result<RunSummary> {
        let run_id = Uuid::new_v4().to_string();
        info!(
            run_id = %run_id,
            destination = %self.settings.job.destination,
            target_partitions = self.plan.target_partitions,
            "Starting ETL run"
        );

        let etl = EtlContext::new(&self.settings, &self.plan)?;
        let result = self.execute(&etl, &run_id).await;

        if let Err(e) = etl.close().await {
            warn!(run_id = %run_id, error = %e, "Failed to release catalog tables");
        }
        result
    }

    async fn execute(&self, etl: &EtlContext, run_id: &str) -> Result<RunSummary> {
        let started_at = Utc::now();
        let timer = Instant::now();
        let job = &self.settings.job;

        let location = etl.storage.resolve(&job.destination)?;
        etl.storage.verify_destination(&location).await?;

        // Resolve every input before any transform runs.
        let fact = etl.catalog.read(&job.fact_table).await?;
        let zones = etl.catalog.read(&job.taxi_zone_table).await?;
        let payment_types = etl.catalog.read(&job.payment_type_table).await?;
        let rate_codes = etl.catalog.read(&job.rate_code_table).await?;

        let specs = LookupSpecs::from_overrides(&self.settings.mappings)?;
        let mapper = SchemaMapper::new(etl.ctx.clone());
        let lookups = MappedLookups {
            pickup_zone: mapper.apply_keyed(zones.clone(), &specs.pickup_zone, PICKUP_ZONE_KEY).await?,
            dropoff_zone: mapper.apply_keyed(zones, &specs.dropoff_zone, DROPOFF_ZONE_KEY).await?,
            payment_type: mapper
                .apply_keyed(payment_types, &specs.payment_type, PAYMENT_TYPE_KEY)
                .await?,
            rate_code: mapper.apply_keyed(rate_codes, &specs.rate_code, RATE_CODE_KEY).await?,
        };

        let fact = self.plan.shard(fact)?;
        let (fact, fact_rows) = if job.cache_facts {
            let cached = fact.cache().await?;
            let rows = cached.clone().count().await?;
            info!(rows, "Cached fact table");
            (cached, Some(rows))
        } else {
            (fact, None)
        };

        let enriched = JoinEnricher::new().enrich(fact, lookups)?;

        let sink = SinkWriter::new(location, etl.storage.clone(), self.plan.clone());
        let staged = sink.stage(enriched, run_id).await?;

        let rows_written = staged.rows_written();
        let unmatched_rows =
            fact_rows.map(|rows| rows.saturating_sub(rows_written + staged.rows_dropped));
        if let Some(unmatched) = unmatched_rows {
            info!(rows = unmatched, "Fact rows without a lookup match were excluded");
        }

        let summary = RunSummary {
            run_id: run_id.to_string(),
            started_at,
            finished_at: Utc::now(),
            destination: sink.location().url.to_string(),
            join_strategy: job.join_strategy,
            null_partitions: job.null_partitions,
            target_partitions: self.plan.target_partitions,
            fact_rows,
            unmatched_rows,
            null_partition_rows: staged.rows_dropped,
            rows_written,
            partitions: staged.partitions.clone(),
        };
        sink.commit(&staged, &summary).await?;

        info!(
            run_id,
            rows = rows_written,
            partitions = summary.partitions.len(),
            elapsed_ms = timer.elapsed().as_millis() as u64,
            "ETL run finished"
        );
        Ok(summary)
    }
}
