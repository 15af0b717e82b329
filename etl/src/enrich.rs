use crate::mapping::column;
use crate::udf::{PARSE_TIMESTAMP, timestamp_type};
use common::config::JoinStrategy;
use common::{Error, Result};
use datafusion::arrow::datatypes::DataType;
use datafusion::execution::FunctionRegistry;
use datafusion::execution::context::SessionConfig;
use datafusion::functions::datetime::expr_fn::date_part;
use datafusion::prelude::*;
use std::collections::HashMap;
use tracing::debug;

pub const PICKUP_TIMESTAMP: &str = "tpep_pickup_datetime";
pub const DROPOFF_TIMESTAMP: &str = "tpep_dropoff_datetime";

/// Raw columns that have a renamed or derived replacement in the output.
pub const DROPPED_COLUMNS: [&str; 11] = [
    "pulocationid",
    "dolocationid",
    "pu_locationid",
    "do_locationid",
    "payment_type",
    "payment_type_id",
    "ratecodeid",
    "ratecode_id",
    PICKUP_TIMESTAMP,
    DROPOFF_TIMESTAMP,
    "store_and_fwd_flag",
];

/// Columns added from the parsed pickup and drop-off timestamps.
pub const DERIVED_COLUMNS: [&str; 5] = ["pu_datetime", "do_datetime", "pu_year", "pu_month", "pu_day"];

pub const PICKUP_ZONE_KEY: &str = "pu_locationid";
pub const DROPOFF_ZONE_KEY: &str = "do_locationid";
pub const PAYMENT_TYPE_KEY: &str = "payment_type_id";
pub const RATE_CODE_KEY: &str = "ratecode_id";

/// The four mapped lookup datasets, one per join role.
pub struct MappedLookups {
    pub pickup_zone: DataFrame,
    pub dropoff_zone: DataFrame,
    pub payment_type: DataFrame,
    pub rate_code: DataFrame,
}

/// One inner join: `fact_key = lookup_key`.
pub struct LookupJoin {
    pub role: &'static str,
    pub fact_key: &'static str,
    pub lookup_key: &'static str,
    pub lookup: DataFrame,
}

impl MappedLookups {
    /// Joins in the order they are applied.
    pub fn into_joins(self) -> Vec<LookupJoin> {
        vec![
            LookupJoin {
                role: "pickup_zone",
                fact_key: "pulocationid",
                lookup_key: PICKUP_ZONE_KEY,
                lookup: self.pickup_zone,
            },
            LookupJoin {
                role: "dropoff_zone",
                fact_key: "dolocationid",
                lookup_key: DROPOFF_ZONE_KEY,
                lookup: self.dropoff_zone,
            },
            LookupJoin {
                role: "payment_type",
                fact_key: "payment_type",
                lookup_key: PAYMENT_TYPE_KEY,
                lookup: self.payment_type,
            },
            LookupJoin {
                role: "rate_code",
                fact_key: "ratecodeid",
                lookup_key: RATE_CODE_KEY,
                lookup: self.rate_code,
            },
        ]
    }
}

/// Applies the join strategy hint to an engine session. The result of a
/// query is the same under either strategy.
pub fn apply_join_strategy(config: SessionConfig, strategy: JoinStrategy) -> SessionConfig {
    match strategy {
        // Without join repartitioning every hash join collects its build side
        // once and shares it with all probe partitions.
        JoinStrategy::Broadcast => config.with_repartition_joins(false),
        JoinStrategy::Partitioned => {
            let mut config = config.with_repartition_joins(true);
            let optimizer = &mut config.options_mut().optimizer;
            optimizer.hash_join_single_partition_threshold = 0;
            optimizer.hash_join_single_partition_threshold_rows = 0;
            config
        }
    }
}

pub struct JoinEnricher;

impl JoinEnricher {
    pub fn new() -> Self {
        Self
    }

    /// Joins the fact dataset with every lookup, derives the timestamp and
    /// calendar columns, drops the raw ones and orders by pickup date.
    /// Fact rows without a match in any lookup are excluded.
    pub fn enrich(&self, fact: DataFrame, lookups: MappedLookups) -> Result<DataFrame> {
        let joins = lookups.into_joins();
        check_unique_columns(&fact, &joins)?;

        let mut df = fact;
        for join in joins {
            if df.schema().field_with_unqualified_name(join.fact_key).is_err() {
                return Err(Error::Mapping(format!(
                    "Join key '{}' for {} is missing from the fact table",
                    join.fact_key, join.role
                )));
            }
            let lookup_type = join
                .lookup
                .schema()
                .field_with_unqualified_name(join.lookup_key)
                .map(|f| f.data_type().clone())
                .map_err(|_| {
                    Error::Mapping(format!(
                        "Join key '{}' is missing from the {} lookup",
                        join.lookup_key, join.role
                    ))
                })?;

            // Source files disagree on key types (RatecodeID is often a double).
            let fact_type = df.schema().field_with_unqualified_name(join.fact_key)?.data_type().clone();
            if fact_type != lookup_type {
                df = df.with_column(join.fact_key, aligned_key(join.fact_key, &fact_type, &lookup_type)?)?;
            }

            debug!(role = join.role, fact_key = join.fact_key, lookup_key = join.lookup_key, "Adding lookup join");
            df = df.join(
                join.lookup,
                JoinType::Inner,
                &[join.fact_key],
                &[join.lookup_key],
                None,
            )?;
        }

        let pickup = timestamp_expr(&df, PICKUP_TIMESTAMP)?;
        let dropoff = timestamp_expr(&df, DROPOFF_TIMESTAMP)?;

        let df = df
            .with_column("pu_datetime", pickup)?
            .with_column("do_datetime", dropoff)?
            .with_column("pu_year", calendar_part("year"))?
            .with_column("pu_month", calendar_part("month"))?
            .with_column("pu_day", calendar_part("day"))?
            .drop_columns(&DROPPED_COLUMNS)?
            .sort(vec![
                col("pu_year").sort(true, false),
                col("pu_month").sort(true, false),
                col("pu_day").sort(true, false),
            ])?;

        Ok(df)
    }
}

impl Default for JoinEnricher {
    fn default() -> Self {
        Self::new()
    }
}

/// Timestamp for a raw column: cast if it already holds timestamps, parsed otherwise.
fn timestamp_expr(df: &DataFrame, name: &str) -> Result<Expr> {
    let field = df.schema().field_with_unqualified_name(name).map_err(|_| {
        Error::Mapping(format!("Timestamp column '{}' is missing from the fact table", name))
    })?;

    let expr = match field.data_type() {
        DataType::Timestamp(_, _) | DataType::Date32 | DataType::Date64 => {
            cast(column(name), timestamp_type())
        }
        _ => {
            let parse = df.registry().udf(PARSE_TIMESTAMP)?;
            parse.call(vec![cast(column(name), DataType::Utf8)])
        }
    };
    Ok(expr)
}

/// Fact key converted to the lookup key type without loss. Values that do not
/// survive the round trip (`"N/A"`, `1.5`) become null and match nothing.
fn aligned_key(name: &str, fact_type: &DataType, lookup_type: &DataType) -> Result<Expr> {
    let (source, source_type) = match fact_type {
        DataType::LargeUtf8 | DataType::Utf8View => (cast(column(name), DataType::Utf8), DataType::Utf8),
        other => (column(name), other.clone()),
    };
    let converted = try_cast(source.clone(), lookup_type.clone());
    let round_trip = try_cast(converted.clone(), source_type);
    Ok(when(round_trip.eq(source), converted).end()?)
}

fn calendar_part(part: &str) -> Expr {
    cast(date_part(lit(part), col("pu_datetime")), DataType::Int32)
}

fn check_unique_columns(fact: &DataFrame, joins: &[LookupJoin]) -> Result<()> {
    let mut owners: HashMap<String, &str> = HashMap::new();
    let sources = std::iter::once(("fact", fact)).chain(joins.iter().map(|j| (j.role, &j.lookup)));

    for (source, df) in sources {
        for field in df.schema().fields() {
            if let Some(previous) = owners.insert(field.name().clone(), source) {
                return Err(Error::Mapping(format!(
                    "Column '{}' appears in both {} and {}",
                    field.name(),
                    previous,
                    source
                )));
            }
        }
    }
    Ok(())
}
