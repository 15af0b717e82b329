use crate::udf::timestamp_type;
use common::config::{ColumnMappingConfig, MappingOverrides};
use common::{Error, Result};
use datafusion::arrow::array::AsArray;
use datafusion::arrow::compute::{CastOptions, can_cast_types, cast, cast_with_options};
use datafusion::arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use datafusion::arrow::record_batch::RecordBatch;
use datafusion::common::Column;
use datafusion::datasource::MemTable;
use datafusion::prelude::*;
use std::collections::HashSet;
use std::str::FromStr;
use std::sync::Arc;
use tracing::debug;

/// Logical column types accepted in mapping declarations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    String,
    Int,
    Long,
    Double,
    Boolean,
    Timestamp,
}

impl ColumnType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Int => "int",
            Self::Long => "long",
            Self::Double => "double",
            Self::Boolean => "boolean",
            Self::Timestamp => "timestamp",
        }
    }

    pub fn to_arrow(&self) -> DataType {
        match self {
            Self::String => DataType::Utf8,
            Self::Int => DataType::Int32,
            Self::Long => DataType::Int64,
            Self::Double => DataType::Float64,
            Self::Boolean => DataType::Boolean,
            Self::Timestamp => timestamp_type(),
        }
    }

    /// Whether a physical column type can be declared as this logical type.
    pub fn accepts(&self, data_type: &DataType) -> bool {
        match self {
            Self::String => matches!(
                data_type,
                DataType::Utf8 | DataType::LargeUtf8 | DataType::Utf8View
            ),
            Self::Int | Self::Long => data_type.is_integer(),
            Self::Double => data_type.is_integer() || data_type.is_floating(),
            Self::Boolean => matches!(data_type, DataType::Boolean),
            Self::Timestamp => matches!(
                data_type,
                DataType::Timestamp(_, _) | DataType::Date32 | DataType::Date64
            ),
        }
    }
}

impl FromStr for ColumnType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "string" | "varchar" | "utf8" => Ok(Self::String),
            "int" | "integer" | "int32" => Ok(Self::Int),
            "long" | "bigint" | "int64" => Ok(Self::Long),
            "double" | "float64" => Ok(Self::Double),
            "boolean" | "bool" => Ok(Self::Boolean),
            "timestamp" => Ok(Self::Timestamp),
            other => Err(Error::Mapping(format!("Unknown column type '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnMapping {
    pub source_name: String,
    pub source_type: ColumnType,
    pub target_name: String,
    pub target_type: ColumnType,
}

impl ColumnMapping {
    pub fn new(
        source_name: &str,
        source_type: ColumnType,
        target_name: &str,
        target_type: ColumnType,
    ) -> Self {
        Self {
            source_name: source_name.to_string(),
            source_type,
            target_name: target_name.to_string(),
            target_type,
        }
    }
}

impl TryFrom<&ColumnMappingConfig> for ColumnMapping {
    type Error = Error;

    fn try_from(config: &ColumnMappingConfig) -> Result<Self> {
        Ok(Self {
            source_name: config.source_name.trim().to_ascii_lowercase(),
            source_type: config.source_type.parse()?,
            target_name: config.target_name.trim().to_string(),
            target_type: config.target_type.parse()?,
        })
    }
}

/// Ordered rename/retype projection for one lookup table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingSpec {
    pub name: String,
    pub mappings: Vec<ColumnMapping>,
}

impl MappingSpec {
    pub fn new(name: &str, mappings: Vec<ColumnMapping>) -> Result<Self> {
        let spec = Self {
            name: name.to_string(),
            mappings,
        };
        spec.validate()?;
        Ok(spec)
    }

    pub fn from_config(name: &str, entries: &[ColumnMappingConfig]) -> Result<Self> {
        let mappings = entries
            .iter()
            .map(ColumnMapping::try_from)
            .collect::<Result<Vec<_>>>()?;
        Self::new(name, mappings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.mappings.is_empty() {
            return Err(Error::Mapping(format!(
                "Mapping '{}' declares no columns",
                self.name
            )));
        }

        let mut targets = HashSet::new();
        for mapping in &self.mappings {
            if mapping.source_name.is_empty() || mapping.target_name.is_empty() {
                return Err(Error::Mapping(format!(
                    "Mapping '{}' contains an empty column name",
                    self.name
                )));
            }
            if !targets.insert(mapping.target_name.as_str()) {
                return Err(Error::Mapping(format!(
                    "Mapping '{}' produces column '{}' more than once",
                    self.name, mapping.target_name
                )));
            }
        }
        Ok(())
    }

    pub fn target_names(&self) -> Vec<&str> {
        self.mappings.iter().map(|m| m.target_name.as_str()).collect()
    }

    pub fn target_schema(&self) -> SchemaRef {
        Arc::new(Schema::new(
            self.mappings
                .iter()
                .map(|m| Field::new(&m.target_name, m.target_type.to_arrow(), true))
                .collect::<Vec<_>>(),
        ))
    }

    /// Taxi-zone lookup in one join role; `prefix` is `pu` or `do`.
    pub fn taxi_zone(prefix: &str) -> Self {
        use ColumnType::{Long, String};
        Self {
            name: format!("{}_taxi_zone", prefix),
            mappings: vec![
                ColumnMapping::new("locationid", Long, &format!("{}_locationid", prefix), Long),
                ColumnMapping::new("borough", String, &format!("{}_borough", prefix), String),
                ColumnMapping::new("zone", String, &format!("{}_zone", prefix), String),
                ColumnMapping::new(
                    "service_zone",
                    String,
                    &format!("{}_service_zone", prefix),
                    String,
                ),
            ],
        }
    }

    pub fn payment_type() -> Self {
        use ColumnType::{Long, String};
        Self {
            name: "payment_type".to_string(),
            mappings: vec![
                ColumnMapping::new("payment_type", Long, "payment_type_id", Long),
                ColumnMapping::new("payment_type_name", String, "payment_type_name", String),
            ],
        }
    }

    pub fn rate_code() -> Self {
        use ColumnType::{Long, String};
        Self {
            name: "rate_code".to_string(),
            mappings: vec![
                ColumnMapping::new("ratecodeid", Long, "ratecode_id", Long),
                ColumnMapping::new("ratecode_name", String, "ratecode_name", String),
            ],
        }
    }
}

/// The mapping applied to each lookup role of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LookupSpecs {
    pub pickup_zone: MappingSpec,
    pub dropoff_zone: MappingSpec,
    pub payment_type: MappingSpec,
    pub rate_code: MappingSpec,
}

impl LookupSpecs {
    /// Built-in specs, replaced role by role where the configuration declares one.
    pub fn from_overrides(overrides: &MappingOverrides) -> Result<Self> {
        let pick = |name: &str, entries: &Option<Vec<ColumnMappingConfig>>, default: MappingSpec| {
            match entries {
                Some(entries) => MappingSpec::from_config(name, entries),
                None => Ok(default),
            }
        };

        Ok(Self {
            pickup_zone: pick("pickup_zone", &overrides.pickup_zone, MappingSpec::taxi_zone("pu"))?,
            dropoff_zone: pick("dropoff_zone", &overrides.dropoff_zone, MappingSpec::taxi_zone("do"))?,
            payment_type: pick("payment_type", &overrides.payment_type, MappingSpec::payment_type())?,
            rate_code: pick("rate_code", &overrides.rate_code, MappingSpec::rate_code())?,
        })
    }
}

pub(crate) fn column(name: &str) -> Expr {
    Expr::Column(Column::from_name(name))
}

pub struct SchemaMapper {
    ctx: Arc<SessionContext>,
}

impl SchemaMapper {
    pub fn new(ctx: Arc<SessionContext>) -> Self {
        Self { ctx }
    }

    /// Projects a lookup dataset onto `spec`. The lookup is small, so it is
    /// materialized here and every cast error surfaces before any join runs.
    pub async fn apply(&self, df: DataFrame, spec: &MappingSpec) -> Result<DataFrame> {
        self.project(df, spec, None).await
    }

    /// Like [`apply`](Self::apply), and also requires every non-null value of
    /// the `key` target column to be unique so that a join on it never
    /// multiplies fact rows.
    pub async fn apply_keyed(&self, df: DataFrame, spec: &MappingSpec, key: &str) -> Result<DataFrame> {
        if !spec.target_names().contains(&key) {
            return Err(Error::Mapping(format!(
                "Mapping '{}' does not produce join key '{}'",
                spec.name, key
            )));
        }
        self.project(df, spec, Some(key)).await
    }

    async fn project(&self, df: DataFrame, spec: &MappingSpec, key: Option<&str>) -> Result<DataFrame> {
        spec.validate()?;
        self.check_sources(&df, spec)?;

        let mut sources = Vec::new();
        for mapping in &spec.mappings {
            if !sources.contains(&mapping.source_name.as_str()) {
                sources.push(mapping.source_name.as_str());
            }
        }

        let batches = df
            .select(sources.iter().map(|name| column(name)).collect())?
            .collect()
            .await?;

        let target_schema = spec.target_schema();
        let mut mapped = Vec::with_capacity(batches.len());
        for batch in &batches {
            mapped.push(self.map_batch(batch, spec, &target_schema)?);
        }

        if let Some(key) = key {
            check_unique_key(&mapped, spec, key)?;
        }

        debug!(
            mapping = %spec.name,
            rows = mapped.iter().map(RecordBatch::num_rows).sum::<usize>(),
            "Mapped lookup table"
        );

        let table = MemTable::try_new(target_schema, vec![mapped])?;
        Ok(self.ctx.read_table(Arc::new(table))?)
    }

    fn check_sources(&self, df: &DataFrame, spec: &MappingSpec) -> Result<()> {
        for mapping in &spec.mappings {
            let field = df
                .schema()
                .field_with_unqualified_name(&mapping.source_name)
                .map_err(|_| {
                    Error::Mapping(format!(
                        "Mapping '{}': source column '{}' not found",
                        spec.name, mapping.source_name
                    ))
                })?;

            if !mapping.source_type.accepts(field.data_type()) {
                return Err(Error::Mapping(format!(
                    "Mapping '{}': column '{}' is {:?}, not {}",
                    spec.name,
                    mapping.source_name,
                    field.data_type(),
                    mapping.source_type.as_str()
                )));
            }

            let target = mapping.target_type.to_arrow();
            if !can_cast_types(&string_normalized(field.data_type()), &target) {
                return Err(Error::Mapping(format!(
                    "Mapping '{}': no coercion from {} to {} for column '{}'",
                    spec.name,
                    mapping.source_type.as_str(),
                    mapping.target_type.as_str(),
                    mapping.source_name
                )));
            }
        }
        Ok(())
    }

    fn map_batch(
        &self,
        batch: &RecordBatch,
        spec: &MappingSpec,
        target_schema: &SchemaRef,
    ) -> Result<RecordBatch> {
        let strict = CastOptions {
            safe: false,
            ..Default::default()
        };

        let mut columns = Vec::with_capacity(spec.mappings.len());
        for mapping in &spec.mappings {
            let source = batch.column(batch.schema().index_of(&mapping.source_name)?);
            let normalized = string_normalized(source.data_type());
            let source = if &normalized != source.data_type() {
                cast_with_options(source, &normalized, &strict)?
            } else {
                source.clone()
            };

            let target = cast_with_options(&source, &mapping.target_type.to_arrow(), &strict)
                .map_err(|e| {
                    Error::Mapping(format!(
                        "Mapping '{}': cannot coerce column '{}' to {}: {}",
                        spec.name,
                        mapping.source_name,
                        mapping.target_type.as_str(),
                        e
                    ))
                })?;
            columns.push(target);
        }

        Ok(RecordBatch::try_new(target_schema.clone(), columns)?)
    }
}

fn check_unique_key(batches: &[RecordBatch], spec: &MappingSpec, key: &str) -> Result<()> {
    let mut seen = HashSet::new();
    for batch in batches {
        let values = cast(batch.column(batch.schema().index_of(key)?), &DataType::Utf8)?;
        let values = values.as_string::<i32>();
        for value in values.iter().flatten() {
            if !seen.insert(value.to_string()) {
                return Err(Error::Mapping(format!(
                    "Mapping '{}': join key '{}' has duplicate value '{}'",
                    spec.name, key, value
                )));
            }
        }
    }
    Ok(())
}

fn string_normalized(data_type: &DataType) -> DataType {
    match data_type {
        DataType::LargeUtf8 | DataType::Utf8View => DataType::Utf8,
        other => other.clone(),
    }
}
