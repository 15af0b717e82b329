use config::{Config, ConfigError, FileFormat};
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    #[serde(default)]
    pub catalog: CatalogConfig,
    pub job: JobConfig,
    #[serde(default)]
    pub mappings: MappingOverrides,
    #[serde(default)]
    pub storage: StorageSettings,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct CatalogConfig {
    #[serde(default)]
    pub tables: Vec<CatalogTable>,
}

/// One table registered in the metadata catalog.
#[derive(Debug, Deserialize, Clone)]
pub struct CatalogTable {
    pub database: String,
    pub name: String,
    pub location: String,
    #[serde(default)]
    pub format: TableFormat,
    #[serde(default = "default_has_header")]
    pub has_header: bool,
    #[serde(default = "default_delimiter")]
    pub delimiter: char,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum TableFormat {
    #[default]
    Parquet,
    Csv,
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct TableRef {
    pub database: String,
    pub table: String,
}

impl TableRef {
    pub fn new(database: &str, table: &str) -> Self {
        Self {
            database: database.to_string(),
            table: table.to_string(),
        }
    }
}

impl std::fmt::Display for TableRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.database, self.table)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct JobConfig {
    #[serde(default = "default_fact_table")]
    pub fact_table: TableRef,
    #[serde(default = "default_taxi_zone_table")]
    pub taxi_zone_table: TableRef,
    #[serde(default = "default_payment_type_table")]
    pub payment_type_table: TableRef,
    #[serde(default = "default_rate_code_table")]
    pub rate_code_table: TableRef,
    pub destination: String,
    /// Shards the fact dataset is split into before the join. Derived from
    /// the host parallelism when unset.
    #[serde(default)]
    pub target_partitions: Option<usize>,
    #[serde(default = "default_row_group_bytes")]
    pub row_group_bytes: usize,
    #[serde(default = "default_timestamp_format")]
    pub timestamp_format: String,
    #[serde(default)]
    pub join_strategy: JoinStrategy,
    #[serde(default)]
    pub null_partitions: NullPartitionPolicy,
    #[serde(default = "default_cache_facts")]
    pub cache_facts: bool,
}

/// How lookup joins are physically executed. Never changes the result.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum JoinStrategy {
    /// Replicate the small lookup side to every fact partition.
    #[default]
    Broadcast,
    /// Hash-repartition both sides on the join keys.
    Partitioned,
}

/// What the sink does with rows whose partition key is null.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum NullPartitionPolicy {
    #[default]
    Drop,
    /// Keep them under the Hive default partition directory.
    Retain,
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct ColumnMappingConfig {
    pub source_name: String,
    pub source_type: String,
    pub target_name: String,
    pub target_type: String,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct MappingOverrides {
    #[serde(default)]
    pub pickup_zone: Option<Vec<ColumnMappingConfig>>,
    #[serde(default)]
    pub dropoff_zone: Option<Vec<ColumnMappingConfig>>,
    #[serde(default)]
    pub payment_type: Option<Vec<ColumnMappingConfig>>,
    #[serde(default)]
    pub rate_code: Option<Vec<ColumnMappingConfig>>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct StorageSettings {
    #[serde(default)]
    pub s3: Option<S3Settings>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct S3Settings {
    #[serde(default = "default_s3_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_s3_region")]
    pub region: String,
    pub access_key: String,
    pub secret_key: String,
    #[serde(default = "default_allow_http")]
    pub allow_http: bool,
}

fn default_has_header() -> bool {
    true
}

fn default_delimiter() -> char {
    ','
}

fn default_fact_table() -> TableRef {
    TableRef::new("nyc_taxi", "yellow_tripdata")
}

fn default_taxi_zone_table() -> TableRef {
    TableRef::new("nyc_taxi", "taxi_zone_lookup")
}

fn default_payment_type_table() -> TableRef {
    TableRef::new("nyc_taxi", "payment_type")
}

fn default_rate_code_table() -> TableRef {
    TableRef::new("nyc_taxi", "rate_code")
}

pub const DEFAULT_ROW_GROUP_BYTES: usize = 32 * 1024 * 1024;

fn default_row_group_bytes() -> usize {
    DEFAULT_ROW_GROUP_BYTES
}

pub const DEFAULT_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

fn default_timestamp_format() -> String {
    DEFAULT_TIMESTAMP_FORMAT.to_string()
}

fn default_cache_facts() -> bool {
    true
}

fn default_s3_endpoint() -> String {
    "http://localhost:9000".to_string()
}

fn default_s3_region() -> String {
    "us-east-1".to_string()
}

fn default_allow_http() -> bool {
    true
}

impl Settings {
    pub fn new(path: &str) -> Result<Self, ConfigError> {
        let builder = Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );

        Self::build(builder.build()?)
    }

    /// Parses settings from an in-memory TOML document, without environment overrides.
    pub fn from_toml_str(toml: &str) -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(config::File::from_str(toml, FileFormat::Toml))
            .build()?;

        Self::build(config)
    }

    fn build(config: Config) -> Result<Self, ConfigError> {
        let settings: Settings = config.try_deserialize()?;

        debug!(
            tables = settings.catalog.tables.len(),
            destination = %settings.job.destination,
            "Parsed settings"
        );

        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.job.destination.trim().is_empty() {
            return Err(ConfigError::Message(
                "job.destination must not be empty".to_string(),
            ));
        }
        if self.job.timestamp_format.trim().is_empty() {
            return Err(ConfigError::Message(
                "job.timestamp_format must not be empty".to_string(),
            ));
        }
        if self.job.target_partitions == Some(0) {
            return Err(ConfigError::Message(
                "job.target_partitions must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn find_table(&self, table: &TableRef) -> Option<&CatalogTable> {
        self.catalog
            .tables
            .iter()
            .find(|t| t.database == table.database && t.name == table.table)
    }
}
