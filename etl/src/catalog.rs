use crate::mapping::column;
use crate::storage::StorageManager;
use async_trait::async_trait;
use common::config::{CatalogTable, TableFormat, TableRef};
use common::{Error, Result};
use datafusion::catalog::{CatalogProvider, MemorySchemaProvider};
use datafusion::datasource::file_format::csv::CsvFormat;
use datafusion::datasource::file_format::parquet::ParquetFormat;
use datafusion::datasource::TableProvider;
use datafusion::datasource::listing::ListingOptions;
use datafusion::prelude::*;
use datafusion::common::TableReference;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[async_trait]
pub trait TableRegistry: Send + Sync + 'static {
    async fn register_table(&self, ctx: &SessionContext, table: &CatalogTable) -> Result<()>;

    async fn deregister_table(&self, ctx: &SessionContext, table: &TableRef) -> Result<()>;
}

fn table_reference(database: &str, table: &str) -> TableReference {
    TableReference::partial(database.to_string(), table.to_string())
}

/// Registers catalog entries as listing tables under a schema named after their database.
pub struct ListingTableRegistry;

impl ListingTableRegistry {
    fn listing_options(table: &CatalogTable) -> Result<ListingOptions> {
        let options = match table.format {
            TableFormat::Parquet => {
                ListingOptions::new(Arc::new(ParquetFormat::default()))
                    .with_file_extension(".parquet")
            }
            TableFormat::Csv => {
                if !table.delimiter.is_ascii() {
                    return Err(Error::catalog_lookup(
                        &table.database,
                        &table.name,
                        format!("delimiter '{}' is not a single byte", table.delimiter),
                    ));
                }
                let format = CsvFormat::default()
                    .with_has_header(table.has_header)
                    .with_delimiter(table.delimiter as u8);
                ListingOptions::new(Arc::new(format)).with_file_extension(".csv")
            }
        };
        Ok(options)
    }

    fn ensure_schema(ctx: &SessionContext, database: &str) -> Result<()> {
        let catalog_name = ctx.state().config().options().catalog.default_catalog.clone();
        let catalog = ctx.catalog(&catalog_name).ok_or_else(|| {
            Error::catalog_lookup(
                database,
                "",
                format!("default catalog '{}' missing", catalog_name),
            )
        })?;

        if catalog.schema(database).is_none() {
            catalog.register_schema(database, Arc::new(MemorySchemaProvider::new()))?;
        }
        Ok(())
    }
}

#[async_trait]
impl TableRegistry for ListingTableRegistry {
    async fn register_table(&self, ctx: &SessionContext, table: &CatalogTable) -> Result<()> {
        let unreadable = |e: &dyn std::fmt::Display| {
            Error::catalog_lookup(
                &table.database,
                &table.name,
                format!("unreadable at {}: {}", table.location, e),
            )
        };

        Self::ensure_schema(ctx, &table.database)?;
        let options = Self::listing_options(table)?;
        let reference = table_reference(&table.database, &table.name);

        ctx.register_listing_table(reference.clone(), &table.location, options, None, None)
            .await
            .map_err(|e| unreadable(&e))?;

        // Listing an empty or missing location succeeds with no columns.
        let provider = ctx.table_provider(reference).await.map_err(|e| unreadable(&e))?;
        if provider.schema().fields().is_empty() {
            let table_ref = TableRef::new(&table.database, &table.name);
            if let Err(e) = self.deregister_table(ctx, &table_ref).await {
                warn!(table = %table_ref, error = %e, "Failed to release empty catalog table");
            }
            return Err(unreadable(&"no readable data files"));
        }

        debug!(
            table = %format!("{}.{}", table.database, table.name),
            location = %table.location,
            columns = provider.schema().fields().len(),
            "Registered catalog table"
        );
        Ok(())
    }

    async fn deregister_table(&self, ctx: &SessionContext, table: &TableRef) -> Result<()> {
        ctx.deregister_table(table_reference(&table.database, &table.table))?;
        Ok(())
    }
}

/// Resolves `(database, table)` pairs declared in the configured catalog.
pub struct CatalogReader {
    ctx: Arc<SessionContext>,
    tables: Vec<CatalogTable>,
    registry: Arc<dyn TableRegistry>,
    storage: StorageManager,
}

impl CatalogReader {
    pub fn new(
        ctx: Arc<SessionContext>,
        tables: Vec<CatalogTable>,
        registry: Arc<dyn TableRegistry>,
        storage: StorageManager,
    ) -> Self {
        Self {
            ctx,
            tables,
            registry,
            storage,
        }
    }

    fn entry(&self, table: &TableRef) -> Result<&CatalogTable> {
        self.tables
            .iter()
            .find(|t| t.database == table.database && t.name == table.table)
            .ok_or_else(|| {
                Error::catalog_lookup(
                    &table.database,
                    &table.table,
                    "table is not registered in the catalog",
                )
            })
    }

    /// Returns the table as a dataset with lower-case column names.
    pub async fn read(&self, table: &TableRef) -> Result<DataFrame> {
        let entry = self.entry(table)?;
        let reference = table_reference(&table.database, &table.table);

        if !self.ctx.table_exist(reference.clone())? {
            let url = StorageManager::parse_location(&entry.location)?;
            self.storage.register_object_store(&self.ctx, &url)?;
            self.registry.register_table(&self.ctx, entry).await?;
        }

        let df = self.ctx.table(reference).await.map_err(|e| {
            Error::catalog_lookup(&table.database, &table.table, e.to_string())
        })?;

        info!(table = %table, columns = df.schema().fields().len(), "Resolved catalog table");
        normalize_column_names(df, table)
    }

    /// Drops every table this reader registered.
    pub async fn close(&self) -> Result<()> {
        for entry in &self.tables {
            let table = TableRef::new(&entry.database, &entry.name);
            if self.ctx.table_exist(table_reference(&entry.database, &entry.name))? {
                self.registry.deregister_table(&self.ctx, &table).await?;
            }
        }
        Ok(())
    }
}

pub(crate) fn normalize_column_names(df: DataFrame, table: &TableRef) -> Result<DataFrame> {
    let names: Vec<String> = df.schema().fields().iter().map(|f| f.name().clone()).collect();
    if names.iter().all(|name| *name == name.to_lowercase()) {
        return Ok(df);
    }

    let mut seen = HashSet::new();
    let mut exprs = Vec::with_capacity(names.len());
    for name in &names {
        let lower = name.to_lowercase();
        if !seen.insert(lower.clone()) {
            return Err(Error::catalog_lookup(
                &table.database,
                &table.table,
                format!("column '{}' is ambiguous once lower-cased", name),
            ));
        }
        exprs.push(column(name).alias(lower));
    }
    Ok(df.select(exprs)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;

    fn reader(ctx: Arc<SessionContext>, tables: Vec<CatalogTable>) -> CatalogReader {
        CatalogReader::new(ctx, tables, Arc::new(ListingTableRegistry), StorageManager::new(None))
    }

    #[tokio::test]
    async fn test_reads_parquet_and_csv_tables() {
        let dir = tempfile::tempdir().unwrap();
        let tables = testing::write_sources(dir.path());
        let ctx = Arc::new(SessionContext::new());
        let reader = reader(ctx.clone(), tables);

        let trips = reader.read(&TableRef::new("nyc_taxi", "yellow_tripdata")).await.unwrap();
        assert!(trips.schema().field_with_unqualified_name("pulocationid").is_ok());
        assert!(trips.schema().field_with_unqualified_name("PULocationID").is_err());
        assert_eq!(trips.count().await.unwrap(), testing::TRIP_ROWS);

        let zones = reader.read(&TableRef::new("nyc_taxi", "taxi_zone_lookup")).await.unwrap();
        assert!(zones.schema().field_with_unqualified_name("locationid").is_ok());
        assert_eq!(zones.count().await.unwrap(), 3);

        // A second read reuses the registration.
        let again = reader.read(&TableRef::new("nyc_taxi", "taxi_zone_lookup")).await.unwrap();
        assert_eq!(again.count().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_unregistered_table() {
        let ctx = Arc::new(SessionContext::new());
        let reader = reader(ctx, vec![]);

        let err = reader.read(&TableRef::new("nyc_taxi", "missing")).await.unwrap_err();
        assert!(matches!(
            err,
            Error::CatalogLookup { ref database, ref table, .. } if database == "nyc_taxi" && table == "missing"
        ));
    }

    #[tokio::test]
    async fn test_unreadable_location() {
        let dir = tempfile::tempdir().unwrap();
        let empty = dir.path().join("empty");
        std::fs::create_dir_all(&empty).unwrap();

        let ctx = Arc::new(SessionContext::new());
        let reader = reader(
            ctx.clone(),
            vec![CatalogTable {
                database: "nyc_taxi".to_string(),
                name: "yellow_tripdata".to_string(),
                location: format!("{}/", empty.display()),
                format: TableFormat::Parquet,
                has_header: true,
                delimiter: ',',
            }],
        );

        let err = reader
            .read(&TableRef::new("nyc_taxi", "yellow_tripdata"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CatalogLookup { .. }));
        assert!(!ctx.table_exist(table_reference("nyc_taxi", "yellow_tripdata")).unwrap());
    }

    #[tokio::test]
    async fn test_close_deregisters() {
        let dir = tempfile::tempdir().unwrap();
        let tables = testing::write_sources(dir.path());
        let ctx = Arc::new(SessionContext::new());
        let reader = reader(ctx.clone(), tables);

        reader.read(&TableRef::new("nyc_taxi", "payment_type")).await.unwrap();
        assert!(ctx.table_exist(table_reference("nyc_taxi", "payment_type")).unwrap());

        reader.close().await.unwrap();
        assert!(!ctx.table_exist(table_reference("nyc_taxi", "payment_type")).unwrap());
    }
}
