use super::partition::PartitionKey;
use common::{Error, Result};
use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;
use object_store::ObjectStore;
use object_store::path::Path;
use parquet::arrow::AsyncArrowWriter;
use parquet::arrow::async_writer::ParquetObjectWriter;
use parquet::basic::Compression;
use parquet::errors::ParquetError;
use parquet::file::properties::WriterProperties;
use parquet::format::KeyValue;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

pub const PART_FILE_NAME: &str = "part-00000.parquet";

/// Rows written to one partition directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionStats {
    pub key: PartitionKey,
    pub directory: String,
    pub rows: usize,
    pub row_groups: usize,
}

pub fn writer_properties(run_id: &str) -> WriterProperties {
    WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        // Row groups are cut by size, see PartitionFileWriter::write.
        .set_max_row_group_size(usize::MAX)
        .set_key_value_metadata(Some(vec![
            KeyValue::new("trip_etl.run_id".to_string(), run_id.to_string()),
            KeyValue::new(
                "trip_etl.version".to_string(),
                env!("CARGO_PKG_VERSION").to_string(),
            ),
        ]))
        .build()
}

/// Streams the batches of a single partition into one Parquet object.
pub struct PartitionFileWriter {
    key: PartitionKey,
    path: Path,
    writer: AsyncArrowWriter<ParquetObjectWriter>,
    row_group_bytes: usize,
    rows: usize,
    row_groups: usize,
}

impl PartitionFileWriter {
    pub fn try_new(
        store: Arc<dyn ObjectStore>,
        key: PartitionKey,
        path: Path,
        schema: SchemaRef,
        props: WriterProperties,
        row_group_bytes: usize,
    ) -> Result<Self> {
        let object = ParquetObjectWriter::new(store, path.clone());
        let writer = AsyncArrowWriter::try_new(object, schema, Some(props))?;
        debug!(partition = %key, path = %path, "Opened partition file");

        Ok(Self {
            key,
            path,
            writer,
            row_group_bytes,
            rows: 0,
            row_groups: 0,
        })
    }

    pub fn key(&self) -> PartitionKey {
        self.key
    }

    fn storage_error(path: &Path, e: ParquetError) -> Error {
        Error::Storage(format!("Cannot write {}: {}", path, e))
    }

    pub async fn write(&mut self, batch: &RecordBatch) -> Result<()> {
        self.writer
            .write(batch)
            .await
            .map_err(|e| Self::storage_error(&self.path, e))?;
        self.rows += batch.num_rows();

        if self.writer.in_progress_size() >= self.row_group_bytes {
            self.writer
                .flush()
                .await
                .map_err(|e| Self::storage_error(&self.path, e))?;
            self.row_groups += 1;
        }
        Ok(())
    }

    pub async fn close(self) -> Result<PartitionStats> {
        let pending = usize::from(self.writer.in_progress_rows() > 0);
        self.writer
            .close()
            .await
            .map_err(|e| Self::storage_error(&self.path, e))?;

        debug!(partition = %self.key, rows = self.rows, "Closed partition file");
        Ok(PartitionStats {
            key: self.key,
            directory: self.key.directory(),
            rows: self.rows,
            row_groups: self.row_groups + pending,
        })
    }
}
