use common::{Error, Result};
use arrow::array::{Array, AsArray, RecordBatch, UInt32Array};
use arrow::compute::{cast, take_record_batch};
use arrow::datatypes::{DataType, Int32Type};
use object_store::path::Path;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Path segment value used for a null partition column.
pub const HIVE_DEFAULT_PARTITION: &str = "__HIVE_DEFAULT_PARTITION__";

static PARTITION_PATH_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:^|/)pu_year=(?P<year>[^/]+)/pu_month=(?P<month>[^/]+)/")
        .expect("Invalid partition path regex")
});

/// Value of `(pu_year, pu_month)` shared by every row of one output partition.
/// Orders nulls after every real value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PartitionKey {
    pub pu_year: Option<i32>,
    pub pu_month: Option<i32>,
}

impl PartitionKey {
    pub fn new(pu_year: Option<i32>, pu_month: Option<i32>) -> Self {
        Self { pu_year, pu_month }
    }

    pub fn has_null(&self) -> bool {
        self.pu_year.is_none() || self.pu_month.is_none()
    }

    /// Directory names, outermost first.
    pub fn segments(&self) -> [String; 2] {
        [
            format!("pu_year={}", segment(self.pu_year)),
            format!("pu_month={}", segment(self.pu_month)),
        ]
    }

    /// Relative directory, e.g. `pu_year=2019/pu_month=1`.
    pub fn directory(&self) -> String {
        self.segments().join("/")
    }

    /// Object path of `file` inside this partition's directory under `root`.
    pub fn file_path(&self, root: &Path, file: &str) -> Path {
        let [year, month] = self.segments();
        root.child(year).child(month).child(file)
    }

    /// Recovers a key from any object path containing a partition directory.
    pub fn from_path(path: &str) -> Option<Self> {
        let captures = PARTITION_PATH_REGEX.captures(path)?;
        Some(Self {
            pu_year: parse_segment(&captures["year"])?,
            pu_month: parse_segment(&captures["month"])?,
        })
    }
}

impl Ord for PartitionKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        let rank = |v: Option<i32>| (v.is_none(), v.unwrap_or_default());
        (rank(self.pu_year), rank(self.pu_month)).cmp(&(rank(other.pu_year), rank(other.pu_month)))
    }
}

impl PartialOrd for PartitionKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl std::fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.directory())
    }
}

fn segment(value: Option<i32>) -> String {
    value.map_or_else(|| HIVE_DEFAULT_PARTITION.to_string(), |v| v.to_string())
}

/// `None` when the text is not a partition value at all, `Some(None)` for the default partition.
fn parse_segment(text: &str) -> Option<Option<i32>> {
    if text == HIVE_DEFAULT_PARTITION {
        return Some(None);
    }
    text.parse().ok().map(Some)
}

/// Splits a batch into one sub-batch per partition key. The partition
/// columns are removed from the returned batches.
pub fn split_batch(
    batch: &RecordBatch,
    partition_by: &[String],
) -> Result<Vec<(PartitionKey, RecordBatch)>> {
    let [year_column, month_column] = partition_by else {
        return Err(Error::InvalidInput(format!(
            "Expected two partition columns, got {:?}",
            partition_by
        )));
    };

    let schema = batch.schema();
    let key_array = |name: &str| -> Result<_> {
        let array = batch.column(schema.index_of(name)?);
        Ok(cast(array, &DataType::Int32)?)
    };
    let years = key_array(year_column)?;
    let years = years.as_primitive::<Int32Type>();
    let months = key_array(month_column)?;
    let months = months.as_primitive::<Int32Type>();

    let mut rows: BTreeMap<PartitionKey, Vec<u32>> = BTreeMap::new();
    for i in 0..batch.num_rows() {
        let key = PartitionKey::new(
            years.is_valid(i).then(|| years.value(i)),
            months.is_valid(i).then(|| months.value(i)),
        );
        rows.entry(key).or_default().push(i as u32);
    }

    let keep: Vec<usize> = (0..schema.fields().len())
        .filter(|i| {
            let name = schema.field(*i).name();
            name != year_column && name != month_column
        })
        .collect();
    let data = batch.project(&keep)?;

    let mut parts = Vec::with_capacity(rows.len());
    for (key, indices) in rows {
        let part = if indices.len() == batch.num_rows() {
            data.clone()
        } else {
            take_record_batch(&data, &UInt32Array::from(indices))?
        };
        parts.push((key, part));
    }
    Ok(parts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Int32Array, StringArray};
    use arrow::datatypes::{Field, Schema};
    use std::sync::Arc;

    fn columns() -> Vec<String> {
        vec!["pu_year".to_string(), "pu_month".to_string()]
    }

    fn batch() -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![
            Field::new("pu_zone", DataType::Utf8, true),
            Field::new("pu_year", DataType::Int32, true),
            Field::new("pu_month", DataType::Int32, true),
        ]));
        RecordBatch::try_new(
            schema,
            vec![
                Arc::new(StringArray::from(vec!["a", "b", "c", "d"])),
                Arc::new(Int32Array::from(vec![Some(2019), None, Some(2019), Some(2019)])),
                Arc::new(Int32Array::from(vec![Some(2), None, Some(1), Some(2)])),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_directory_names() {
        assert_eq!(
            PartitionKey::new(Some(2019), Some(1)).directory(),
            "pu_year=2019/pu_month=1"
        );
        assert_eq!(
            PartitionKey::new(None, None).directory(),
            "pu_year=__HIVE_DEFAULT_PARTITION__/pu_month=__HIVE_DEFAULT_PARTITION__"
        );
    }

    #[test]
    fn test_file_path() {
        let root = Path::from("warehouse/trips");
        let path = PartitionKey::new(Some(2019), Some(1)).file_path(&root, "part-00000.parquet");
        assert_eq!(path.as_ref(), "warehouse/trips/pu_year=2019/pu_month=1/part-00000.parquet");
    }

    #[test]
    fn test_from_path() {
        let key = PartitionKey::from_path("data/trips/pu_year=2019/pu_month=12/part-00000.parquet");
        assert_eq!(key, Some(PartitionKey::new(Some(2019), Some(12))));

        let key = PartitionKey::from_path(
            "pu_year=__HIVE_DEFAULT_PARTITION__/pu_month=__HIVE_DEFAULT_PARTITION__/part-00000.parquet",
        );
        assert_eq!(key, Some(PartitionKey::new(None, None)));

        assert_eq!(PartitionKey::from_path("trips/_SUCCESS"), None);
        assert_eq!(PartitionKey::from_path("x_pu_year=2019/pu_month=1/a.parquet"), None);
        assert_eq!(PartitionKey::from_path("pu_year=abc/pu_month=1/a.parquet"), None);
    }

    #[test]
    fn test_nulls_sort_last() {
        let mut keys = vec![
            PartitionKey::new(None, None),
            PartitionKey::new(Some(2019), Some(2)),
            PartitionKey::new(Some(2018), Some(12)),
            PartitionKey::new(Some(2019), None),
        ];
        keys.sort();
        assert_eq!(keys[0], PartitionKey::new(Some(2018), Some(12)));
        assert_eq!(keys[1], PartitionKey::new(Some(2019), Some(2)));
        assert_eq!(keys[2], PartitionKey::new(Some(2019), None));
        assert_eq!(keys[3], PartitionKey::new(None, None));
    }

    #[test]
    fn test_split_batch() {
        let parts = split_batch(&batch(), &columns()).unwrap();
        assert_eq!(parts.len(), 3);

        let (key, part) = &parts[0];
        assert_eq!(*key, PartitionKey::new(Some(2019), Some(1)));
        assert_eq!(part.num_rows(), 1);
        assert_eq!(part.num_columns(), 1);

        let (key, part) = &parts[1];
        assert_eq!(*key, PartitionKey::new(Some(2019), Some(2)));
        let zones = part.column(0).as_string::<i32>();
        assert_eq!(zones.value(0), "a");
        assert_eq!(zones.value(1), "d");

        let (key, part) = &parts[2];
        assert!(key.has_null());
        assert_eq!(part.num_rows(), 1);
    }

    #[test]
    fn test_split_requires_two_columns() {
        let err = split_batch(&batch(), &["pu_year".to_string()]).unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }
}
