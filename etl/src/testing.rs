//! Fixture data shared by the unit tests: a small trip table plus the three
//! lookup tables, written to disk the way the catalog expects them.

use crate::catalog::normalize_column_names;
use common::config::{CatalogTable, Settings, TableFormat, TableRef};
use datafusion::arrow::array::{ArrayRef, Float64Array, Int64Array, RecordBatch, StringArray};
use datafusion::arrow::datatypes::{DataType, Field, Schema};
use datafusion::prelude::*;
use parquet::arrow::ArrowWriter;
use std::path::Path;
use std::sync::Arc;

pub const DATABASE: &str = "nyc_taxi";

/// Rows in the trip fixture, before any join.
pub const TRIP_ROWS: usize = 7;

/// Rows that survive every join, including the one with an unparsable pickup time.
pub const MATCHED_ROWS: usize = 4;

pub const ZONES_CSV: &str = "LocationID,Borough,Zone,service_zone
1,EWR,Newark Airport,EWR
2,Queens,Jamaica Bay,Boro Zone
3,Bronx,Allerton/Pelham Gardens,Boro Zone
";

pub const PAYMENT_TYPES_CSV: &str = "payment_type,payment_type_name
1,Credit card
2,Cash
";

pub const RATE_CODES_CSV: &str = "ratecodeid,ratecode_name
1,Standard rate
2,JFK
";

/// Trip rows: fares tag each row. 30, 40 and 70 have no rate code, pickup zone
/// and payment type match respectively; 60 has a pickup time that cannot be parsed.
fn trip_batch(lowercase: bool) -> RecordBatch {
    let name = |n: &str| {
        if lowercase {
            n.to_lowercase()
        } else {
            n.to_string()
        }
    };
    let schema = Arc::new(Schema::new(vec![
        Field::new(name("VendorID"), DataType::Int64, true),
        Field::new(name("tpep_pickup_datetime"), DataType::Utf8, true),
        Field::new(name("tpep_dropoff_datetime"), DataType::Utf8, true),
        Field::new(name("passenger_count"), DataType::Int64, true),
        Field::new(name("trip_distance"), DataType::Float64, true),
        Field::new(name("RatecodeID"), DataType::Int64, true),
        Field::new(name("store_and_fwd_flag"), DataType::Utf8, true),
        Field::new(name("PULocationID"), DataType::Int64, true),
        Field::new(name("DOLocationID"), DataType::Int64, true),
        Field::new(name("payment_type"), DataType::Int64, true),
        Field::new(name("fare_amount"), DataType::Float64, true),
    ]));

    let columns: Vec<ArrayRef> = vec![
        Arc::new(Int64Array::from(vec![1, 2, 1, 2, 1, 2, 1])),
        Arc::new(StringArray::from(vec![
            "2019-01-15 08:30:00",
            "2019-02-01 00:05:00",
            "2019-01-20 10:00:00",
            "2019-01-21 11:00:00",
            "2019-01-31 23:59:59",
            "15/01/2019 08:30",
            "2019-01-22 12:00:00",
        ])),
        Arc::new(StringArray::from(vec![
            "2019-01-15 08:50:00",
            "2019-02-01 00:25:00",
            "2019-01-20 10:20:00",
            "2019-01-21 11:20:00",
            "2019-02-01 00:15:00",
            "2019-01-15 08:50:00",
            "2019-01-22 12:20:00",
        ])),
        Arc::new(Int64Array::from(vec![1, 2, 1, 3, 1, 1, 2])),
        Arc::new(Float64Array::from(vec![2.5, 17.1, 1.0, 3.2, 4.4, 0.9, 6.0])),
        Arc::new(Int64Array::from(vec![1, 2, 99, 1, 1, 1, 1])),
        Arc::new(StringArray::from(vec!["N", "N", "N", "Y", "N", "N", "N"])),
        Arc::new(Int64Array::from(vec![1, 2, 1, 999, 3, 1, 2])),
        Arc::new(Int64Array::from(vec![2, 3, 1, 1, 1, 1, 2])),
        Arc::new(Int64Array::from(vec![1, 2, 1, 1, 2, 1, 5])),
        Arc::new(Float64Array::from(vec![10.0, 20.0, 30.0, 40.0, 50.0, 60.0, 70.0])),
    ];

    RecordBatch::try_new(schema, columns).unwrap()
}

/// The trip fixture as the catalog reader returns it.
pub fn trips_df(ctx: &SessionContext) -> DataFrame {
    ctx.read_batch(trip_batch(true)).unwrap()
}

/// Reads a lookup fixture through the CSV reader, with lower-cased columns.
async fn csv_df(ctx: &SessionContext, name: &str, csv: &str) -> DataFrame {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join(format!("{}.csv", name));
    std::fs::write(&path, csv).unwrap();

    let batches = ctx
        .read_csv(path.to_str().unwrap(), CsvReadOptions::new().has_header(true))
        .await
        .unwrap()
        .collect()
        .await
        .unwrap();
    let df = ctx.read_batches(batches).unwrap();
    normalize_column_names(df, &TableRef::new(DATABASE, name)).unwrap()
}

pub async fn zones_df(ctx: &SessionContext) -> DataFrame {
    csv_df(ctx, "taxi_zone_lookup", ZONES_CSV).await
}

pub async fn payment_types_df(ctx: &SessionContext) -> DataFrame {
    csv_df(ctx, "payment_type", PAYMENT_TYPES_CSV).await
}

pub async fn rate_codes_df(ctx: &SessionContext) -> DataFrame {
    csv_df(ctx, "rate_code", RATE_CODES_CSV).await
}

fn dir_location(path: &Path) -> String {
    format!("{}/", path.display())
}

fn csv_table(root: &Path, name: &str, contents: &str) -> CatalogTable {
    let dir = root.join(name);
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join(format!("{}.csv", name)), contents).unwrap();

    CatalogTable {
        database: DATABASE.to_string(),
        name: name.to_string(),
        location: dir_location(&dir),
        format: TableFormat::Csv,
        has_header: true,
        delimiter: ',',
    }
}

/// Writes the trip parquet file and the three lookup CSVs under `root` and
/// returns their catalog entries.
pub fn write_sources(root: &Path) -> Vec<CatalogTable> {
    let trips = root.join("yellow_tripdata");
    std::fs::create_dir_all(&trips).unwrap();

    let batch = trip_batch(false);
    let file = std::fs::File::create(trips.join("part-0.parquet")).unwrap();
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None).unwrap();
    writer.write(&batch).unwrap();
    writer.close().unwrap();

    vec![
        CatalogTable {
            database: DATABASE.to_string(),
            name: "yellow_tripdata".to_string(),
            location: dir_location(&trips),
            format: TableFormat::Parquet,
            has_header: true,
            delimiter: ',',
        },
        csv_table(root, "taxi_zone_lookup", ZONES_CSV),
        csv_table(root, "payment_type", PAYMENT_TYPES_CSV),
        csv_table(root, "rate_code", RATE_CODES_CSV),
    ]
}

/// Settings whose catalog points at the fixture tables under `root`.
pub fn settings(root: &Path, destination: &Path, job_extra: &str) -> Settings {
    let mut toml = format!(
        "[job]\ndestination = \"{}\"\ntarget_partitions = 4\n{}\n",
        destination.display(),
        job_extra
    );
    for table in write_sources(root) {
        let format = match table.format {
            TableFormat::Parquet => "parquet",
            TableFormat::Csv => "csv",
        };
        toml.push_str(&format!(
            "\n[[catalog.tables]]\ndatabase = \"{}\"\nname = \"{}\"\nlocation = \"{}\"\nformat = \"{}\"\n",
            table.database, table.name, table.location, format
        ));
    }
    Settings::from_toml_str(&toml).unwrap()
}
