use chrono::NaiveDateTime;
use common::Result;
use datafusion::arrow::array::{AsArray, TimestampMicrosecondArray};
use datafusion::arrow::datatypes::{DataType, TimeUnit};
use datafusion::common::DataFusionError;
use datafusion::execution::context::SessionContext;
use datafusion::logical_expr::{ColumnarValue, ScalarUDF, Volatility, create_udf};
use std::sync::Arc;

pub const PARSE_TIMESTAMP: &str = "parse_timestamp";

/// Type of every timestamp column the pipeline derives.
pub fn timestamp_type() -> DataType {
    DataType::Timestamp(TimeUnit::Microsecond, None)
}

/// Registers all UDFs with the SessionContext
pub fn register_udfs(ctx: &SessionContext, timestamp_format: &str) -> Result<()> {
    ctx.register_udf(parse_timestamp_udf(timestamp_format));
    Ok(())
}

/// `parse_timestamp(text)`: parses with a fixed chrono format. Unparsable
/// text becomes null instead of failing the query.
pub fn parse_timestamp_udf(format: &str) -> ScalarUDF {
    let format = format.to_string();
    create_udf(
        PARSE_TIMESTAMP,
        vec![DataType::Utf8],
        timestamp_type(),
        Volatility::Immutable,
        Arc::new(move |args: &[ColumnarValue]| {
            parse_timestamps(args, &format).map_err(|e| DataFusionError::Internal(e.to_string()))
        }),
    )
}

fn parse_timestamps(args: &[ColumnarValue], format: &str) -> Result<ColumnarValue> {
    let arrays = ColumnarValue::values_to_arrays(args)?;
    let strings = arrays
        .first()
        .and_then(|array| array.as_string_opt::<i32>())
        .ok_or_else(|| DataFusionError::Internal("Expected string array".to_string()))?;

    let result: TimestampMicrosecondArray = strings
        .iter()
        .map(|value| value.and_then(|text| parse_timestamp(text, format)))
        .collect();

    Ok(ColumnarValue::Array(Arc::new(result)))
}

/// Microseconds since the epoch, or None when `text` does not match `format`.
pub fn parse_timestamp(text: &str, format: &str) -> Option<i64> {
    NaiveDateTime::parse_from_str(text.trim(), format)
        .ok()
        .map(|dt| dt.and_utc().timestamp_micros())
}
