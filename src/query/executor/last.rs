//! Last-value queries

use super::reader::SeriesFetcher;
use crate::config::ConsistencyLevel;
use crate::query::dataset::{ColumnHeader, RowRecord};
use crate::query::expression::Value;
use crate::query::plan::{DataType, LastQueryPlan};
use crate::Result;

pub const LAST_SERIES_COLUMN: &str = "timeseries";
pub const LAST_VALUE_COLUMN: &str = "value";

pub(crate) fn last_columns() -> Vec<ColumnHeader> {
    vec![
        ColumnHeader::new(LAST_SERIES_COLUMN, DataType::Text),
        ColumnHeader::new(LAST_VALUE_COLUMN, DataType::Text),
    ]
}

/// One row per series holding data at or before `now`, stamped with the
/// time of that value
pub(crate) async fn last_rows(
    fetcher: &SeriesFetcher,
    plan: &LastQueryPlan,
    now: i64,
    consistency: ConsistencyLevel,
) -> Result<Vec<RowRecord>> {
    let mut rows = Vec::with_capacity(plan.series.len());
    for path in plan.series.paths() {
        if let Some(point) = fetcher.latest(path, now, consistency).await? {
            rows.push(RowRecord::new(
                point.timestamp,
                vec![
                    Some(Value::Text(path.to_string())),
                    Some(Value::Text(point.value.to_string())),
                ],
            ));
        }
    }
    Ok(rows)
}
