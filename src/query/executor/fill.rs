//! Point-in-time fill queries

use super::reader::SeriesFetcher;
use crate::config::ConsistencyLevel;
use crate::query::dataset::{ColumnHeader, RowRecord};
use crate::query::expression::{TimeValuePair, Value};
use crate::query::fill::{interpolate, within, FillStrategy};
use crate::query::plan::{DataType, FillQueryPlan, SeriesPath};
use crate::Result;

use tracing::trace;

pub(crate) fn fill_columns(plan: &FillQueryPlan) -> Vec<ColumnHeader> {
    plan.series
        .iter()
        .map(|(path, data_type)| ColumnHeader::new(path.as_str(), data_type))
        .collect()
}

/// The single row of a fill query, stamped with the query time
pub(crate) async fn fill_row(
    fetcher: &SeriesFetcher,
    plan: &FillQueryPlan,
    consistency: ConsistencyLevel,
) -> Result<RowRecord> {
    let mut fields = Vec::with_capacity(plan.series.len());
    for (path, data_type) in plan.series.iter() {
        let strategy = plan.fill.get(&data_type).copied();
        let value = fill_value(
            fetcher,
            path,
            data_type,
            strategy,
            plan.query_time,
            consistency,
        )
        .await?;
        fields.push(value);
    }
    Ok(RowRecord::new(plan.query_time, fields))
}

async fn fill_value(
    fetcher: &SeriesFetcher,
    path: &SeriesPath,
    data_type: DataType,
    strategy: Option<FillStrategy>,
    at: i64,
    consistency: ConsistencyLevel,
) -> Result<Option<Value>> {
    if let Some(strategy) = &strategy {
        strategy.check(data_type)?;
    }
    let before = fetcher.latest(path, at, consistency).await?;
    if let Some(point) = before.as_ref().filter(|p| p.timestamp == at) {
        return Ok(Some(point.value.clone()));
    }

    let value = match strategy {
        None => None,
        Some(FillStrategy::Previous { before_range }) => {
            previous(before.as_ref(), at, before_range).map(|p| p.value.clone())
        }
        Some(FillStrategy::Linear {
            before_range,
            after_range,
        }) => match previous(before.as_ref(), at, before_range) {
            None => None,
            Some(before) => fetcher
                .earliest(path, at, consistency)
                .await?
                .filter(|after| within(after_range, after.timestamp - at))
                .and_then(|after| interpolate(before, &after, at, data_type)),
        },
    };
    trace!(path = %path, at, filled = value.is_some(), "Fill value");
    Ok(value)
}

fn previous(point: Option<&TimeValuePair>, at: i64, range: Option<i64>) -> Option<&TimeValuePair> {
    point.filter(|p| within(range, at - p.timestamp))
}
