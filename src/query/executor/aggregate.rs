//! Aggregate accumulation

use crate::query::dataset::{ColumnHeader, QueryDataSet, RowRecord};
use crate::query::expression::Value;
use crate::query::plan::{AggregationPlan, AggregationType, DataType};
use crate::{Error, Result};

use std::cmp::Ordering;

/// Running state of one aggregate over one series
#[derive(Debug, Clone)]
pub struct AggregateState {
    aggregation: AggregationType,
    count: i64,
    sum: f64,
    min: Option<Value>,
    max: Option<Value>,
    first: Option<(i64, Value)>,
    last: Option<(i64, Value)>,
}

impl AggregateState {
    pub fn new(aggregation: AggregationType, data_type: DataType) -> Result<Self> {
        if aggregation.requires_numeric() && !data_type.is_numeric() {
            return Err(Error::Query(format!(
                "{} is undefined over {} series",
                aggregation.as_str(),
                data_type
            )));
        }
        Ok(Self {
            aggregation,
            count: 0,
            sum: 0.0,
            min: None,
            max: None,
            first: None,
            last: None,
        })
    }

    pub fn update(&mut self, timestamp: i64, value: &Value) {
        self.count += 1;
        if let Some(v) = value.as_f64() {
            self.sum += v;
        }
        if self.min.as_ref().map_or(true, |m| value.compare(m) == Some(Ordering::Less)) {
            self.min = Some(value.clone());
        }
        if self.max.as_ref().map_or(true, |m| value.compare(m) == Some(Ordering::Greater)) {
            self.max = Some(value.clone());
        }
        if self.first.as_ref().map_or(true, |(t, _)| timestamp < *t) {
            self.first = Some((timestamp, value.clone()));
        }
        if self.last.as_ref().map_or(true, |(t, _)| timestamp >= *t) {
            self.last = Some((timestamp, value.clone()));
        }
    }

    /// Aggregate value; `None` for an empty input except COUNT
    pub fn result(&self) -> Option<Value> {
        match self.aggregation {
            AggregationType::Count => Some(Value::Int64(self.count)),
            _ if self.count == 0 => None,
            AggregationType::Sum => Some(Value::Double(self.sum)),
            AggregationType::Avg => Some(Value::Double(self.sum / self.count as f64)),
            AggregationType::MinValue => self.min.clone(),
            AggregationType::MaxValue => self.max.clone(),
            AggregationType::FirstValue => self.first.as_ref().map(|(_, v)| v.clone()),
            AggregationType::LastValue => self.last.as_ref().map(|(_, v)| v.clone()),
            AggregationType::MinTime => self.first.as_ref().map(|(t, _)| Value::Int64(*t)),
            AggregationType::MaxTime => self.last.as_ref().map(|(t, _)| Value::Int64(*t)),
        }
    }
}

/// One state per output column of `plan`
pub(crate) fn new_states(plan: &AggregationPlan) -> Result<Vec<AggregateState>> {
    plan.columns
        .iter()
        .map(|column| {
            AggregateState::new(
                column.aggregation,
                plan.series.data_types()[column.series_index],
            )
        })
        .collect()
}

pub(crate) fn aggregate_columns(plan: &AggregationPlan) -> Vec<ColumnHeader> {
    plan.columns
        .iter()
        .map(|column| ColumnHeader::new(plan.column_name(column), plan.column_type(column)))
        .collect()
}

/// Feed a row of series values into the column states
pub(crate) fn accumulate(plan: &AggregationPlan, states: &mut [AggregateState], row: &RowRecord) {
    let timestamp = row.timestamp.unwrap_or_default();
    for (column, state) in plan.columns.iter().zip(states.iter_mut()) {
        if let Some(Some(value)) = row.fields.get(column.series_index) {
            state.update(timestamp, value);
        }
    }
}

/// Drain `source` (one field per plan series) into a single result row
pub(crate) async fn aggregate_rows(
    plan: &AggregationPlan,
    source: &mut dyn QueryDataSet,
) -> Result<RowRecord> {
    let mut states = new_states(plan)?;
    while let Some(row) = source.next_row().await? {
        accumulate(plan, &mut states, &row);
    }
    Ok(RowRecord::new(
        0,
        states.iter().map(AggregateState::result).collect(),
    ))
}
