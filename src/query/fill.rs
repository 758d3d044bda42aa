//! Fill strategies for missing values

use super::dataset::{ColumnHeader, QueryDataSet, RowRecord};
use super::expression::{TimeValuePair, Value};
use super::plan::DataType;
use crate::{Error, Result};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// How a missing value at a timestamp is derived from neighbouring points
///
/// Ranges bound how far (in ms) a neighbour may be; `None` is unbounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FillStrategy {
    /// Nearest earlier value
    Previous { before_range: Option<i64> },
    /// Interpolate between the nearest earlier and later values
    Linear {
        before_range: Option<i64>,
        after_range: Option<i64>,
    },
}

impl FillStrategy {
    pub fn previous() -> Self {
        FillStrategy::Previous { before_range: None }
    }

    pub fn linear() -> Self {
        FillStrategy::Linear {
            before_range: None,
            after_range: None,
        }
    }

    pub fn before_range(&self) -> Option<i64> {
        match self {
            FillStrategy::Previous { before_range } | FillStrategy::Linear { before_range, .. } => {
                *before_range
            }
        }
    }

    /// Reject strategies that cannot produce a value of `data_type`
    pub fn check(&self, data_type: DataType) -> Result<()> {
        if matches!(self, FillStrategy::Linear { .. }) && !data_type.is_numeric() {
            return Err(Error::UnsupportedFill(format!(
                "linear fill needs a numeric series, got {}",
                data_type
            )));
        }
        Ok(())
    }
}

/// Whether a neighbour `distance` ms away is within `range`
pub fn within(range: Option<i64>, distance: i64) -> bool {
    range.map_or(true, |range| distance <= range)
}

/// Value at `at` on the line through `before` and `after`
pub fn interpolate(
    before: &TimeValuePair,
    after: &TimeValuePair,
    at: i64,
    data_type: DataType,
) -> Option<Value> {
    if before.timestamp == after.timestamp {
        return Some(before.value.clone());
    }
    let (y0, y1) = (before.value.as_f64()?, after.value.as_f64()?);
    let ratio = (at - before.timestamp) as f64 / (after.timestamp - before.timestamp) as f64;
    Value::from_f64(y0 + (y1 - y0) * ratio, data_type)
}

/// Decorates a group-by result, filling empty windows with the previous
/// window's value
pub struct GroupByFillDataSet {
    inner: Box<dyn QueryDataSet>,
    strategies: Vec<Option<FillStrategy>>,
    previous: Vec<Option<(i64, Value)>>,
}

impl GroupByFillDataSet {
    /// `source_types[i]` is the series type behind output column `i`
    pub fn new(
        inner: Box<dyn QueryDataSet>,
        source_types: &[DataType],
        fill: &HashMap<DataType, FillStrategy>,
    ) -> Result<Self> {
        let strategies = source_types
            .iter()
            .map(|data_type| match fill.get(data_type) {
                Some(FillStrategy::Linear { .. }) => Err(Error::UnsupportedFill(
                    "group by fill supports PREVIOUS only".to_string(),
                )),
                Some(strategy) => Ok(Some(*strategy)),
                None => Ok(None),
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            inner,
            previous: vec![None; strategies.len()],
            strategies,
        })
    }
}

#[async_trait]
impl QueryDataSet for GroupByFillDataSet {
    fn columns(&self) -> &[ColumnHeader] {
        self.inner.columns()
    }

    async fn next_row(&mut self) -> Result<Option<RowRecord>> {
        let Some(mut row) = self.inner.next_row().await? else {
            return Ok(None);
        };
        let timestamp = row.timestamp.unwrap_or_default();
        for (i, field) in row.fields.iter_mut().enumerate() {
            match field {
                Some(value) => {
                    if let Some(slot) = self.previous.get_mut(i) {
                        *slot = Some((timestamp, value.clone()));
                    }
                }
                None => {
                    let strategy = self.strategies.get(i).copied().flatten();
                    let previous = self.previous.get(i).cloned().flatten();
                    if let (Some(strategy), Some((at, value))) = (strategy, previous) {
                        if within(strategy.before_range(), timestamp - at) {
                            *field = Some(value);
                        }
                    }
                }
            }
        }
        Ok(Some(row))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::dataset::{collect_rows, MemoryDataSet};

    #[test]
    fn test_linear_interpolation() {
        let before = TimeValuePair::new(0, Value::Double(0.0));
        let after = TimeValuePair::new(10, Value::Double(100.0));
        assert_eq!(
            interpolate(&before, &after, 5, DataType::Double),
            Some(Value::Double(50.0))
        );

        let before = TimeValuePair::new(0, Value::Int32(1));
        let after = TimeValuePair::new(4, Value::Int32(2));
        assert_eq!(
            interpolate(&before, &after, 2, DataType::Int32),
            Some(Value::Int32(1))
        );
    }

    #[test]
    fn test_linear_requires_numeric() {
        assert!(FillStrategy::linear().check(DataType::Double).is_ok());
        assert!(matches!(
            FillStrategy::linear().check(DataType::Text),
            Err(Error::UnsupportedFill(_))
        ));
        assert!(FillStrategy::previous().check(DataType::Boolean).is_ok());
    }

    #[tokio::test]
    async fn test_group_by_fill_uses_previous_window() {
        let columns = vec![ColumnHeader::new("max_value(root.sg.d1.s1)", DataType::Int32)];
        let rows = vec![
            RowRecord::new(0, vec![Some(Value::Int32(4))]),
            RowRecord::new(10, vec![None]),
            RowRecord::new(20, vec![None]),
            RowRecord::new(30, vec![Some(Value::Int32(8))]),
        ];
        let inner = Box::new(MemoryDataSet::new(columns, rows));
        let fill = HashMap::from([(
            DataType::Int32,
            FillStrategy::Previous {
                before_range: Some(10),
            },
        )]);
        let mut dataset = GroupByFillDataSet::new(inner, &[DataType::Int32], &fill).unwrap();
        let rows = collect_rows(&mut dataset).await.unwrap();
        let values: Vec<_> = rows.iter().map(|r| r.fields[0].clone()).collect();
        // Window 20 is 20ms past the last real value, beyond before_range
        assert_eq!(
            values,
            vec![
                Some(Value::Int32(4)),
                Some(Value::Int32(4)),
                None,
                Some(Value::Int32(8))
            ]
        );
    }

    #[test]
    fn test_group_by_fill_rejects_linear() {
        let inner = Box::new(MemoryDataSet::default());
        let fill = HashMap::from([(DataType::Double, FillStrategy::linear())]);
        let err = GroupByFillDataSet::new(inner, &[DataType::Double], &fill)
            .err()
            .unwrap();
        assert!(matches!(err, Error::UnsupportedFill(_)));
    }
}
