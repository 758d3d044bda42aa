//! Windowed aggregation

use super::aggregate::{accumulate, aggregate_columns, new_states, AggregateState};
use crate::query::dataset::{ColumnHeader, QueryDataSet, RowRecord};
use crate::query::expression::GroupByWindow;
use crate::query::plan::AggregationPlan;
use crate::Result;

use async_trait::async_trait;
use std::collections::VecDeque;

/// One row per window, stamped with the window start
///
/// Source rows are buffered until no later window can contain them, so
/// overlapping windows (`sliding_step < interval`) see every row they cover.
pub struct GroupByDataSet {
    plan: AggregationPlan,
    columns: Vec<ColumnHeader>,
    source: Box<dyn QueryDataSet>,
    window: GroupByWindow,
    /// Start of the next window to emit
    next_start: Option<i64>,
    buffer: VecDeque<RowRecord>,
    source_done: bool,
}

impl GroupByDataSet {
    pub fn new(
        plan: AggregationPlan,
        window: GroupByWindow,
        source: Box<dyn QueryDataSet>,
    ) -> Result<Self> {
        // Fail on bad aggregations before any row is read
        new_states(&plan)?;
        Ok(Self {
            columns: aggregate_columns(&plan),
            plan,
            source,
            next_start: window.windows().next().map(|(start, _)| start),
            window,
            buffer: VecDeque::new(),
            source_done: false,
        })
    }

    /// Buffer source rows until one at or past `end` is seen
    async fn read_until(&mut self, end: i64) -> Result<()> {
        while !self.source_done
            && self
                .buffer
                .back()
                .map_or(true, |row| row.timestamp.unwrap_or_default() < end)
        {
            match self.source.next_row().await? {
                Some(row) => self.buffer.push_back(row),
                None => self.source_done = true,
            }
        }
        Ok(())
    }
}

#[async_trait]
impl QueryDataSet for GroupByDataSet {
    fn columns(&self) -> &[ColumnHeader] {
        &self.columns
    }

    async fn next_row(&mut self) -> Result<Option<RowRecord>> {
        let Some((start, end)) = self.next_start.and_then(|s| self.window.window_at(s)) else {
            return Ok(None);
        };
        self.next_start = self.window.next_start(start);
        while self
            .buffer
            .front()
            .is_some_and(|row| row.timestamp.unwrap_or_default() < start)
        {
            self.buffer.pop_front();
        }
        self.read_until(end).await?;

        let mut states = new_states(&self.plan)?;
        for row in self
            .buffer
            .iter()
            .take_while(|row| row.timestamp.unwrap_or_default() < end)
        {
            accumulate(&self.plan, &mut states, row);
        }
        Ok(Some(RowRecord::new(
            start,
            states.iter().map(AggregateState::result).collect(),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::dataset::{collect_rows, MemoryDataSet};
    use crate::query::expression::Value;
    use crate::query::plan::{AggregationType, DataType, SeriesPath};

    fn source() -> Box<dyn QueryDataSet> {
        let rows = [1, 4, 6, 12]
            .into_iter()
            .map(|t| RowRecord::new(t, vec![Some(Value::Int64(t))]))
            .collect();
        Box::new(MemoryDataSet::new(Vec::new(), rows))
    }

    fn count_plan() -> AggregationPlan {
        AggregationPlan::new(
            vec![SeriesPath::new("root.sg.d1.s1")],
            vec![DataType::Int64],
            vec![AggregationType::Count],
            None,
        )
        .unwrap()
    }

    fn counts(rows: &[RowRecord]) -> Vec<(i64, Option<Value>)> {
        rows.iter()
            .map(|r| (r.timestamp.unwrap(), r.fields[0].clone()))
            .collect()
    }

    #[tokio::test]
    async fn test_tumbling_windows_with_empty_window() {
        let mut dataset =
            GroupByDataSet::new(count_plan(), GroupByWindow::new(5, 5, 0, 20), source()).unwrap();
        assert_eq!(dataset.columns()[0].name, "count(root.sg.d1.s1)");
        let rows = collect_rows(&mut dataset).await.unwrap();
        assert_eq!(
            counts(&rows),
            vec![
                (0, Some(Value::Int64(2))),
                (5, Some(Value::Int64(1))),
                (10, Some(Value::Int64(1))),
                (15, Some(Value::Int64(0))),
            ]
        );
    }

    #[tokio::test]
    async fn test_sliding_windows_share_rows() {
        let mut dataset =
            GroupByDataSet::new(count_plan(), GroupByWindow::new(10, 5, 0, 15), source()).unwrap();
        let rows = collect_rows(&mut dataset).await.unwrap();
        // [0,10) [5,15) [10,15)
        assert_eq!(
            counts(&rows),
            vec![
                (0, Some(Value::Int64(3))),
                (5, Some(Value::Int64(2))),
                (10, Some(Value::Int64(1))),
            ]
        );
    }

    #[tokio::test]
    async fn test_windows_are_produced_on_demand() {
        // Far more windows than could ever be materialised up front
        let window = GroupByWindow::new(5, 5, 0, i64::MAX);
        let mut dataset = GroupByDataSet::new(count_plan(), window, source()).unwrap();
        let mut rows = Vec::new();
        for _ in 0..3 {
            rows.push(dataset.next_row().await.unwrap().unwrap());
        }
        assert_eq!(
            counts(&rows),
            vec![
                (0, Some(Value::Int64(2))),
                (5, Some(Value::Int64(1))),
                (10, Some(Value::Int64(1))),
            ]
        );
    }
}
