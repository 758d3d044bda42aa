//! Router dispatch through the public executor seam

use chronoraft::query::{
    collect_rows, AggregationPlan, AggregationType, ColumnHeader, CompareOp, DataType,
    Expression, FillQueryPlan, FillStrategy, Filter, GroupByFillPlan, GroupByPlan,
    GroupByWindow, LastQueryPlan, MemoryDataSet, QueryContext, QueryDataSet, QueryExecutor,
    QueryPlan, QueryRouter, RawDataQueryPlan, RowRecord, SeriesSelection, Value,
};
use chronoraft::{Error, Result};

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Answers group by with fixed windows and records every call
#[derive(Default)]
struct CannedExecutor {
    calls: Mutex<Vec<&'static str>>,
}

impl CannedExecutor {
    fn empty(&self, method: &'static str) -> Result<Box<dyn QueryDataSet>> {
        self.calls.lock().push(method);
        Ok(Box::new(MemoryDataSet::default()))
    }

    fn windows(&self, method: &'static str, plan: &GroupByPlan) -> Result<Box<dyn QueryDataSet>> {
        self.calls.lock().push(method);
        let columns = plan
            .aggregation
            .columns
            .iter()
            .map(|c| {
                ColumnHeader::new(
                    plan.aggregation.column_name(c),
                    plan.aggregation.column_type(c),
                )
            })
            .collect();
        let rows = vec![
            RowRecord::new(0, vec![Some(Value::Double(1.5))]),
            RowRecord::new(100, vec![None]),
            RowRecord::new(200, vec![Some(Value::Double(3.0))]),
            RowRecord::new(300, vec![None]),
        ];
        Ok(Box::new(MemoryDataSet::new(columns, rows)))
    }
}

#[async_trait]
impl QueryExecutor for CannedExecutor {
    async fn raw_data_non_aligned(
        &self,
        _: RawDataQueryPlan,
        _: &QueryContext,
    ) -> Result<Box<dyn QueryDataSet>> {
        self.empty("raw_non_aligned")
    }
    async fn raw_data_without_value_filter(
        &self,
        _: RawDataQueryPlan,
        _: &QueryContext,
    ) -> Result<Box<dyn QueryDataSet>> {
        self.empty("raw_without")
    }
    async fn raw_data_with_value_filter(
        &self,
        _: RawDataQueryPlan,
        _: &QueryContext,
    ) -> Result<Box<dyn QueryDataSet>> {
        self.empty("raw_with")
    }
    async fn aggregate_without_value_filter(
        &self,
        _: AggregationPlan,
        _: &QueryContext,
    ) -> Result<Box<dyn QueryDataSet>> {
        self.empty("agg_without")
    }
    async fn aggregate_with_value_filter(
        &self,
        _: AggregationPlan,
        _: &QueryContext,
    ) -> Result<Box<dyn QueryDataSet>> {
        self.empty("agg_with")
    }
    async fn group_by_without_value_filter(
        &self,
        plan: GroupByPlan,
        _: &QueryContext,
    ) -> Result<Box<dyn QueryDataSet>> {
        self.windows("group_by_without", &plan)
    }
    async fn group_by_with_value_filter(
        &self,
        plan: GroupByPlan,
        _: &QueryContext,
    ) -> Result<Box<dyn QueryDataSet>> {
        self.windows("group_by_with", &plan)
    }
    async fn fill(&self, _: FillQueryPlan, _: &QueryContext) -> Result<Box<dyn QueryDataSet>> {
        self.empty("fill")
    }
    async fn last(&self, _: LastQueryPlan, _: &QueryContext) -> Result<Box<dyn QueryDataSet>> {
        self.empty("last")
    }
}

const S1: &str = "root.sg1.d1.s1";

fn setup() -> (Arc<CannedExecutor>, QueryRouter) {
    let executor = Arc::new(CannedExecutor::default());
    (executor.clone(), QueryRouter::new(executor))
}

fn max_value(expression: Option<Expression>) -> AggregationPlan {
    AggregationPlan::new(
        vec![S1.into()],
        vec![DataType::Double],
        vec![AggregationType::MaxValue],
        expression,
    )
    .unwrap()
}

fn value_gt(threshold: f64) -> Expression {
    Expression::series(S1, Filter::value(CompareOp::Gt, Value::Double(threshold)))
}

#[tokio::test]
async fn test_aggregation_classified_by_filter_shape() {
    let (executor, router) = setup();
    let context = QueryContext::default();
    let time = Expression::global_time(Filter::time_range(0, 1_000));

    for expression in [None, Some(time.clone()), Some(time.and(value_gt(2.0)))] {
        router
            .execute(QueryPlan::Aggregation(max_value(expression)), &context)
            .await
            .unwrap();
    }
    assert_eq!(
        *executor.calls.lock(),
        vec!["agg_without", "agg_without", "agg_with"]
    );
}

#[tokio::test]
async fn test_group_by_with_value_filter_takes_filtered_path() {
    let (executor, router) = setup();
    let window = GroupByWindow::new(100, 100, 0, 400);
    let plan = GroupByPlan::new(max_value(Some(value_gt(0.0))), window);
    let mut result = router
        .execute(QueryPlan::GroupBy(plan), &QueryContext::default())
        .await
        .unwrap();
    assert_eq!(collect_rows(result.as_mut()).await.unwrap().len(), 4);
    assert_eq!(*executor.calls.lock(), vec!["group_by_with"]);
}

#[tokio::test]
async fn test_group_by_fill_carries_previous_window() {
    let (_, router) = setup();
    let window = GroupByWindow::new(100, 100, 0, 400);
    let plan = GroupByFillPlan {
        group_by: GroupByPlan::new(max_value(None), window),
        fill: HashMap::from([(DataType::Double, FillStrategy::previous())]),
    };
    let mut result = router
        .execute(QueryPlan::GroupByFill(plan), &QueryContext::default())
        .await
        .unwrap();
    let values: Vec<_> = collect_rows(result.as_mut())
        .await
        .unwrap()
        .into_iter()
        .map(|row| row.fields[0].clone())
        .collect();
    assert_eq!(
        values,
        vec![
            Some(Value::Double(1.5)),
            Some(Value::Double(1.5)),
            Some(Value::Double(3.0)),
            Some(Value::Double(3.0)),
        ]
    );
}

#[tokio::test]
async fn test_group_by_fill_rejects_linear() {
    let (_, router) = setup();
    let plan = GroupByFillPlan {
        group_by: GroupByPlan::new(max_value(None), GroupByWindow::new(100, 100, 0, 400)),
        fill: HashMap::from([(DataType::Double, FillStrategy::linear())]),
    };
    let err = router
        .execute(QueryPlan::GroupByFill(plan), &QueryContext::default())
        .await
        .err()
        .unwrap();
    assert!(matches!(err, Error::UnsupportedFill(_)));
}

#[tokio::test]
async fn test_invalid_window_fails_before_execution() {
    let (executor, router) = setup();
    let plan = GroupByPlan::new(max_value(None), GroupByWindow::new(0, 0, 0, 400));
    let err = router
        .execute(QueryPlan::GroupBy(plan), &QueryContext::default())
        .await
        .err()
        .unwrap();
    assert!(matches!(err, Error::StorageEngine(_)));
    assert!(executor.calls.lock().is_empty());
}

#[tokio::test]
async fn test_fill_and_last_dispatch_directly() {
    let (executor, router) = setup();
    let context = QueryContext::default();
    let series = SeriesSelection::single(S1, DataType::Double);

    router
        .execute(
            QueryPlan::Fill(FillQueryPlan {
                series: series.clone(),
                query_time: 50,
                fill: HashMap::new(),
            }),
            &context,
        )
        .await
        .unwrap();
    router
        .execute(QueryPlan::Last(LastQueryPlan { series }), &context)
        .await
        .unwrap();
    assert_eq!(*executor.calls.lock(), vec!["fill", "last"]);
}
