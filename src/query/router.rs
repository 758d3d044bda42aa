//! Plan dispatch
//!
//! Every entry point follows the same steps: optimize the plan's filter
//! against its series, rebind the result onto a new plan value, then pick
//! the executor method from the optimized filter's shape. A filter that is
//! absent or GLOBAL_TIME takes the "without value filter" path.

use super::dataset::QueryDataSet;
use super::executor::QueryExecutor;
use super::expression::{Expression, Filter};
use super::fill::GroupByFillDataSet;
use super::optimizer::ExpressionOptimizer;
use super::plan::{
    AggregationPlan, FillQueryPlan, GroupByFillPlan, GroupByPlan, LastQueryPlan, QueryPlan,
    RawDataQueryPlan, SeriesPath,
};
use super::QueryContext;
use crate::{Error, Result};

use std::sync::Arc;
use tracing::{debug, info_span, warn, Instrument};

pub struct QueryRouter {
    optimizer: ExpressionOptimizer,
    executor: Arc<dyn QueryExecutor>,
}

fn has_value_filter(expression: Option<&Expression>) -> bool {
    expression.is_some_and(|e| !e.is_global_time())
}

impl QueryRouter {
    pub fn new(executor: Arc<dyn QueryExecutor>) -> Self {
        Self {
            optimizer: ExpressionOptimizer::new(),
            executor,
        }
    }

    pub async fn execute(
        &self,
        plan: QueryPlan,
        context: &QueryContext,
    ) -> Result<Box<dyn QueryDataSet>> {
        let span = info_span!(
            "query.route",
            query_id = context.query_id,
            plan = plan.name(),
            series = plan.series().len()
        );
        async move {
            let result = match plan {
                QueryPlan::RawData(plan) => self.raw_data(plan, context).await,
                QueryPlan::Aggregation(plan) => self.aggregate(plan, context).await,
                QueryPlan::GroupBy(plan) => self.group_by(plan, context).await,
                QueryPlan::GroupByFill(plan) => self.group_by_fill(plan, context).await,
                QueryPlan::Fill(plan) => self.fill(plan, context).await,
                QueryPlan::Last(plan) => self.last(plan, context).await,
            };
            if let Err(e) = &result {
                warn!(error = %e, "Query failed");
            }
            result
        }
        .instrument(span)
        .await
    }

    /// Optimize `expression` against `paths`; failures surface as storage
    /// engine errors and nothing is executed
    fn optimize(
        &self,
        expression: Option<&Expression>,
        paths: &[SeriesPath],
    ) -> Result<Option<Expression>> {
        expression
            .map(|expression| self.optimizer.optimize(expression, paths))
            .transpose()
            .map_err(|e| Error::StorageEngine(format!("query optimization failed: {}", e)))
    }

    pub async fn raw_data(
        &self,
        plan: RawDataQueryPlan,
        context: &QueryContext,
    ) -> Result<Box<dyn QueryDataSet>> {
        let optimized = self.optimize(plan.expression.as_ref(), plan.series.paths())?;
        let plan = plan.with_expression(optimized);
        if !plan.align_by_time {
            debug!("Raw data, non-aligned");
            return self.executor.raw_data_non_aligned(plan, context).await;
        }
        if has_value_filter(plan.expression.as_ref()) {
            debug!("Raw data with value filter");
            self.executor.raw_data_with_value_filter(plan, context).await
        } else {
            debug!("Raw data without value filter");
            self.executor.raw_data_without_value_filter(plan, context).await
        }
    }

    pub async fn aggregate(
        &self,
        plan: AggregationPlan,
        context: &QueryContext,
    ) -> Result<Box<dyn QueryDataSet>> {
        let optimized = self.optimize(plan.expression.as_ref(), plan.series.paths())?;
        let plan = plan.with_expression(optimized);
        if has_value_filter(plan.expression.as_ref()) {
            debug!("Aggregation with value filter");
            self.executor.aggregate_with_value_filter(plan, context).await
        } else {
            debug!("Aggregation without value filter");
            self.executor.aggregate_without_value_filter(plan, context).await
        }
    }

    pub async fn group_by(
        &self,
        plan: GroupByPlan,
        context: &QueryContext,
    ) -> Result<Box<dyn QueryDataSet>> {
        // Every group by is bounded by its windows, user filter or not
        let window = Expression::global_time(Filter::GroupBy(plan.window));
        let expression = match plan.expression() {
            Some(user) => window.and(user.clone()),
            None => window,
        };
        let optimized = self.optimize(Some(&expression), plan.aggregation.series.paths())?;
        let plan = plan.with_expression(optimized);
        if has_value_filter(plan.expression()) {
            debug!("Group by with value filter");
            self.executor.group_by_with_value_filter(plan, context).await
        } else {
            debug!("Group by without value filter");
            self.executor.group_by_without_value_filter(plan, context).await
        }
    }

    pub async fn group_by_fill(
        &self,
        plan: GroupByFillPlan,
        context: &QueryContext,
    ) -> Result<Box<dyn QueryDataSet>> {
        let GroupByFillPlan { group_by, fill } = plan;
        let source_types: Vec<_> = group_by
            .aggregation
            .columns
            .iter()
            .map(|column| group_by.aggregation.series.data_types()[column.series_index])
            .collect();
        let windows = self.group_by(group_by, context).await?;
        Ok(Box::new(GroupByFillDataSet::new(
            windows,
            &source_types,
            &fill,
        )?))
    }

    pub async fn fill(
        &self,
        plan: FillQueryPlan,
        context: &QueryContext,
    ) -> Result<Box<dyn QueryDataSet>> {
        debug!(query_time = plan.query_time, "Fill");
        self.executor.fill(plan, context).await
    }

    pub async fn last(
        &self,
        plan: LastQueryPlan,
        context: &QueryContext,
    ) -> Result<Box<dyn QueryDataSet>> {
        debug!("Last");
        self.executor.last(plan, context).await
    }
}
