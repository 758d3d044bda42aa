//! Execution strategies, one per query shape
//!
//! [`QueryExecutor`] is the seam between the router and execution: the
//! router decides which method to call, the executor decides how to read.
//! [`ClusterQueryExecutor`] reads through the replication layer.

mod aggregate;
mod fill;
mod group_by;
mod last;
mod raw;
mod reader;

pub use aggregate::AggregateState;
pub use group_by::GroupByDataSet;
pub use last::{LAST_SERIES_COLUMN, LAST_VALUE_COLUMN};
pub use raw::{AlignedDataSet, FilteredDataSet, NonAlignedDataSet};
pub use reader::{ReaderByTimestamp, SeriesFetcher, SeriesReader, TimeGenerator};

use super::dataset::{MemoryDataSet, QueryDataSet};
use super::expression::Expression;
use super::plan::{AggregationPlan, FillQueryPlan, GroupByPlan, LastQueryPlan, RawDataQueryPlan};
use super::QueryContext;
use crate::clock::MonotonicClock;
use crate::{Error, Result};

use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

/// Executes plans whose filter has already been optimized
#[async_trait]
pub trait QueryExecutor: Send + Sync {
    async fn raw_data_non_aligned(
        &self,
        plan: RawDataQueryPlan,
        context: &QueryContext,
    ) -> Result<Box<dyn QueryDataSet>>;

    async fn raw_data_without_value_filter(
        &self,
        plan: RawDataQueryPlan,
        context: &QueryContext,
    ) -> Result<Box<dyn QueryDataSet>>;

    async fn raw_data_with_value_filter(
        &self,
        plan: RawDataQueryPlan,
        context: &QueryContext,
    ) -> Result<Box<dyn QueryDataSet>>;

    async fn aggregate_without_value_filter(
        &self,
        plan: AggregationPlan,
        context: &QueryContext,
    ) -> Result<Box<dyn QueryDataSet>>;

    async fn aggregate_with_value_filter(
        &self,
        plan: AggregationPlan,
        context: &QueryContext,
    ) -> Result<Box<dyn QueryDataSet>>;

    async fn group_by_without_value_filter(
        &self,
        plan: GroupByPlan,
        context: &QueryContext,
    ) -> Result<Box<dyn QueryDataSet>>;

    async fn group_by_with_value_filter(
        &self,
        plan: GroupByPlan,
        context: &QueryContext,
    ) -> Result<Box<dyn QueryDataSet>>;

    async fn fill(&self, plan: FillQueryPlan, context: &QueryContext)
        -> Result<Box<dyn QueryDataSet>>;

    async fn last(&self, plan: LastQueryPlan, context: &QueryContext)
        -> Result<Box<dyn QueryDataSet>>;
}

pub struct ClusterQueryExecutor {
    fetcher: Arc<SeriesFetcher>,
    clock: Arc<MonotonicClock>,
}

impl ClusterQueryExecutor {
    pub fn new(fetcher: Arc<SeriesFetcher>, clock: Arc<MonotonicClock>) -> Self {
        Self { fetcher, clock }
    }

    pub fn fetcher(&self) -> &Arc<SeriesFetcher> {
        &self.fetcher
    }
}

fn value_filter(expression: Option<&Expression>) -> Result<&Expression> {
    match expression {
        Some(expression) if !expression.is_global_time() => Ok(expression),
        _ => Err(Error::Query(
            "value filter execution needs a series expression".to_string(),
        )),
    }
}

#[async_trait]
impl QueryExecutor for ClusterQueryExecutor {
    async fn raw_data_non_aligned(
        &self,
        plan: RawDataQueryPlan,
        context: &QueryContext,
    ) -> Result<Box<dyn QueryDataSet>> {
        Ok(Box::new(NonAlignedDataSet::new(
            &self.fetcher,
            &plan.series,
            plan.expression.as_ref(),
            context,
        )?))
    }

    async fn raw_data_without_value_filter(
        &self,
        plan: RawDataQueryPlan,
        context: &QueryContext,
    ) -> Result<Box<dyn QueryDataSet>> {
        let filter = raw::global_time_filter(plan.expression.as_ref())?;
        Ok(Box::new(AlignedDataSet::new(
            &self.fetcher,
            &plan.series,
            filter,
            context,
        )))
    }

    async fn raw_data_with_value_filter(
        &self,
        plan: RawDataQueryPlan,
        context: &QueryContext,
    ) -> Result<Box<dyn QueryDataSet>> {
        let expression = value_filter(plan.expression.as_ref())?;
        Ok(Box::new(FilteredDataSet::new(
            &self.fetcher,
            &plan.series,
            expression,
            context,
        )?))
    }

    async fn aggregate_without_value_filter(
        &self,
        plan: AggregationPlan,
        context: &QueryContext,
    ) -> Result<Box<dyn QueryDataSet>> {
        let filter = raw::global_time_filter(plan.expression.as_ref())?;
        let mut source = AlignedDataSet::new(&self.fetcher, &plan.series, filter, context);
        let row = aggregate::aggregate_rows(&plan, &mut source).await?;
        Ok(Box::new(MemoryDataSet::new(
            aggregate::aggregate_columns(&plan),
            vec![row],
        )))
    }

    async fn aggregate_with_value_filter(
        &self,
        plan: AggregationPlan,
        context: &QueryContext,
    ) -> Result<Box<dyn QueryDataSet>> {
        let expression = value_filter(plan.expression.as_ref())?;
        let mut source = FilteredDataSet::new(&self.fetcher, &plan.series, expression, context)?;
        let row = aggregate::aggregate_rows(&plan, &mut source).await?;
        Ok(Box::new(MemoryDataSet::new(
            aggregate::aggregate_columns(&plan),
            vec![row],
        )))
    }

    async fn group_by_without_value_filter(
        &self,
        plan: GroupByPlan,
        context: &QueryContext,
    ) -> Result<Box<dyn QueryDataSet>> {
        let filter = raw::global_time_filter(plan.expression())?;
        let source = AlignedDataSet::new(&self.fetcher, &plan.aggregation.series, filter, context);
        debug!(
            query_id = context.query_id,
            windows = plan.window.window_count(),
            "Group by without value filter"
        );
        Ok(Box::new(GroupByDataSet::new(
            plan.aggregation,
            plan.window,
            Box::new(source),
        )?))
    }

    async fn group_by_with_value_filter(
        &self,
        plan: GroupByPlan,
        context: &QueryContext,
    ) -> Result<Box<dyn QueryDataSet>> {
        let expression = value_filter(plan.expression())?;
        let source =
            FilteredDataSet::new(&self.fetcher, &plan.aggregation.series, expression, context)?;
        debug!(
            query_id = context.query_id,
            windows = plan.window.window_count(),
            "Group by with value filter"
        );
        Ok(Box::new(GroupByDataSet::new(
            plan.aggregation,
            plan.window,
            Box::new(source),
        )?))
    }

    async fn fill(
        &self,
        plan: FillQueryPlan,
        context: &QueryContext,
    ) -> Result<Box<dyn QueryDataSet>> {
        let row = fill::fill_row(&self.fetcher, &plan, context.data_consistency).await?;
        Ok(Box::new(MemoryDataSet::new(
            fill::fill_columns(&plan),
            vec![row],
        )))
    }

    async fn last(
        &self,
        plan: LastQueryPlan,
        context: &QueryContext,
    ) -> Result<Box<dyn QueryDataSet>> {
        let now = self.clock.now_millis();
        let rows = last::last_rows(&self.fetcher, &plan, now, context.data_consistency).await?;
        Ok(Box::new(MemoryDataSet::new(last::last_columns(), rows)))
    }
}
