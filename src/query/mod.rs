//! Query planning and execution for the coordinator
//!
//! A [`QueryPlan`] arrives from the planner already validated and
//! deduplicated. The [`QueryRouter`] rewrites its filter with the
//! [`ExpressionOptimizer`], picks the execution strategy from the plan shape
//! and the optimized filter, and hands the rebound plan to a
//! [`QueryExecutor`]. Executors read from the replicas that own each series
//! and return a lazy [`QueryDataSet`].

mod dataset;
pub mod executor;
mod expression;
mod fill;
mod optimizer;
mod plan;
mod router;

pub use dataset::{
    collect_rows, to_record_batch, ColumnHeader, MemoryDataSet, QueryDataSet, RowRecord,
    TIME_COLUMN,
};
pub use executor::{ClusterQueryExecutor, QueryExecutor, SeriesFetcher};
pub use expression::{
    CompareOp, Expression, ExpressionType, Filter, GroupByWindow, TimeValuePair, Value,
};
pub use fill::{interpolate, FillStrategy, GroupByFillDataSet};
pub use optimizer::ExpressionOptimizer;
pub use plan::{
    AggregateColumn, AggregationPlan, AggregationType, DataType, FillQueryPlan, GroupByFillPlan,
    GroupByPlan, LastQueryPlan, QueryPlan, RawDataQueryPlan, SeriesPath, SeriesSelection,
};
pub use router::QueryRouter;

use crate::config::{ClusterConfig, ConsistencyLevel};
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_QUERY_ID: AtomicU64 = AtomicU64::new(1);

/// Per-query execution settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryContext {
    pub query_id: u64,
    /// Consistency of series reads
    pub data_consistency: ConsistencyLevel,
    /// Consistency of schema lookups
    pub metadata_consistency: ConsistencyLevel,
    /// Points per remote fetch
    pub batch_read_size: usize,
    /// Fetched batches buffered per series before prefetch blocks
    pub max_cached_batches: usize,
}

impl QueryContext {
    pub fn from_config(config: &ClusterConfig) -> Self {
        Self {
            query_id: NEXT_QUERY_ID.fetch_add(1, Ordering::Relaxed),
            data_consistency: config.read_data_consistency_level,
            metadata_consistency: config.read_metadata_consistency_level,
            batch_read_size: config.batch_read_size,
            max_cached_batches: config.max_cached_batch_data_list_size,
        }
    }

    pub fn with_data_consistency(self, level: ConsistencyLevel) -> Self {
        Self {
            data_consistency: level,
            ..self
        }
    }
}

impl Default for QueryContext {
    fn default() -> Self {
        Self::from_config(&ClusterConfig::default())
    }
}
