//! # chronoraft
//!
//! Distributed query coordination for a clustered time-series database.
//!
//! Series are grouped into partitions by storage group. Each partition is
//! placed on `replication` nodes by a consistent hash ring and replicated by
//! its own Raft group; a reserved metadata group spanning every node holds
//! the schema. Queries are routed by plan shape and filter shape to a
//! specialized executor that reads from the owning replicas at a tunable
//! consistency level.
//!
//! ## Layout
//!
//! - **cluster**: hash ring, topology, QP task pool, inner RPC, data nodes
//! - **raft**: per-partition replication groups
//! - **query**: plans, filter optimization, routing, executors, result sets
//! - **storage**: the per-node storage engine seam and an in-memory engine
//! - **coordinator**: the entry point tying the above together

pub mod clock;
pub mod cluster;
pub mod config;
pub mod coordinator;
pub mod query;
pub mod raft;
pub mod storage;
pub mod telemetry;

mod error;

pub use error::{Error, Result};

/// Re-exports for convenience
pub mod prelude {
    pub use crate::cluster::{ClusterTopology, LocalCluster, NodeId, QpTaskPool};
    pub use crate::config::{ClusterConfig, ConsistencyLevel};
    pub use crate::coordinator::Coordinator;
    pub use crate::query::{
        AggregationPlan, AggregationType, DataType, Expression, FillQueryPlan, FillStrategy,
        Filter, GroupByFillPlan, GroupByPlan, GroupByWindow, LastQueryPlan, QueryDataSet,
        QueryPlan, RawDataQueryPlan, SeriesPath, SeriesSelection, TimeValuePair, Value,
    };
    pub use crate::{Error, Result};
}
