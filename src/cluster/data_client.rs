//! Inner RPC between coordinators and data nodes

use super::data_node::DataNode;
use super::NodeId;
use crate::config::ConsistencyLevel;
use crate::query::{DataType, Filter, SeriesPath, TimeValuePair};
use crate::raft::{GroupId, LogIndex, LocalNetwork};
use crate::{Error, Result};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::trace;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DataRequest {
    /// One batch of points after `after`, ascending
    Scan {
        path: SeriesPath,
        filter: Option<Filter>,
        after: Option<i64>,
        limit: usize,
    },
    Latest {
        path: SeriesPath,
        at_or_before: i64,
    },
    Earliest {
        path: SeriesPath,
        at_or_after: i64,
    },
    DataType {
        path: SeriesPath,
    },
    RegisterSeries {
        path: SeriesPath,
        data_type: DataType,
    },
    Insert {
        path: SeriesPath,
        points: Vec<TimeValuePair>,
    },
}

impl DataRequest {
    pub fn is_write(&self) -> bool {
        matches!(
            self,
            DataRequest::RegisterSeries { .. } | DataRequest::Insert { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DataReply {
    Points(Vec<TimeValuePair>),
    Point(Option<TimeValuePair>),
    DataType(Option<DataType>),
    /// Write committed at this log index
    Written(LogIndex),
    /// This replica cannot serve at the requested consistency
    NotLeader { leader: Option<NodeId> },
    /// The node hosts no replica of the group
    NotReplica,
}

/// Client side of the inner RPC
#[async_trait]
pub trait DataClient: Send + Sync {
    async fn call(
        &self,
        node: &NodeId,
        group: &GroupId,
        consistency: ConsistencyLevel,
        request: DataRequest,
    ) -> Result<DataReply>;
}

/// Calls data nodes in this process, `concurrency` at a time
pub struct LocalDataClient {
    from: NodeId,
    nodes: Arc<DashMap<NodeId, Arc<DataNode>>>,
    network: LocalNetwork,
    permits: Semaphore,
}

impl LocalDataClient {
    pub fn new(
        from: NodeId,
        nodes: Arc<DashMap<NodeId, Arc<DataNode>>>,
        network: LocalNetwork,
        concurrency: usize,
    ) -> Self {
        Self {
            from,
            nodes,
            network,
            permits: Semaphore::new(concurrency.max(1)),
        }
    }
}

#[async_trait]
impl DataClient for LocalDataClient {
    async fn call(
        &self,
        node: &NodeId,
        group: &GroupId,
        consistency: ConsistencyLevel,
        request: DataRequest,
    ) -> Result<DataReply> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| Error::Internal("inner RPC client closed".to_string()))?;

        if self.network.is_isolated(&self.from) || self.network.is_isolated(node) {
            return Err(Error::Rpc(format!("{} is unreachable from {}", node, self.from)));
        }
        let target = self
            .nodes
            .get(node)
            .map(|n| n.clone())
            .ok_or_else(|| Error::Rpc(format!("unknown node {}", node)))?;

        trace!(from = %self.from, to = %node, group = %group, "Inner RPC");
        target.handle(group, consistency, request).await
    }
}
