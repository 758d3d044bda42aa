//! In-process transport connecting replication groups
//!
//! Routes consensus RPCs to the [`ReplicationGroup`] registered for the
//! target node and group. Nodes can be isolated to simulate partitions.

use super::{
    AppendRequest, AppendResponse, GroupId, ReplicationGroup, SnapshotRequest, SnapshotResponse,
    Transport, VoteRequest, VoteResponse,
};
use crate::cluster::NodeId;
use crate::{Error, Result};

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use std::sync::Arc;
use tracing::info;

#[derive(Default)]
struct NetworkInner {
    groups: DashMap<(NodeId, GroupId), ReplicationGroup>,
    isolated: DashSet<NodeId>,
}

/// Shared registry of group replicas reachable in this process
#[derive(Clone, Default)]
pub struct LocalNetwork {
    inner: Arc<NetworkInner>,
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `group` reachable as its node's replica of its group id
    pub fn register(&self, group: ReplicationGroup) {
        let key = (group.node().clone(), group.id().clone());
        self.inner.groups.insert(key, group);
    }

    pub fn replica(&self, node: &str, group: &GroupId) -> Option<ReplicationGroup> {
        self.inner
            .groups
            .get(&(node.to_string(), group.clone()))
            .map(|g| g.clone())
    }

    /// Drop all traffic to and from `node`
    pub fn isolate(&self, node: &str) {
        info!(node, "Isolating node");
        self.inner.isolated.insert(node.to_string());
    }

    pub fn heal(&self, node: &str) {
        info!(node, "Healing node");
        self.inner.isolated.remove(node);
    }

    pub fn is_isolated(&self, node: &str) -> bool {
        self.inner.isolated.contains(node)
    }

    /// Transport used by replicas hosted on `node`
    pub fn transport_for(&self, node: &str) -> Arc<dyn Transport> {
        Arc::new(LocalTransport {
            from: node.to_string(),
            network: self.clone(),
        })
    }

    fn route(&self, from: &str, to: &NodeId, group: &GroupId) -> Result<ReplicationGroup> {
        if self.is_isolated(from) || self.is_isolated(to) {
            return Err(Error::Rpc(format!("{} is unreachable from {}", to, from)));
        }
        self.replica(to, group)
            .ok_or_else(|| Error::Rpc(format!("{} hosts no replica of {}", to, group)))
    }
}

struct LocalTransport {
    from: NodeId,
    network: LocalNetwork,
}

#[async_trait]
impl Transport for LocalTransport {
    async fn request_vote(
        &self,
        group: &GroupId,
        to: &NodeId,
        request: VoteRequest,
    ) -> Result<VoteResponse> {
        self.network
            .route(&self.from, to, group)?
            .handle_vote(request)
            .await
    }

    async fn append_entries(
        &self,
        group: &GroupId,
        to: &NodeId,
        request: AppendRequest,
    ) -> Result<AppendResponse> {
        self.network
            .route(&self.from, to, group)?
            .handle_append(request)
            .await
    }

    async fn install_snapshot(
        &self,
        group: &GroupId,
        to: &NodeId,
        request: SnapshotRequest,
    ) -> Result<SnapshotResponse> {
        self.network
            .route(&self.from, to, group)?
            .handle_install_snapshot(request)
            .await
    }
}
