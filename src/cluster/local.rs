//! Whole cluster running inside one process
//!
//! Every node gets its own storage engine and replicas of the groups the
//! topology places on it. Consensus traffic goes over a shared
//! [`LocalNetwork`] and inner RPC over [`LocalDataClient`], so isolating a
//! node cuts both.

use super::data_client::LocalDataClient;
use super::data_node::DataNode;
use super::topology::ClusterTopology;
use super::NodeId;
use crate::config::ClusterConfig;
use crate::raft::{GroupId, LocalNetwork, RaftConfig, ReplicationGroup};
use crate::storage::MemoryStorageEngine;
use crate::{Error, Result};

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

pub struct LocalCluster {
    config: ClusterConfig,
    topology: Arc<ClusterTopology>,
    network: LocalNetwork,
    nodes: Arc<DashMap<NodeId, Arc<DataNode>>>,
    storages: DashMap<NodeId, Arc<MemoryStorageEngine>>,
}

impl LocalCluster {
    /// Start every node named in `config`
    pub fn start(config: ClusterConfig) -> Result<Self> {
        config.validate()?;
        let topology = Arc::new(ClusterTopology::from_config(&config)?);
        let raft = RaftConfig::from_cluster(&config);
        let network = LocalNetwork::new();
        let nodes = Arc::new(DashMap::new());
        let storages = DashMap::new();

        for node in topology.node_ids() {
            let storage = Arc::new(MemoryStorageEngine::new());
            let data_node = Arc::new(DataNode::new(node.clone(), storage.clone()));
            for route in topology.groups_for_node(&node)? {
                let group = ReplicationGroup::spawn(
                    route.group,
                    node.clone(),
                    route.replicas,
                    raft.clone(),
                    network.transport_for(&node),
                    storage.clone(),
                );
                network.register(group.clone());
                data_node.add_group(group);
            }
            info!(
                node = %node,
                groups = data_node.groups().len(),
                "Started local node"
            );
            nodes.insert(node.clone(), data_node);
            storages.insert(node, storage);
        }

        Ok(Self {
            config,
            topology,
            network,
            nodes,
            storages,
        })
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn topology(&self) -> Arc<ClusterTopology> {
        self.topology.clone()
    }

    pub fn network(&self) -> &LocalNetwork {
        &self.network
    }

    pub fn node(&self, id: &str) -> Option<Arc<DataNode>> {
        self.nodes.get(id).map(|n| n.clone())
    }

    pub fn storage(&self, id: &str) -> Option<Arc<MemoryStorageEngine>> {
        self.storages.get(id).map(|s| s.clone())
    }

    /// Inner RPC client whose calls originate at `from`
    pub fn client(&self, from: &str) -> LocalDataClient {
        LocalDataClient::new(
            from.to_string(),
            self.nodes.clone(),
            self.network.clone(),
            self.config.effective_inner_rpc_client_threads(),
        )
    }

    /// Any replica of `group`, preferring ones that are not isolated
    pub fn replica(&self, group: &GroupId) -> Option<ReplicationGroup> {
        let mut fallback = None;
        for node in self.topology.node_ids() {
            if let Some(replica) = self.network.replica(&node, group) {
                if !self.network.is_isolated(&node) {
                    return Some(replica);
                }
                fallback.get_or_insert(replica);
            }
        }
        fallback
    }

    /// Wait until the metadata group and every data group has a leader
    pub async fn wait_for_leaders(&self, timeout: Duration) -> Result<()> {
        let mut groups = vec![GroupId::Metadata];
        groups.extend(self.topology.data_groups()?.into_iter().map(|r| r.group));
        for group in groups {
            let replica = self
                .replica(&group)
                .ok_or_else(|| Error::Internal(format!("no replica of {} is running", group)))?;
            replica.wait_for_leader(timeout).await?;
        }
        Ok(())
    }

    pub async fn shutdown(&self) {
        for node in self.nodes.iter() {
            for group in node.groups() {
                group.shutdown().await;
            }
        }
    }
}
