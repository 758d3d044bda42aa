//! Cluster membership and partition routing

use super::hash_ring::ConsistentHashRing;
use super::NodeId;
use crate::config::ClusterConfig;
use crate::raft::GroupId;
use crate::{Error, Result};

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use tracing::info;

/// A cluster member addressed as `ip:port`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeInfo {
    pub ip: String,
    pub port: u16,
}

impl NodeInfo {
    pub fn id(&self) -> NodeId {
        self.to_string()
    }
}

impl FromStr for NodeInfo {
    type Err = Error;

    fn from_str(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        let (ip, port) = raw
            .rsplit_once(':')
            .ok_or_else(|| Error::Config(format!("node '{}' is not ip:port", raw)))?;
        if ip.is_empty() {
            return Err(Error::Config(format!("node '{}' has an empty ip", raw)));
        }
        let port = port
            .parse()
            .map_err(|e| Error::Config(format!("node '{}' has invalid port: {}", raw, e)))?;
        Ok(Self {
            ip: ip.to_string(),
            port,
        })
    }
}

impl fmt::Display for NodeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// Hash input identifying a storage group
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartitionKey(String);

impl PartitionKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Storage-group prefix of a series path: `root.sg1.d1.s1` -> `root.sg1`
    pub fn for_path(path: &str) -> Self {
        let mut parts = path.splitn(3, '.');
        match (parts.next(), parts.next()) {
            (Some(root), Some(group)) => Self(format!("{}.{}", root, group)),
            _ => Self(path.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Replication group serving a partition and its ordered replicas
///
/// The first replica is the preferred leader candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionRoute {
    pub group: GroupId,
    pub replicas: Vec<NodeId>,
}

/// Immutable view of the cluster used to place partitions
#[derive(Debug, Clone)]
pub struct ClusterTopology {
    nodes: Vec<NodeInfo>,
    replication: usize,
    ring: ConsistentHashRing,
}

impl ClusterTopology {
    pub fn from_config(config: &ClusterConfig) -> Result<Self> {
        Self::new(
            &config.nodes,
            config.replication,
            config.num_of_virtual_nodes,
        )
    }

    pub fn new<S: AsRef<str>>(
        nodes: &[S],
        replication: usize,
        virtual_nodes: usize,
    ) -> Result<Self> {
        if virtual_nodes == 0 {
            return Err(Error::Config(
                "virtual node count must be at least 1".to_string(),
            ));
        }
        let mut seen = HashSet::new();
        let mut parsed = Vec::with_capacity(nodes.len());
        for raw in nodes {
            let node: NodeInfo = raw.as_ref().parse()?;
            if !seen.insert(node.clone()) {
                return Err(Error::Config(format!("duplicate node {}", node)));
            }
            parsed.push(node);
        }
        if replication == 0 || replication > parsed.len() {
            return Err(Error::InsufficientNodes {
                required: replication,
                available: parsed.len(),
            });
        }

        let ring = ConsistentHashRing::new(parsed.iter().map(NodeInfo::id), virtual_nodes);
        Ok(Self {
            nodes: parsed,
            replication,
            ring,
        })
    }

    /// Rerun placement over a new node list with the same parameters
    pub fn rebuild<S: AsRef<str>>(&self, nodes: &[S]) -> Result<Self> {
        let rebuilt = Self::new(nodes, self.replication, self.ring.virtual_nodes())?;
        info!(
            before = self.nodes.len(),
            after = rebuilt.nodes.len(),
            "Rebuilt cluster topology"
        );
        Ok(rebuilt)
    }

    pub fn nodes(&self) -> &[NodeInfo] {
        &self.nodes
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        self.nodes.iter().map(NodeInfo::id).collect()
    }

    pub fn replication(&self) -> usize {
        self.replication
    }

    pub fn ring(&self) -> &ConsistentHashRing {
        &self.ring
    }

    pub fn route(&self, key: &PartitionKey) -> Result<PartitionRoute> {
        let replicas = self.ring.assign(key.as_str(), self.replication)?;
        Ok(PartitionRoute {
            group: GroupId::for_replicas(&replicas),
            replicas,
        })
    }

    /// Route for the partition holding series `path`
    pub fn route_path(&self, path: &str) -> Result<PartitionRoute> {
        self.route(&PartitionKey::for_path(path))
    }

    /// The metadata group is replicated on every node
    pub fn metadata_route(&self) -> PartitionRoute {
        PartitionRoute {
            group: GroupId::Metadata,
            replicas: self.node_ids(),
        }
    }

    /// Every data group the ring can route to
    pub fn data_groups(&self) -> Result<Vec<PartitionRoute>> {
        Ok(self
            .ring
            .replica_sets(self.replication)?
            .into_iter()
            .map(|replicas| PartitionRoute {
                group: GroupId::for_replicas(&replicas),
                replicas,
            })
            .collect())
    }

    /// Groups, metadata included, that `node` must host a replica of
    pub fn groups_for_node(&self, node: &str) -> Result<Vec<PartitionRoute>> {
        let mut routes = vec![self.metadata_route()];
        routes.extend(
            self.data_groups()?
                .into_iter()
                .filter(|route| route.replicas.iter().any(|r| r == node)),
        );
        Ok(routes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn three_nodes() -> Vec<String> {
        vec![
            "10.0.0.1:8888".to_string(),
            "10.0.0.2:8888".to_string(),
            "10.0.0.3:8888".to_string(),
        ]
    }

    #[test]
    fn test_parse_node_info() {
        let node: NodeInfo = "192.168.1.5:6667".parse().unwrap();
        assert_eq!(node.ip, "192.168.1.5");
        assert_eq!(node.port, 6667);
        assert_eq!(node.id(), "192.168.1.5:6667");
        assert!("nope".parse::<NodeInfo>().is_err());
        assert!("host:99999".parse::<NodeInfo>().is_err());
    }

    #[test]
    fn test_partition_key_is_storage_group_prefix() {
        assert_eq!(PartitionKey::for_path("root.sg1.d1.s1").as_str(), "root.sg1");
        assert_eq!(PartitionKey::for_path("root.sg1").as_str(), "root.sg1");
        assert_eq!(PartitionKey::for_path("root").as_str(), "root");
    }

    #[test]
    fn test_series_in_same_storage_group_share_route() {
        let topology = ClusterTopology::new(&three_nodes(), 2, 2).unwrap();
        let a = topology.route_path("root.sg1.d1.s1").unwrap();
        let b = topology.route_path("root.sg1.d2.s7").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.replicas.len(), 2);
        assert_eq!(a.group, GroupId::for_replicas(&a.replicas));
    }

    #[test]
    fn test_duplicate_nodes_rejected() {
        let nodes = vec!["10.0.0.1:8888", "10.0.0.1:8888"];
        assert!(matches!(
            ClusterTopology::new(&nodes, 1, 2),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_replication_above_node_count() {
        assert!(matches!(
            ClusterTopology::new(&three_nodes(), 4, 2),
            Err(Error::InsufficientNodes { .. })
        ));
    }

    #[test]
    fn test_groups_for_node_include_metadata() {
        let topology = ClusterTopology::new(&three_nodes(), 2, 2).unwrap();
        let node = "10.0.0.1:8888";
        let groups = topology.groups_for_node(node).unwrap();
        assert_eq!(groups[0].group, GroupId::Metadata);
        assert_eq!(groups[0].replicas.len(), 3);
        assert!(groups[1..]
            .iter()
            .all(|route| route.replicas.iter().any(|r| r == node)));

        let route = topology.route_path("root.sg42.d1.s1").unwrap();
        let hosts: Vec<_> = topology
            .node_ids()
            .into_iter()
            .filter(|n| {
                topology
                    .groups_for_node(n)
                    .unwrap()
                    .iter()
                    .any(|g| g.group == route.group)
            })
            .collect();
        assert_eq!(hosts.len(), 2);
    }

    #[test]
    fn test_rebuild_is_deterministic() {
        let topology = ClusterTopology::new(&three_nodes(), 1, 2).unwrap();
        let mut grown = three_nodes();
        grown.push("10.0.0.4:8888".to_string());
        let a = topology.rebuild(&grown).unwrap();
        let b = topology.rebuild(&grown).unwrap();
        assert_eq!(a.node_ids().len(), 4);
        for i in 0..50 {
            let key = PartitionKey::new(format!("root.sg{}", i));
            assert_eq!(a.route(&key).unwrap(), b.route(&key).unwrap());
        }
    }
}
