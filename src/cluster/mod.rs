//! Cluster coordination
//!
//! Places storage groups on nodes with a consistent hash ring, runs one
//! replication group per partition, and executes query-processing (QP)
//! tasks against the replicas that serve a partition, redirecting when a
//! replica cannot answer at the requested consistency.

pub mod data_client;
pub mod data_node;
pub mod hash_ring;
pub mod local;
pub mod qp_task;
pub mod topology;

pub use data_client::{DataClient, DataReply, DataRequest, LocalDataClient};
pub use data_node::DataNode;
pub use hash_ring::ConsistentHashRing;
pub use local::LocalCluster;
pub use qp_task::{Attempt, QpTaskPool};
pub use topology::{ClusterTopology, NodeInfo, PartitionKey, PartitionRoute};

/// A node's `ip:port` identifier
pub type NodeId = String;
