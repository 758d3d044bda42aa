//! Per-partition consensus
//!
//! Each data partition (and the reserved metadata partition) is replicated by
//! its own [`ReplicationGroup`]: a Raft instance that owns leader election,
//! log replication, snapshotting and catch-up tracking for that partition.
//!
//! All consensus state of a group is owned by a single task; handlers talk to
//! it through a channel, so the commit index and match-index table have
//! exactly one writer.

mod group;
mod log;
mod network;
mod snapshot;

pub use group::{ReplicaState, ReplicationGroup};
pub use log::{is_caught_up, majority, quorum_commit_index, RaftLog};
pub use network::LocalNetwork;
pub use snapshot::{SnapshotPolicy, SnapshotScheduler};

use crate::cluster::NodeId;
use crate::config::ClusterConfig;
use crate::Result;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use xxhash_rust::xxh3::xxh3_64;

/// Raft term
pub type Term = u64;
/// Position in a group's log (1-based, 0 means "nothing")
pub type LogIndex = u64;

/// Identifier of a replication group
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum GroupId {
    /// The reserved metadata group spanning every node
    Metadata,
    /// A data partition group, keyed by its ordered replica set
    Data(u64),
}

impl GroupId {
    /// Data group id for an ordered replica set
    ///
    /// Every node derives the same id for the same replica list, so no
    /// coordination is needed to agree on group names.
    pub fn for_replicas(replicas: &[NodeId]) -> Self {
        GroupId::Data(xxh3_64(replicas.join(",").as_bytes()))
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GroupId::Metadata => write!(f, "metadata"),
            GroupId::Data(id) => write!(f, "data-{:016x}", id),
        }
    }
}

/// Role of a replica within its group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

/// Snapshot of a group's consensus state, published after every step
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupStatus {
    pub term: Term,
    pub role: Role,
    pub leader: Option<NodeId>,
    pub commit_index: LogIndex,
    pub last_log_index: LogIndex,
    pub snapshot_index: LogIndex,
}

/// A replicated log entry; an empty command is a leader no-op
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub term: Term,
    pub index: LogIndex,
    pub command: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteRequest {
    pub term: Term,
    pub candidate: NodeId,
    pub last_log_index: LogIndex,
    pub last_log_term: Term,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteResponse {
    pub term: Term,
    pub granted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendRequest {
    pub term: Term,
    pub leader: NodeId,
    pub prev_log_index: LogIndex,
    pub prev_log_term: Term,
    pub entries: Vec<Entry>,
    pub leader_commit: LogIndex,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendResponse {
    pub term: Term,
    pub success: bool,
    /// Highest index known to match the leader (valid when `success`)
    pub match_index: LogIndex,
    /// Follower's last index, used by the leader to back off `next_index`
    pub last_log_index: LogIndex,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotRequest {
    pub term: Term,
    pub leader: NodeId,
    pub last_included_index: LogIndex,
    pub last_included_term: Term,
    /// State machine image produced by [`StateMachine::snapshot`]
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotResponse {
    pub term: Term,
}

/// Consensus RPCs between replicas of the same group
#[async_trait]
pub trait Transport: Send + Sync {
    async fn request_vote(
        &self,
        group: &GroupId,
        to: &NodeId,
        request: VoteRequest,
    ) -> Result<VoteResponse>;

    async fn append_entries(
        &self,
        group: &GroupId,
        to: &NodeId,
        request: AppendRequest,
    ) -> Result<AppendResponse>;

    async fn install_snapshot(
        &self,
        group: &GroupId,
        to: &NodeId,
        request: SnapshotRequest,
    ) -> Result<SnapshotResponse>;
}

/// Receiver of committed entries
pub trait StateMachine: Send + Sync {
    /// Apply a committed, non-empty entry
    fn apply(&self, group: &GroupId, entry: &Entry) -> Result<()>;

    /// Capture state up to `index` so the log prefix can be dropped
    fn snapshot(&self, _group: &GroupId, _index: LogIndex) -> Result<Vec<u8>> {
        Ok(Vec::new())
    }

    /// Replace the group's state with a leader snapshot ending at `index`
    fn restore(&self, _group: &GroupId, _index: LogIndex, _data: &[u8]) -> Result<()> {
        Ok(())
    }
}

/// Timer and threshold settings for a replication group
#[derive(Debug, Clone)]
pub struct RaftConfig {
    /// Base election timeout; jitter in `[0, timeout)` is added per election
    pub election_timeout: Duration,
    /// Leader heartbeat / replication period
    pub heartbeat_interval: Duration,
    /// Maximum lag for a follower to count toward strong read quorums
    pub max_catch_up_log_num: u64,
    /// Entries per append request
    pub max_entries_per_append: usize,
    /// Snapshot timing
    pub snapshot: SnapshotPolicy,
}

impl RaftConfig {
    pub fn from_cluster(config: &ClusterConfig) -> Self {
        let election_timeout = config.election_timeout();
        Self {
            election_timeout,
            heartbeat_interval: (election_timeout / 5).max(Duration::from_millis(10)),
            max_catch_up_log_num: config.max_catch_up_log_num,
            max_entries_per_append: 512,
            snapshot: SnapshotPolicy {
                trigger_log_num: config.snapshot_trigger_log_num,
                delay: config.snapshot_delay(),
                force_log_num: config.max_catch_up_log_num,
            },
        }
    }
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self::from_cluster(&ClusterConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_id_is_deterministic_per_replica_set() {
        let a = vec!["n1:1".to_string(), "n2:1".to_string()];
        let b = vec!["n2:1".to_string(), "n1:1".to_string()];
        assert_eq!(GroupId::for_replicas(&a), GroupId::for_replicas(&a));
        assert_ne!(GroupId::for_replicas(&a), GroupId::for_replicas(&b));
        assert!(GroupId::for_replicas(&a).to_string().starts_with("data-"));
        assert_eq!(GroupId::Metadata.to_string(), "metadata");
    }

    #[test]
    fn test_heartbeat_is_fraction_of_election_timeout() {
        let config = RaftConfig::from_cluster(&ClusterConfig {
            election_timeout_ms: 20,
            ..Default::default()
        });
        assert_eq!(config.heartbeat_interval, Duration::from_millis(10));

        let config = RaftConfig::default();
        assert_eq!(config.heartbeat_interval, Duration::from_millis(200));
        assert_eq!(config.snapshot.force_log_num, 100_000);
    }
}
