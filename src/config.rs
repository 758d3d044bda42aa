//! Cluster configuration
//!
//! Every tunable of the coordination layer lives in [`ClusterConfig`]. The
//! struct is plain data: an external loader may deserialize it, and
//! [`ClusterConfig::from_env`] overlays `CHRONORAFT_*` environment variables
//! on top of the defaults for development setups.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};

/// Default single-node address
pub const DEFAULT_NODE: &str = "127.0.0.1:8888";

const DEFAULT_RAFT_DIR: &str = "raft";
const DEFAULT_RAFT_LOG_DIR: &str = "log";
const DEFAULT_RAFT_SNAPSHOT_DIR: &str = "snapshot";
const DEFAULT_RAFT_METADATA_DIR: &str = "metadata";

/// Read consistency for metadata or data reads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConsistencyLevel {
    /// Served by (or confirmed against) the current leader and its quorum
    Strong,
    /// Served from any replica's local state, possibly stale
    Weak,
}

impl ConsistencyLevel {
    /// Legacy numeric code: 1 strong, 2 weak
    pub fn code(&self) -> u8 {
        match self {
            Self::Strong => 1,
            Self::Weak => 2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Strong => "strong",
            Self::Weak => "weak",
        }
    }
}

impl FromStr for ConsistencyLevel {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "strong" | "1" => Ok(Self::Strong),
            "weak" | "2" => Ok(Self::Weak),
            other => Err(Error::Config(format!(
                "unknown consistency level '{}'; expected strong (1) or weak (2)",
                other
            ))),
        }
    }
}

/// Configuration for a cluster node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Cluster nodes as `ip:port`
    pub nodes: Vec<String>,
    /// Replication factor
    pub replication: usize,
    /// This node's IP
    pub ip: String,
    /// This node's port
    pub port: u16,
    /// Directory for raft logs
    pub raft_log_path: PathBuf,
    /// Directory for raft snapshots
    pub raft_snapshot_path: PathBuf,
    /// Directory for raft metadata
    pub raft_metadata_path: PathBuf,
    /// A follower becomes a candidate after this long without leader contact
    pub election_timeout_ms: u64,
    /// A follower within this many entries of the leader is caught up
    pub max_catch_up_log_num: u64,
    /// Defer snapshots after a compaction trigger
    pub delay_snapshot: bool,
    /// Maximum snapshot deferral in hours
    pub delay_hours: u64,
    /// Applied-but-uncompacted entries that trigger a snapshot
    pub snapshot_trigger_log_num: u64,
    /// Maximum redirects for a QP task
    pub qp_task_redo_count: usize,
    /// Deadline for a QP task including redirects (milliseconds)
    pub qp_task_timeout_ms: u64,
    /// Virtual nodes per physical node on the hash ring
    pub num_of_virtual_nodes: usize,
    /// Inner RPC client concurrency; 0 means CPU cores * 10
    pub concurrent_inner_rpc_client_thread: usize,
    /// Maximum outstanding QP tasks before new ones are rejected
    pub max_queue_num_of_qp_task: usize,
    /// Consistency level for metadata reads
    pub read_metadata_consistency_level: ConsistencyLevel,
    /// Consistency level for data reads
    pub read_data_consistency_level: ConsistencyLevel,
    /// QP sub-task concurrency; 0 means CPU cores * 10
    pub concurrent_qp_sub_task_thread: usize,
    /// Points fetched from a remote replica per batch
    pub batch_read_size: usize,
    /// Batches cached per series on the coordinator
    pub max_cached_batch_data_list_size: usize,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        let raft_dir = PathBuf::from("data").join(DEFAULT_RAFT_DIR);
        Self {
            nodes: vec![DEFAULT_NODE.to_string()],
            replication: 1,
            ip: "127.0.0.1".to_string(),
            port: 8888,
            raft_log_path: raft_dir.join(DEFAULT_RAFT_LOG_DIR),
            raft_snapshot_path: raft_dir.join(DEFAULT_RAFT_SNAPSHOT_DIR),
            raft_metadata_path: raft_dir.join(DEFAULT_RAFT_METADATA_DIR),
            election_timeout_ms: 1000,
            max_catch_up_log_num: 100_000,
            delay_snapshot: false,
            delay_hours: 24,
            snapshot_trigger_log_num: 10_000,
            qp_task_redo_count: 10,
            qp_task_timeout_ms: 5000,
            num_of_virtual_nodes: 2,
            concurrent_inner_rpc_client_thread: 0,
            max_queue_num_of_qp_task: 500,
            read_metadata_consistency_level: ConsistencyLevel::Strong,
            read_data_consistency_level: ConsistencyLevel::Strong,
            concurrent_qp_sub_task_thread: 0,
            batch_read_size: 10_000,
            max_cached_batch_data_list_size: 2,
        }
    }
}

impl ClusterConfig {
    /// Build a configuration from defaults overlaid with environment variables
    ///
    /// Environment variables:
    /// - CHRONORAFT_NODES: comma-separated `ip:port` list
    /// - CHRONORAFT_REPLICATION, CHRONORAFT_IP, CHRONORAFT_PORT
    /// - CHRONORAFT_DATA_DIR: base directory for raft paths
    /// - CHRONORAFT_ELECTION_TIMEOUT_MS, CHRONORAFT_MAX_CATCH_UP_LOG_NUM
    /// - CHRONORAFT_DELAY_SNAPSHOT, CHRONORAFT_DELAY_HOURS
    /// - CHRONORAFT_QP_TASK_REDO_COUNT, CHRONORAFT_QP_TASK_TIMEOUT_MS
    /// - CHRONORAFT_VIRTUAL_NODES, CHRONORAFT_MAX_QUEUE_NUM_OF_QP_TASK
    /// - CHRONORAFT_READ_METADATA_CONSISTENCY, CHRONORAFT_READ_DATA_CONSISTENCY
    /// - CHRONORAFT_BATCH_READ_SIZE, CHRONORAFT_MAX_CACHED_BATCH_DATA_LIST_SIZE
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(nodes) = std::env::var("CHRONORAFT_NODES") {
            config.nodes = nodes
                .split(',')
                .map(|n| n.trim().to_string())
                .filter(|n| !n.is_empty())
                .collect();
        }
        if let Ok(dir) = std::env::var("CHRONORAFT_DATA_DIR") {
            config = config.with_data_dir(dir);
        }
        if let Some(ip) = env_value::<String>("CHRONORAFT_IP")? {
            config.ip = ip;
        }

        overlay(&mut config.replication, "CHRONORAFT_REPLICATION")?;
        overlay(&mut config.port, "CHRONORAFT_PORT")?;
        overlay(&mut config.election_timeout_ms, "CHRONORAFT_ELECTION_TIMEOUT_MS")?;
        overlay(&mut config.max_catch_up_log_num, "CHRONORAFT_MAX_CATCH_UP_LOG_NUM")?;
        overlay(&mut config.delay_snapshot, "CHRONORAFT_DELAY_SNAPSHOT")?;
        overlay(&mut config.delay_hours, "CHRONORAFT_DELAY_HOURS")?;
        overlay(
            &mut config.snapshot_trigger_log_num,
            "CHRONORAFT_SNAPSHOT_TRIGGER_LOG_NUM",
        )?;
        overlay(&mut config.qp_task_redo_count, "CHRONORAFT_QP_TASK_REDO_COUNT")?;
        overlay(&mut config.qp_task_timeout_ms, "CHRONORAFT_QP_TASK_TIMEOUT_MS")?;
        overlay(&mut config.num_of_virtual_nodes, "CHRONORAFT_VIRTUAL_NODES")?;
        overlay(
            &mut config.concurrent_inner_rpc_client_thread,
            "CHRONORAFT_CONCURRENT_INNER_RPC_CLIENT_THREAD",
        )?;
        overlay(
            &mut config.max_queue_num_of_qp_task,
            "CHRONORAFT_MAX_QUEUE_NUM_OF_QP_TASK",
        )?;
        overlay(
            &mut config.read_metadata_consistency_level,
            "CHRONORAFT_READ_METADATA_CONSISTENCY",
        )?;
        overlay(
            &mut config.read_data_consistency_level,
            "CHRONORAFT_READ_DATA_CONSISTENCY",
        )?;
        overlay(
            &mut config.concurrent_qp_sub_task_thread,
            "CHRONORAFT_CONCURRENT_QP_SUB_TASK_THREAD",
        )?;
        overlay(&mut config.batch_read_size, "CHRONORAFT_BATCH_READ_SIZE")?;
        overlay(
            &mut config.max_cached_batch_data_list_size,
            "CHRONORAFT_MAX_CACHED_BATCH_DATA_LIST_SIZE",
        )?;

        config.validate()?;
        info!(
            nodes = config.nodes.len(),
            replication = config.replication,
            local = %config.local_node(),
            "Loaded cluster configuration"
        );
        Ok(config)
    }

    /// Derive raft log/snapshot/metadata paths under `data_dir`
    pub fn with_data_dir(mut self, data_dir: impl AsRef<Path>) -> Self {
        let raft_dir = data_dir.as_ref().join(DEFAULT_RAFT_DIR);
        self.raft_log_path = raft_dir.join(DEFAULT_RAFT_LOG_DIR);
        self.raft_snapshot_path = raft_dir.join(DEFAULT_RAFT_SNAPSHOT_DIR);
        self.raft_metadata_path = raft_dir.join(DEFAULT_RAFT_METADATA_DIR);
        self
    }

    /// Create the raft directories; failures are logged, not returned
    pub fn create_all_paths(&self) {
        for path in self.raft_paths() {
            if let Err(e) = std::fs::create_dir_all(path) {
                warn!("Failed to create raft path {}: {}", path.display(), e);
            }
        }
    }

    /// Remove the raft directories
    pub fn delete_all_paths(&self) -> Result<()> {
        for path in self.raft_paths() {
            if path.exists() {
                std::fs::remove_dir_all(path)?;
            }
        }
        Ok(())
    }

    fn raft_paths(&self) -> [&Path; 3] {
        [
            self.raft_snapshot_path.as_path(),
            self.raft_log_path.as_path(),
            self.raft_metadata_path.as_path(),
        ]
    }

    /// Check the invariants the ring and consensus layers rely on
    pub fn validate(&self) -> Result<()> {
        let distinct: HashSet<&str> = self.nodes.iter().map(|n| n.trim()).collect();
        if distinct.is_empty() {
            return Err(Error::Config("node list is empty".to_string()));
        }
        if self.replication == 0 {
            return Err(Error::Config("replication must be at least 1".to_string()));
        }
        if self.replication > distinct.len() {
            return Err(Error::Config(format!(
                "replication {} exceeds {} distinct nodes",
                self.replication,
                distinct.len()
            )));
        }
        if self.num_of_virtual_nodes == 0 {
            return Err(Error::Config(
                "num_of_virtual_nodes must be at least 1".to_string(),
            ));
        }
        if self.election_timeout_ms == 0 || self.qp_task_timeout_ms == 0 {
            return Err(Error::Config("timeouts must be positive".to_string()));
        }
        if self.batch_read_size == 0 || self.max_cached_batch_data_list_size == 0 {
            return Err(Error::Config(
                "batch_read_size and max_cached_batch_data_list_size must be positive"
                    .to_string(),
            ));
        }
        if self.max_queue_num_of_qp_task == 0 {
            return Err(Error::Config(
                "max_queue_num_of_qp_task must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// This node's `ip:port` identifier
    pub fn local_node(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }

    pub fn election_timeout(&self) -> Duration {
        Duration::from_millis(self.election_timeout_ms)
    }

    pub fn qp_task_timeout(&self) -> Duration {
        Duration::from_millis(self.qp_task_timeout_ms)
    }

    /// Snapshot deferral window, `None` when delayed snapshots are off
    pub fn snapshot_delay(&self) -> Option<Duration> {
        self.delay_snapshot
            .then(|| Duration::from_secs(self.delay_hours * 3600))
    }

    pub fn effective_qp_sub_task_threads(&self) -> usize {
        or_cores_times_ten(self.concurrent_qp_sub_task_thread)
    }

    pub fn effective_inner_rpc_client_threads(&self) -> usize {
        or_cores_times_ten(self.concurrent_inner_rpc_client_thread)
    }
}

fn or_cores_times_ten(value: usize) -> usize {
    if value > 0 {
        return value;
    }
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        * 10
}

fn env_value<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let Ok(raw) = std::env::var(name) else {
        return Ok(None);
    };
    raw.trim()
        .parse::<T>()
        .map(Some)
        .map_err(|e| Error::Config(format!("{} has invalid value '{}': {}", name, raw, e)))
}

fn overlay<T>(field: &mut T, name: &str) -> Result<()>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    if let Some(value) = env_value(name)? {
        *field = value;
    }
    Ok(())
}
