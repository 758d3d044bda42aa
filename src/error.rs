//! Error types for chronoraft

use std::fmt;

/// Result type alias for chronoraft operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for chronoraft
#[derive(Debug)]
pub enum Error {
    /// Filter expression cannot be rewritten against the selected paths
    Optimization(String),
    /// Underlying scan/read failure (I/O, missing series or partition)
    StorageEngine(String),
    /// Replication group has no known leader
    NoLeader { group: String },
    /// This replica is not the leader; `leader` is the best known hint
    NotLeader { group: String, leader: Option<String> },
    /// Redirect budget spent without reaching a serving node
    RedirectExhausted { attempts: usize },
    /// QP task deadline elapsed
    Timeout { after_ms: u64 },
    /// Admission queue is full
    QueueRejected { capacity: usize },
    /// Ring has fewer distinct physical nodes than the replication factor
    InsufficientNodes { required: usize, available: usize },
    /// Too few caught-up replicas to serve a strongly consistent read
    ReadQuorumUnavailable {
        group: String,
        caught_up: usize,
        required: usize,
    },
    /// Fill strategy cannot be applied to the series type or query shape
    UnsupportedFill(String),
    /// Query construction or execution error
    Query(String),
    /// Configuration errors
    Config(String),
    /// Inner RPC failure (unreachable peer, closed channel)
    Rpc(String),
    /// IO errors
    Io(std::io::Error),
    /// Arrow conversion errors
    Arrow(arrow_schema::ArrowError),
    /// Serialization errors
    Serialization(String),
    /// Internal error
    Internal(String),
}

impl Error {
    /// Conditions the QP task runner resolves by trying another replica.
    pub fn is_redirectable(&self) -> bool {
        matches!(
            self,
            Error::NoLeader { .. }
                | Error::NotLeader { .. }
                | Error::ReadQuorumUnavailable { .. }
                | Error::Rpc(_)
        )
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            Error::Arrow(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Optimization(msg) => write!(f, "Filter optimization error: {}", msg),
            Error::StorageEngine(msg) => write!(f, "Storage engine error: {}", msg),
            Error::NoLeader { group } => write!(f, "No leader for group {}", group),
            Error::NotLeader { group, leader } => match leader {
                Some(leader) => write!(f, "Not the leader of group {}; try {}", group, leader),
                None => write!(f, "Not the leader of group {}", group),
            },
            Error::RedirectExhausted { attempts } => {
                write!(f, "Redirect exhausted after {} attempts", attempts)
            }
            Error::Timeout { after_ms } => write!(f, "Operation timed out after {}ms", after_ms),
            Error::QueueRejected { capacity } => {
                write!(f, "QP task queue is full ({} tasks)", capacity)
            }
            Error::InsufficientNodes {
                required,
                available,
            } => write!(
                f,
                "Insufficient nodes: replication requires {}, ring has {}",
                required, available
            ),
            Error::ReadQuorumUnavailable {
                group,
                caught_up,
                required,
            } => write!(
                f,
                "Read quorum unavailable for group {}: {} caught-up replicas, {} required",
                group, caught_up, required
            ),
            Error::UnsupportedFill(msg) => write!(f, "Unsupported fill: {}", msg),
            Error::Query(msg) => write!(f, "Query error: {}", msg),
            Error::Config(msg) => write!(f, "Configuration error: {}", msg),
            Error::Rpc(msg) => write!(f, "RPC error: {}", msg),
            Error::Io(e) => write!(f, "IO error: {}", e),
            Error::Arrow(e) => write!(f, "Arrow error: {}", e),
            Error::Serialization(msg) => write!(f, "Serialization error: {}", msg),
            Error::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<arrow_schema::ArrowError> for Error {
    fn from(e: arrow_schema::ArrowError) -> Self {
        Error::Arrow(e)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
