//! Server side of the inner RPC

use super::data_client::{DataReply, DataRequest};
use super::NodeId;
use crate::config::ConsistencyLevel;
use crate::raft::{GroupId, ReplicationGroup};
use crate::storage::{StorageEngine, WriteCommand};
use crate::{Error, Result};

use dashmap::DashMap;
use std::sync::Arc;
use tracing::debug;

/// A node's storage plus its replicas of the groups it belongs to
pub struct DataNode {
    id: NodeId,
    storage: Arc<dyn StorageEngine>,
    groups: DashMap<GroupId, ReplicationGroup>,
}

impl DataNode {
    pub fn new(id: NodeId, storage: Arc<dyn StorageEngine>) -> Self {
        Self {
            id,
            storage,
            groups: DashMap::new(),
        }
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    pub fn storage(&self) -> &Arc<dyn StorageEngine> {
        &self.storage
    }

    pub fn add_group(&self, group: ReplicationGroup) {
        self.groups.insert(group.id().clone(), group);
    }

    pub fn group(&self, id: &GroupId) -> Option<ReplicationGroup> {
        self.groups.get(id).map(|g| g.clone())
    }

    pub fn groups(&self) -> Vec<ReplicationGroup> {
        self.groups.iter().map(|g| g.value().clone()).collect()
    }

    /// Serve `request` for `group` at `consistency`
    ///
    /// Leadership problems are answered with `NotLeader` so the caller can
    /// redirect; storage failures are returned as errors.
    pub async fn handle(
        &self,
        group: &GroupId,
        consistency: ConsistencyLevel,
        request: DataRequest,
    ) -> Result<DataReply> {
        let Some(replica) = self.group(group) else {
            return Ok(DataReply::NotReplica);
        };

        if request.is_write() {
            return self.write(&replica, request).await;
        }

        match replica.read_index(consistency).await {
            Ok(_) => {}
            Err(Error::NotLeader { leader, .. }) => return Ok(DataReply::NotLeader { leader }),
            Err(Error::NoLeader { .. }) => return Ok(DataReply::NotLeader { leader: None }),
            Err(e) => return Err(e),
        }

        match request {
            DataRequest::Scan {
                path,
                filter,
                after,
                limit,
            } => Ok(DataReply::Points(
                self.storage.scan(&path, filter.as_ref(), after, limit).await?,
            )),
            DataRequest::Latest { path, at_or_before } => Ok(DataReply::Point(
                self.storage.latest(&path, at_or_before).await?,
            )),
            DataRequest::Earliest { path, at_or_after } => Ok(DataReply::Point(
                self.storage.earliest(&path, at_or_after).await?,
            )),
            DataRequest::DataType { path } => {
                Ok(DataReply::DataType(self.storage.data_type(&path).await?))
            }
            DataRequest::RegisterSeries { .. } | DataRequest::Insert { .. } => Err(
                Error::Internal("write request reached the read path".to_string()),
            ),
        }
    }

    async fn write(&self, replica: &ReplicationGroup, request: DataRequest) -> Result<DataReply> {
        let command = match request {
            DataRequest::RegisterSeries { path, data_type } => {
                WriteCommand::RegisterSeries { path, data_type }
            }
            DataRequest::Insert { path, points } => WriteCommand::Insert { path, points },
            other => {
                return Err(Error::Internal(format!(
                    "{:?} is not a write request",
                    other
                )))
            }
        };
        match replica.propose(command.encode()?).await {
            Ok(index) => {
                debug!(node = %self.id, group = %replica.id(), index, "Write committed");
                Ok(DataReply::Written(index))
            }
            Err(Error::NotLeader { leader, .. }) => Ok(DataReply::NotLeader { leader }),
            Err(Error::NoLeader { .. }) => Ok(DataReply::NotLeader { leader: None }),
            Err(e) => Err(e),
        }
    }
}
