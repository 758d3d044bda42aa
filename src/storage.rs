//! Storage engine seam and the in-memory engine
//!
//! The coordination layer only needs a per-series scan and a data type
//! lookup. [`MemoryStorageEngine`] is also the replicated state machine:
//! committed [`WriteCommand`]s are applied to it on every replica.

use crate::query::{CompareOp, DataType, Filter, SeriesPath, TimeValuePair, Value};
use crate::raft::{Entry, GroupId, LogIndex, StateMachine};
use crate::{Error, Result};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

#[async_trait]
pub trait StorageEngine: Send + Sync {
    /// Up to `limit` points of `path` after `after`, ascending, that satisfy `filter`
    async fn scan(
        &self,
        path: &SeriesPath,
        filter: Option<&Filter>,
        after: Option<i64>,
        limit: usize,
    ) -> Result<Vec<TimeValuePair>>;

    /// Registered data type of `path`
    async fn data_type(&self, path: &SeriesPath) -> Result<Option<DataType>>;

    /// Most recent point at or before `timestamp`
    async fn latest(&self, path: &SeriesPath, timestamp: i64) -> Result<Option<TimeValuePair>> {
        const PAGE: usize = 1024;
        let bound = Filter::time(CompareOp::LtEq, timestamp);
        let mut latest = None;
        let mut after = None;
        loop {
            let page = self.scan(path, Some(&bound), after, PAGE).await?;
            let full = page.len() == PAGE;
            if let Some(last) = page.into_iter().last() {
                after = Some(last.timestamp);
                latest = Some(last);
            }
            if !full {
                return Ok(latest);
            }
        }
    }

    /// Oldest point at or after `timestamp`
    async fn earliest(&self, path: &SeriesPath, timestamp: i64) -> Result<Option<TimeValuePair>> {
        let bound = Filter::time(CompareOp::GtEq, timestamp);
        Ok(self
            .scan(path, Some(&bound), None, 1)
            .await?
            .into_iter()
            .next())
    }
}

/// Commands replicated through consensus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WriteCommand {
    RegisterSeries {
        path: SeriesPath,
        data_type: DataType,
    },
    Insert {
        path: SeriesPath,
        points: Vec<TimeValuePair>,
    },
}

impl WriteCommand {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Serialized state of one group
#[derive(Debug, Default, Serialize, Deserialize)]
struct GroupImage {
    schema: Vec<(SeriesPath, DataType)>,
    series: Vec<(SeriesPath, Vec<TimeValuePair>)>,
}

#[derive(Debug, Default)]
struct StoreInner {
    schema: HashMap<SeriesPath, DataType>,
    series: HashMap<SeriesPath, BTreeMap<i64, Value>>,
    /// Series written through each data group
    group_series: HashMap<GroupId, BTreeSet<SeriesPath>>,
}

#[derive(Debug, Default)]
pub struct MemoryStorageEngine {
    inner: RwLock<StoreInner>,
    scans: AtomicU64,
}

impl MemoryStorageEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scan calls served so far
    pub fn scan_count(&self) -> u64 {
        self.scans.load(Ordering::Relaxed)
    }

    pub fn point_count(&self, path: &SeriesPath) -> usize {
        self.inner.read().series.get(path).map_or(0, BTreeMap::len)
    }
}

#[async_trait]
impl StorageEngine for MemoryStorageEngine {
    async fn scan(
        &self,
        path: &SeriesPath,
        filter: Option<&Filter>,
        after: Option<i64>,
        limit: usize,
    ) -> Result<Vec<TimeValuePair>> {
        self.scans.fetch_add(1, Ordering::Relaxed);
        let inner = self.inner.read();
        let Some(points) = inner.series.get(path) else {
            return Ok(Vec::new());
        };
        let lower = after.map_or(Bound::Unbounded, Bound::Excluded);
        Ok(points
            .range((lower, Bound::Unbounded))
            .filter(|(t, v)| filter.map_or(true, |f| f.satisfy(**t, v)))
            .take(limit)
            .map(|(t, v)| TimeValuePair::new(*t, v.clone()))
            .collect())
    }

    async fn data_type(&self, path: &SeriesPath) -> Result<Option<DataType>> {
        Ok(self.inner.read().schema.get(path).copied())
    }

    async fn latest(&self, path: &SeriesPath, timestamp: i64) -> Result<Option<TimeValuePair>> {
        let inner = self.inner.read();
        Ok(inner.series.get(path).and_then(|points| {
            points
                .range(..=timestamp)
                .next_back()
                .map(|(t, v)| TimeValuePair::new(*t, v.clone()))
        }))
    }

    async fn earliest(&self, path: &SeriesPath, timestamp: i64) -> Result<Option<TimeValuePair>> {
        let inner = self.inner.read();
        Ok(inner.series.get(path).and_then(|points| {
            points
                .range(timestamp..)
                .next()
                .map(|(t, v)| TimeValuePair::new(*t, v.clone()))
        }))
    }
}

impl StateMachine for MemoryStorageEngine {
    fn apply(&self, group: &GroupId, entry: &Entry) -> Result<()> {
        let command = WriteCommand::decode(&entry.command)?;
        let mut inner = self.inner.write();
        match command {
            WriteCommand::RegisterSeries { path, data_type } => {
                match inner.schema.get(&path) {
                    Some(existing) if *existing != data_type => {
                        return Err(Error::StorageEngine(format!(
                            "series {} already registered as {}",
                            path, existing
                        )));
                    }
                    Some(_) => {}
                    None => {
                        debug!(
                            group = %group,
                            path = %path,
                            data_type = %data_type,
                            "Registered series"
                        );
                        inner.schema.insert(path, data_type);
                    }
                }
            }
            WriteCommand::Insert { path, points } => {
                inner
                    .group_series
                    .entry(group.clone())
                    .or_default()
                    .insert(path.clone());
                let series = inner.series.entry(path).or_default();
                for point in points {
                    series.insert(point.timestamp, point.value);
                }
            }
        }
        Ok(())
    }

    fn snapshot(&self, group: &GroupId, index: LogIndex) -> Result<Vec<u8>> {
        let inner = self.inner.read();
        let image = match group {
            GroupId::Metadata => GroupImage {
                schema: inner
                    .schema
                    .iter()
                    .map(|(path, data_type)| (path.clone(), *data_type))
                    .collect(),
                series: Vec::new(),
            },
            GroupId::Data(_) => GroupImage {
                schema: Vec::new(),
                series: inner
                    .group_series
                    .get(group)
                    .into_iter()
                    .flatten()
                    .map(|path| {
                        let points = inner
                            .series
                            .get(path)
                            .into_iter()
                            .flatten()
                            .map(|(t, v)| TimeValuePair::new(*t, v.clone()))
                            .collect();
                        (path.clone(), points)
                    })
                    .collect(),
            },
        };
        debug!(group = %group, index, series = image.series.len(), "Captured group image");
        Ok(serde_json::to_vec(&image)?)
    }

    fn restore(&self, group: &GroupId, index: LogIndex, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            warn!(group = %group, index, "Restoring from an empty snapshot");
            return Ok(());
        }
        let image: GroupImage = serde_json::from_slice(data)?;
        let mut inner = self.inner.write();
        match group {
            GroupId::Metadata => {
                inner.schema = image.schema.into_iter().collect();
            }
            GroupId::Data(_) => {
                let stale = inner.group_series.remove(group).unwrap_or_default();
                for path in stale {
                    inner.series.remove(&path);
                }
                let mut owned = BTreeSet::new();
                for (path, points) in image.series {
                    owned.insert(path.clone());
                    inner.series.insert(
                        path,
                        points.into_iter().map(|p| (p.timestamp, p.value)).collect(),
                    );
                }
                inner.group_series.insert(group.clone(), owned);
            }
        }
        Ok(())
    }
}
