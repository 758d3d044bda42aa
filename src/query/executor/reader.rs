//! Remote series readers
//!
//! [`SeriesFetcher`] turns one read into a redirectable QP task against the
//! replicas of the series' partition. [`SeriesReader`] streams a series in
//! `batch_read_size` batches through a prefetch task whose channel holds at
//! most `max_cached_batches` batches; once it is full the prefetch waits for
//! the consumer.

use crate::cluster::{
    Attempt, ClusterTopology, DataClient, DataReply, DataRequest, PartitionRoute, QpTaskPool,
};
use crate::config::ConsistencyLevel;
use crate::query::expression::{Expression, Filter, TimeValuePair, Value};
use crate::query::plan::{DataType, SeriesPath};
use crate::query::QueryContext;
use crate::raft::LogIndex;
use crate::{Error, Result};

use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Issues inner RPCs for series reads and writes
pub struct SeriesFetcher {
    topology: Arc<ClusterTopology>,
    client: Arc<dyn DataClient>,
    tasks: QpTaskPool,
}

impl SeriesFetcher {
    pub fn new(
        topology: Arc<ClusterTopology>,
        client: Arc<dyn DataClient>,
        tasks: QpTaskPool,
    ) -> Self {
        Self {
            topology,
            client,
            tasks,
        }
    }

    pub fn topology(&self) -> &ClusterTopology {
        &self.topology
    }

    pub fn tasks(&self) -> &QpTaskPool {
        &self.tasks
    }

    /// Send `request` to the group owning `path`
    pub async fn request(
        &self,
        path: &SeriesPath,
        consistency: ConsistencyLevel,
        request: DataRequest,
    ) -> Result<DataReply> {
        let route = self.topology.route(&path.partition_key())?;
        self.call(route, consistency, request).await
    }

    /// Send `request` to a group, trying its replicas in ring order
    pub async fn call(
        &self,
        route: PartitionRoute,
        consistency: ConsistencyLevel,
        request: DataRequest,
    ) -> Result<DataReply> {
        let PartitionRoute { group, replicas } = route;
        let client = self.client.clone();
        self.tasks
            .submit_redirected(replicas, move |node| {
                let client = client.clone();
                let group = group.clone();
                let request = request.clone();
                async move {
                    match client.call(&node, &group, consistency, request).await? {
                        DataReply::NotLeader { leader } => {
                            trace!(
                                node = %node,
                                group = %group,
                                ?leader,
                                "Replica redirected read"
                            );
                            Ok(Attempt::Redirect(leader))
                        }
                        DataReply::NotReplica => Ok(Attempt::Redirect(None)),
                        reply => Ok(Attempt::Done(reply)),
                    }
                }
            })
            .await
    }

    pub async fn scan(
        &self,
        path: &SeriesPath,
        filter: Option<&Filter>,
        after: Option<i64>,
        limit: usize,
        consistency: ConsistencyLevel,
    ) -> Result<Vec<TimeValuePair>> {
        let request = DataRequest::Scan {
            path: path.clone(),
            filter: filter.cloned(),
            after,
            limit,
        };
        match self.request(path, consistency, request).await? {
            DataReply::Points(points) => Ok(points),
            other => Err(unexpected("scan", &other)),
        }
    }

    pub async fn latest(
        &self,
        path: &SeriesPath,
        at_or_before: i64,
        consistency: ConsistencyLevel,
    ) -> Result<Option<TimeValuePair>> {
        let request = DataRequest::Latest {
            path: path.clone(),
            at_or_before,
        };
        match self.request(path, consistency, request).await? {
            DataReply::Point(point) => Ok(point),
            other => Err(unexpected("latest", &other)),
        }
    }

    pub async fn earliest(
        &self,
        path: &SeriesPath,
        at_or_after: i64,
        consistency: ConsistencyLevel,
    ) -> Result<Option<TimeValuePair>> {
        let request = DataRequest::Earliest {
            path: path.clone(),
            at_or_after,
        };
        match self.request(path, consistency, request).await? {
            DataReply::Point(point) => Ok(point),
            other => Err(unexpected("earliest", &other)),
        }
    }

    /// Schema lookup through the metadata group
    pub async fn data_type(
        &self,
        path: &SeriesPath,
        consistency: ConsistencyLevel,
    ) -> Result<Option<DataType>> {
        let request = DataRequest::DataType { path: path.clone() };
        match self
            .call(self.topology.metadata_route(), consistency, request)
            .await?
        {
            DataReply::DataType(data_type) => Ok(data_type),
            other => Err(unexpected("data type", &other)),
        }
    }

    /// Replicate a write; `route` picks the metadata or data group
    pub async fn write(&self, route: PartitionRoute, request: DataRequest) -> Result<LogIndex> {
        match self.call(route, ConsistencyLevel::Strong, request).await? {
            DataReply::Written(index) => Ok(index),
            other => Err(unexpected("write", &other)),
        }
    }
}

fn unexpected(operation: &str, reply: &DataReply) -> Error {
    Error::Rpc(format!("unexpected reply to {}: {:?}", operation, reply))
}

/// Ascending cursor over one series
pub struct SeriesReader {
    path: SeriesPath,
    batches: mpsc::Receiver<Result<Vec<TimeValuePair>>>,
    current: VecDeque<TimeValuePair>,
    exhausted: bool,
    prefetch: JoinHandle<()>,
}

impl SeriesReader {
    /// Start prefetching points of `path` that satisfy `filter`
    pub fn spawn(
        fetcher: Arc<SeriesFetcher>,
        path: SeriesPath,
        filter: Option<Filter>,
        context: &QueryContext,
    ) -> Self {
        let (tx, rx) = mpsc::channel(context.max_cached_batches.max(1));
        let limit = context.batch_read_size.max(1);
        let consistency = context.data_consistency;
        let task_path = path.clone();

        let prefetch = tokio::spawn(async move {
            let mut after = None;
            loop {
                let batch = fetcher
                    .scan(&task_path, filter.as_ref(), after, limit, consistency)
                    .await;
                let points = match batch {
                    Ok(points) => points,
                    Err(e) => {
                        let _ = tx.send(Err(e)).await;
                        return;
                    }
                };
                let last = points.last().map(|p| p.timestamp);
                let full = points.len() == limit;
                if !points.is_empty() && tx.send(Ok(points)).await.is_err() {
                    return;
                }
                match last {
                    Some(timestamp) if full => after = Some(timestamp),
                    _ => {
                        debug!(path = %task_path, "Series fully fetched");
                        return;
                    }
                }
            }
        });

        Self {
            path,
            batches: rx,
            current: VecDeque::new(),
            exhausted: false,
            prefetch,
        }
    }

    pub fn path(&self) -> &SeriesPath {
        &self.path
    }

    pub async fn peek(&mut self) -> Result<Option<&TimeValuePair>> {
        self.fill().await?;
        Ok(self.current.front())
    }

    pub async fn next_point(&mut self) -> Result<Option<TimeValuePair>> {
        self.fill().await?;
        Ok(self.current.pop_front())
    }

    async fn fill(&mut self) -> Result<()> {
        while self.current.is_empty() && !self.exhausted {
            match self.batches.recv().await {
                Some(Ok(batch)) => self.current.extend(batch),
                Some(Err(e)) => {
                    self.exhausted = true;
                    return Err(e);
                }
                None => self.exhausted = true,
            }
        }
        Ok(())
    }
}

impl Drop for SeriesReader {
    fn drop(&mut self) {
        self.prefetch.abort();
    }
}

/// Looks up values of one series at ascending timestamps
pub struct ReaderByTimestamp {
    reader: SeriesReader,
}

impl ReaderByTimestamp {
    pub fn new(reader: SeriesReader) -> Self {
        Self { reader }
    }

    /// Value at exactly `timestamp`; calls must use non-decreasing timestamps
    pub async fn value_at(&mut self, timestamp: i64) -> Result<Option<Value>> {
        loop {
            let Some(point) = self.reader.peek().await? else {
                return Ok(None);
            };
            if point.timestamp > timestamp {
                return Ok(None);
            }
            if point.timestamp == timestamp {
                return Ok(Some(point.value.clone()));
            }
            self.reader.next_point().await?;
        }
    }
}

/// Timestamps satisfying a value-dependent expression, ascending
pub enum TimeGenerator {
    Leaf(SeriesReader),
    And(Box<TimeGenerator>, Box<TimeGenerator>),
    Or(Box<TimeGenerator>, Box<TimeGenerator>),
}

impl TimeGenerator {
    /// Build from an optimized expression that is not GLOBAL_TIME
    pub fn build(
        expression: &Expression,
        fetcher: &Arc<SeriesFetcher>,
        context: &QueryContext,
    ) -> Result<Self> {
        Ok(match expression {
            Expression::Series { path, filter } => TimeGenerator::Leaf(SeriesReader::spawn(
                fetcher.clone(),
                path.clone(),
                Some(filter.clone()),
                context,
            )),
            Expression::And(left, right) => TimeGenerator::And(
                Box::new(Self::build(left, fetcher, context)?),
                Box::new(Self::build(right, fetcher, context)?),
            ),
            Expression::Or(left, right) => TimeGenerator::Or(
                Box::new(Self::build(left, fetcher, context)?),
                Box::new(Self::build(right, fetcher, context)?),
            ),
            Expression::GlobalTime(_) => {
                return Err(Error::Query(
                    "global time filter left inside a series expression".to_string(),
                ))
            }
        })
    }

    /// Next timestamp without consuming it
    pub fn peek_time(&mut self) -> BoxFuture<'_, Result<Option<i64>>> {
        async move {
            match self {
                TimeGenerator::Leaf(reader) => Ok(reader.peek().await?.map(|p| p.timestamp)),
                TimeGenerator::Or(left, right) => {
                    let l = left.peek_time().await?;
                    let r = right.peek_time().await?;
                    Ok(match (l, r) {
                        (Some(l), Some(r)) => Some(l.min(r)),
                        (l, r) => l.or(r),
                    })
                }
                TimeGenerator::And(left, right) => loop {
                    let (Some(l), Some(r)) = (left.peek_time().await?, right.peek_time().await?)
                    else {
                        return Ok(None);
                    };
                    if l == r {
                        return Ok(Some(l));
                    }
                    // Only timestamps present on both sides survive
                    if l < r {
                        left.next_time().await?;
                    } else {
                        right.next_time().await?;
                    }
                },
            }
        }
        .boxed()
    }

    pub fn next_time(&mut self) -> BoxFuture<'_, Result<Option<i64>>> {
        async move {
            let Some(timestamp) = self.peek_time().await? else {
                return Ok(None);
            };
            match self {
                TimeGenerator::Leaf(reader) => {
                    reader.next_point().await?;
                }
                TimeGenerator::And(left, right) | TimeGenerator::Or(left, right) => {
                    for side in [left, right] {
                        if side.peek_time().await? == Some(timestamp) {
                            side.next_time().await?;
                        }
                    }
                }
            }
            Ok(Some(timestamp))
        }
        .boxed()
    }
}
