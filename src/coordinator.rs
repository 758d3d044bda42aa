//! Coordinator façade
//!
//! Wires configuration, topology, the QP task pool, the inner RPC client,
//! the cluster executor and the router into one entry point for the
//! session layer.

use crate::clock::MonotonicClock;
use crate::cluster::{ClusterTopology, DataClient, DataRequest, QpTaskPool};
use crate::config::{ClusterConfig, ConsistencyLevel};
use crate::query::{
    collect_rows, to_record_batch, AggregationPlan, ClusterQueryExecutor, DataType,
    FillQueryPlan, GroupByFillPlan, GroupByPlan, LastQueryPlan, QueryContext, QueryDataSet,
    QueryPlan, QueryRouter, RawDataQueryPlan, SeriesFetcher, SeriesPath, SeriesSelection,
    TimeValuePair,
};
use crate::raft::LogIndex;
use crate::{Error, Result};

use arrow_array::RecordBatch;
use std::sync::Arc;
use tracing::{debug, info};

pub struct Coordinator {
    config: ClusterConfig,
    topology: Arc<ClusterTopology>,
    fetcher: Arc<SeriesFetcher>,
    router: QueryRouter,
}

impl Coordinator {
    pub fn new(config: ClusterConfig, client: Arc<dyn DataClient>) -> Result<Self> {
        let topology = Arc::new(ClusterTopology::from_config(&config)?);
        Self::with_topology(config, topology, client)
    }

    pub fn with_topology(
        config: ClusterConfig,
        topology: Arc<ClusterTopology>,
        client: Arc<dyn DataClient>,
    ) -> Result<Self> {
        config.validate()?;
        let tasks = QpTaskPool::from_config(&config);
        let fetcher = Arc::new(SeriesFetcher::new(topology.clone(), client, tasks));
        let executor = Arc::new(ClusterQueryExecutor::new(
            fetcher.clone(),
            Arc::new(MonotonicClock::new()),
        ));
        info!(
            node = %config.local_node(),
            nodes = topology.nodes().len(),
            replication = topology.replication(),
            "Coordinator ready"
        );
        Ok(Self {
            config,
            topology,
            fetcher,
            router: QueryRouter::new(executor),
        })
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn topology(&self) -> &ClusterTopology {
        &self.topology
    }

    pub fn tasks(&self) -> &QpTaskPool {
        self.fetcher.tasks()
    }

    /// Fresh context carrying the configured consistency levels
    pub fn context(&self) -> QueryContext {
        QueryContext::from_config(&self.config)
    }

    pub async fn execute(&self, plan: QueryPlan) -> Result<Box<dyn QueryDataSet>> {
        self.router.execute(plan, &self.context()).await
    }

    /// Run `plan` to completion as one Arrow batch
    pub async fn execute_to_batch(&self, plan: QueryPlan) -> Result<RecordBatch> {
        let mut dataset = self.execute(plan).await?;
        let rows = collect_rows(dataset.as_mut()).await?;
        to_record_batch(dataset.columns(), &rows)
    }

    pub async fn raw_data(&self, plan: RawDataQueryPlan) -> Result<Box<dyn QueryDataSet>> {
        self.router.raw_data(plan, &self.context()).await
    }

    pub async fn aggregate(&self, plan: AggregationPlan) -> Result<Box<dyn QueryDataSet>> {
        self.router.aggregate(plan, &self.context()).await
    }

    pub async fn group_by(&self, plan: GroupByPlan) -> Result<Box<dyn QueryDataSet>> {
        self.router.group_by(plan, &self.context()).await
    }

    pub async fn group_by_fill(&self, plan: GroupByFillPlan) -> Result<Box<dyn QueryDataSet>> {
        self.router.group_by_fill(plan, &self.context()).await
    }

    pub async fn fill(&self, plan: FillQueryPlan) -> Result<Box<dyn QueryDataSet>> {
        self.router.fill(plan, &self.context()).await
    }

    pub async fn last(&self, plan: LastQueryPlan) -> Result<Box<dyn QueryDataSet>> {
        self.router.last(plan, &self.context()).await
    }

    /// Look up registered types through the metadata group
    ///
    /// Uses the metadata consistency level, independent of the data level
    /// later reads run at.
    pub async fn resolve_series(&self, paths: &[SeriesPath]) -> Result<SeriesSelection> {
        let consistency = self.config.read_metadata_consistency_level;
        let mut data_types = Vec::with_capacity(paths.len());
        for path in paths {
            let data_type = self
                .fetcher
                .data_type(path, consistency)
                .await?
                .ok_or_else(|| Error::StorageEngine(format!("series {} does not exist", path)))?;
            data_types.push(data_type);
        }
        SeriesSelection::new(paths.to_vec(), data_types)
    }

    /// Register `path` if needed, then replicate `points` to its partition
    pub async fn write(
        &self,
        path: &SeriesPath,
        data_type: DataType,
        points: Vec<TimeValuePair>,
    ) -> Result<LogIndex> {
        if let Some(point) = points.iter().find(|p| p.value.data_type() != data_type) {
            return Err(Error::Query(format!(
                "point at {} is {}, series {} is {}",
                point.timestamp,
                point.value.data_type(),
                path,
                data_type
            )));
        }

        match self
            .fetcher
            .data_type(path, ConsistencyLevel::Strong)
            .await?
        {
            Some(existing) if existing != data_type => {
                return Err(Error::Query(format!(
                    "series {} is registered as {}",
                    path, existing
                )));
            }
            Some(_) => {}
            None => {
                let request = DataRequest::RegisterSeries {
                    path: path.clone(),
                    data_type,
                };
                self.fetcher
                    .write(self.topology.metadata_route(), request)
                    .await?;
                debug!(path = %path, data_type = %data_type, "Registered series");
            }
        }

        let route = self.topology.route(&path.partition_key())?;
        let count = points.len();
        let index = self
            .fetcher
            .write(
                route,
                DataRequest::Insert {
                    path: path.clone(),
                    points,
                },
            )
            .await?;
        debug!(path = %path, points = count, index, "Inserted points");
        Ok(index)
    }
}
