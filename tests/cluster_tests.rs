//! QP task admission, redirects and partition placement

use chronoraft::cluster::{
    ClusterTopology, ConsistentHashRing, DataClient, DataReply, DataRequest, QpTaskPool,
};
use chronoraft::config::{ClusterConfig, ConsistencyLevel};
use chronoraft::query::{SeriesFetcher, SeriesPath, TimeValuePair, Value};
use chronoraft::raft::GroupId;
use chronoraft::{Error, Result};

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Barrier;

fn nodes() -> Vec<String> {
    vec![
        "10.0.0.1:8888".to_string(),
        "10.0.0.2:8888".to_string(),
        "10.0.0.3:8888".to_string(),
    ]
}

#[tokio::test]
async fn test_queue_overflow_rejects_while_admitted_tasks_finish() {
    let capacity = ClusterConfig {
        max_queue_num_of_qp_task: 8,
        ..Default::default()
    }
    .max_queue_num_of_qp_task;
    let pool = QpTaskPool::new(capacity, 4, 3, Duration::from_secs(5));
    // The admitted tasks and the test itself meet here once all are admitted
    let release = Arc::new(Barrier::new(capacity + 1));

    let mut admitted = Vec::new();
    for i in 0..capacity {
        let pool = pool.clone();
        let release = release.clone();
        admitted.push(tokio::spawn(async move {
            pool.submit(async move {
                release.wait().await;
                Ok(i)
            })
            .await
        }));
    }
    while pool.outstanding() < capacity {
        tokio::task::yield_now().await;
    }

    let overflow = pool.submit(async { Ok(usize::MAX) }).await;
    assert!(matches!(overflow, Err(Error::QueueRejected { capacity: 8 })));

    release.wait().await;
    let mut results = Vec::new();
    for task in admitted {
        results.push(task.await.unwrap().unwrap());
    }
    results.sort_unstable();
    assert_eq!(results, (0..capacity).collect::<Vec<_>>());
    assert_eq!(pool.outstanding(), 0);
}

/// Replica set where only `serving` answers; everyone else redirects
struct ScriptedClient {
    serving: Option<String>,
    hint: Option<String>,
    calls: Mutex<Vec<String>>,
}

#[async_trait]
impl DataClient for ScriptedClient {
    async fn call(
        &self,
        node: &String,
        _group: &GroupId,
        _consistency: ConsistencyLevel,
        _request: DataRequest,
    ) -> Result<DataReply> {
        self.calls.lock().push(node.clone());
        if self.serving.as_ref() == Some(node) {
            return Ok(DataReply::Points(vec![TimeValuePair::new(
                1,
                Value::Int64(42),
            )]));
        }
        Ok(DataReply::NotLeader {
            leader: self.hint.clone(),
        })
    }
}

fn fetcher(client: Arc<ScriptedClient>, redo_count: usize) -> SeriesFetcher {
    let topology = Arc::new(ClusterTopology::new(&nodes(), 3, 2).unwrap());
    SeriesFetcher::new(
        topology,
        client,
        QpTaskPool::new(10, 4, redo_count, Duration::from_secs(5)),
    )
}

#[tokio::test]
async fn test_redirect_exhaustion_is_an_error_not_an_empty_result() {
    let client = Arc::new(ScriptedClient {
        serving: None,
        hint: None,
        calls: Mutex::new(Vec::new()),
    });
    let fetcher = fetcher(client.clone(), 4);
    let path = SeriesPath::new("root.sg1.d1.s1");

    let err = fetcher
        .scan(&path, None, None, 100, ConsistencyLevel::Strong)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::RedirectExhausted { attempts: 4 }));
    assert_eq!(client.calls.lock().len(), 4);
}

#[tokio::test]
async fn test_redirect_follows_leader_hint() {
    let topology = ClusterTopology::new(&nodes(), 3, 2).unwrap();
    let replicas = topology.route_path("root.sg1.d1.s1").unwrap().replicas;
    let leader = replicas[2].clone();

    let client = Arc::new(ScriptedClient {
        serving: Some(leader.clone()),
        hint: Some(leader.clone()),
        calls: Mutex::new(Vec::new()),
    });
    let fetcher = fetcher(client.clone(), 4);
    let points = fetcher
        .scan(
            &SeriesPath::new("root.sg1.d1.s1"),
            None,
            None,
            100,
            ConsistencyLevel::Strong,
        )
        .await
        .unwrap();
    assert_eq!(points.len(), 1);
    assert_eq!(*client.calls.lock(), vec![replicas[0].clone(), leader]);
}

#[tokio::test]
async fn test_deadline_bounds_redirects() {
    let client = Arc::new(ScriptedClient {
        serving: None,
        hint: None,
        calls: Mutex::new(Vec::new()),
    });
    let topology = Arc::new(ClusterTopology::new(&nodes(), 3, 2).unwrap());
    let fetcher = SeriesFetcher::new(
        topology,
        client,
        QpTaskPool::new(10, 4, 10_000, Duration::from_millis(50)),
    );
    let err = fetcher
        .latest(&SeriesPath::new("root.sg1.d1.s1"), 0, ConsistencyLevel::Weak)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Timeout { after_ms: 50 }));
}

#[test]
fn test_storage_group_maps_to_r_distinct_nodes() {
    let topology = ClusterTopology::new(&nodes(), 2, 2).unwrap();
    for sg in 0..50 {
        let path = format!("root.sg{}.d1.s1", sg);
        let route = topology.route_path(&path).unwrap();
        assert_eq!(route.replicas.len(), 2);
        assert_ne!(route.replicas[0], route.replicas[1]);
        assert_eq!(route.group, GroupId::for_replicas(&route.replicas));

        // Series of one storage group share a partition
        let sibling = topology.route_path(&format!("root.sg{}.d7.s3", sg)).unwrap();
        assert_eq!(sibling, route);
    }
}

#[test]
fn test_rebuilt_ring_is_deterministic() {
    let a = ConsistentHashRing::new(nodes(), 4);
    let b = ConsistentHashRing::new(nodes(), 4);
    for key in ["root.sg1", "root.sg2", "root.ln"] {
        assert_eq!(a.assign(key, 3).unwrap(), b.assign(key, 3).unwrap());
    }

    let topology = ClusterTopology::new(&nodes(), 2, 4).unwrap();
    let mut grown = nodes();
    grown.push("10.0.0.4:8888".to_string());
    let rebuilt = topology.rebuild(&grown).unwrap();
    assert_eq!(rebuilt.nodes().len(), 4);
    assert_eq!(
        rebuilt.route_path("root.sg1.d1").unwrap(),
        ClusterTopology::new(&grown, 2, 4)
            .unwrap()
            .route_path("root.sg1.d1")
            .unwrap()
    );
}

#[test]
fn test_insufficient_nodes() {
    let err = ClusterTopology::new(&nodes()[..1], 2, 2).unwrap_err();
    assert!(matches!(
        err,
        Error::InsufficientNodes {
            required: 2,
            available: 1
        }
    ));
}
