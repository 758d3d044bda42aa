//! Full write and query paths across an in-process three node cluster

use chronoraft::cluster::LocalCluster;
use chronoraft::config::ClusterConfig;
use chronoraft::coordinator::Coordinator;
use chronoraft::query::{
    collect_rows, AggregationPlan, AggregationType, CompareOp, DataType, Expression,
    FillQueryPlan, FillStrategy, Filter, GroupByPlan, GroupByWindow, LastQueryPlan, QueryPlan,
    RawDataQueryPlan, RowRecord, SeriesPath, SeriesSelection, TimeValuePair, Value,
};
use chronoraft::Error;

use std::collections::HashMap;
use std::time::Duration;

const S1: &str = "root.sg1.d1.s1";
const S2: &str = "root.sg2.d1.s2";

struct Harness {
    cluster: LocalCluster,
    coordinator: Coordinator,
}

fn config() -> ClusterConfig {
    ClusterConfig {
        nodes: vec![
            "127.0.0.1:8881".to_string(),
            "127.0.0.1:8882".to_string(),
            "127.0.0.1:8883".to_string(),
        ],
        replication: 3,
        port: 8881,
        election_timeout_ms: 150,
        qp_task_redo_count: 20,
        batch_read_size: 2,
        ..ClusterConfig::default()
    }
}

async fn start() -> Harness {
    let config = config();
    let cluster = LocalCluster::start(config.clone()).unwrap();
    cluster
        .wait_for_leaders(Duration::from_secs(5))
        .await
        .unwrap();
    let coordinator =
        Coordinator::new(config.clone(), std::sync::Arc::new(cluster.client(&config.local_node())))
            .unwrap();
    Harness {
        cluster,
        coordinator,
    }
}

fn doubles(points: &[(i64, f64)]) -> Vec<TimeValuePair> {
    points
        .iter()
        .map(|(t, v)| TimeValuePair::new(*t, Value::Double(*v)))
        .collect()
}

fn ints(points: &[(i64, i32)]) -> Vec<TimeValuePair> {
    points
        .iter()
        .map(|(t, v)| TimeValuePair::new(*t, Value::Int32(*v)))
        .collect()
}

/// s1: DOUBLE at 10..40, s2: INT32 at 20, 40, 50
async fn seeded() -> Harness {
    let harness = start().await;
    harness
        .coordinator
        .write(
            &S1.into(),
            DataType::Double,
            doubles(&[(10, 1.0), (20, 2.0), (30, 3.0), (40, 4.0)]),
        )
        .await
        .unwrap();
    harness
        .coordinator
        .write(&S2.into(), DataType::Int32, ints(&[(20, 20), (40, 40), (50, 50)]))
        .await
        .unwrap();
    harness
}

fn both() -> SeriesSelection {
    SeriesSelection::new(
        vec![S1.into(), S2.into()],
        vec![DataType::Double, DataType::Int32],
    )
    .unwrap()
}

async fn rows(harness: &Harness, plan: QueryPlan) -> Vec<RowRecord> {
    let mut dataset = harness.coordinator.execute(plan).await.unwrap();
    collect_rows(dataset.as_mut()).await.unwrap()
}

#[tokio::test]
async fn test_aligned_raw_query_merges_series_by_time() {
    let harness = seeded().await;
    let rows = rows(&harness, QueryPlan::RawData(RawDataQueryPlan::new(both(), None))).await;

    let timestamps: Vec<_> = rows.iter().map(|r| r.timestamp.unwrap()).collect();
    assert_eq!(timestamps, vec![10, 20, 30, 40, 50]);
    assert_eq!(rows[0].fields, vec![Some(Value::Double(1.0)), None]);
    assert_eq!(
        rows[1].fields,
        vec![Some(Value::Double(2.0)), Some(Value::Int32(20))]
    );
    assert_eq!(rows[4].fields, vec![None, Some(Value::Int32(50))]);
    harness.cluster.shutdown().await;
}

#[tokio::test]
async fn test_time_and_value_filters() {
    let harness = seeded().await;

    let time = Expression::global_time(Filter::time(CompareOp::Gt, 20));
    let rows_after = rows(
        &harness,
        QueryPlan::RawData(RawDataQueryPlan::new(both(), Some(time))),
    )
    .await;
    let timestamps: Vec<_> = rows_after.iter().map(|r| r.timestamp.unwrap()).collect();
    assert_eq!(timestamps, vec![30, 40, 50]);

    let value = Expression::series(S1, Filter::value(CompareOp::Gt, Value::Double(2.5)));
    let filtered = rows(
        &harness,
        QueryPlan::RawData(RawDataQueryPlan::new(both(), Some(value))),
    )
    .await;
    assert_eq!(
        filtered,
        vec![
            RowRecord::new(30, vec![Some(Value::Double(3.0)), None]),
            RowRecord::new(40, vec![Some(Value::Double(4.0)), Some(Value::Int32(40))]),
        ]
    );
    harness.cluster.shutdown().await;
}

#[tokio::test]
async fn test_non_aligned_rows_have_no_shared_timestamp() {
    let harness = seeded().await;
    let mut dataset = harness
        .coordinator
        .execute(QueryPlan::RawData(
            RawDataQueryPlan::new(both(), None).non_aligned(),
        ))
        .await
        .unwrap();
    assert_eq!(dataset.columns().len(), 4);
    let rows = collect_rows(dataset.as_mut()).await.unwrap();
    assert_eq!(rows.len(), 4);
    assert!(rows.iter().all(|r| r.timestamp.is_none()));
    harness.cluster.shutdown().await;
}

#[tokio::test]
async fn test_aggregation() {
    let harness = seeded().await;
    let plan = AggregationPlan::new(
        vec![S1.into(), S1.into(), S2.into()],
        vec![DataType::Double, DataType::Double, DataType::Int32],
        vec![
            AggregationType::Count,
            AggregationType::Sum,
            AggregationType::MaxValue,
        ],
        None,
    )
    .unwrap();
    let batch = harness
        .coordinator
        .execute_to_batch(QueryPlan::Aggregation(plan))
        .await
        .unwrap();
    assert_eq!(batch.num_rows(), 1);
    assert_eq!(batch.schema().field(1).name(), "count(root.sg1.d1.s1)");

    let plan = AggregationPlan::new(
        vec![S1.into(), S1.into(), S2.into()],
        vec![DataType::Double, DataType::Double, DataType::Int32],
        vec![
            AggregationType::Count,
            AggregationType::Sum,
            AggregationType::MaxValue,
        ],
        None,
    )
    .unwrap();
    let result = rows(&harness, QueryPlan::Aggregation(plan)).await;
    assert_eq!(
        result[0].fields,
        vec![
            Some(Value::Int64(4)),
            Some(Value::Double(10.0)),
            Some(Value::Int32(50)),
        ]
    );
    harness.cluster.shutdown().await;
}

#[tokio::test]
async fn test_group_by_windows() {
    let harness = seeded().await;
    let aggregation = AggregationPlan::new(
        vec![S1.into()],
        vec![DataType::Double],
        vec![AggregationType::Count],
        None,
    )
    .unwrap();
    let plan = GroupByPlan::new(aggregation, GroupByWindow::new(20, 20, 0, 80));
    let result = rows(&harness, QueryPlan::GroupBy(plan)).await;

    let counts: Vec<_> = result
        .iter()
        .map(|r| (r.timestamp.unwrap(), r.fields[0].clone()))
        .collect();
    assert_eq!(
        counts,
        vec![
            (0, Some(Value::Int64(1))),
            (20, Some(Value::Int64(2))),
            (40, Some(Value::Int64(1))),
            (60, Some(Value::Int64(0))),
        ]
    );
    harness.cluster.shutdown().await;
}

#[tokio::test]
async fn test_fill_previous_and_linear() {
    let harness = start().await;
    let path: SeriesPath = S1.into();
    harness
        .coordinator
        .write(&path, DataType::Double, doubles(&[(990, 1.0), (1010, 3.0)]))
        .await
        .unwrap();

    let series = SeriesSelection::single(S1, DataType::Double);
    let fill_at = |strategy: FillStrategy| {
        QueryPlan::Fill(FillQueryPlan {
            series: series.clone(),
            query_time: 1000,
            fill: HashMap::from([(DataType::Double, strategy)]),
        })
    };

    let previous = rows(&harness, fill_at(FillStrategy::previous())).await;
    assert_eq!(previous, vec![RowRecord::new(1000, vec![Some(Value::Double(1.0))])]);

    let linear = rows(&harness, fill_at(FillStrategy::linear())).await;
    assert_eq!(linear, vec![RowRecord::new(1000, vec![Some(Value::Double(2.0))])]);

    // The earlier point is 10ms away, outside a 5ms range
    let bounded = rows(
        &harness,
        fill_at(FillStrategy::Previous {
            before_range: Some(5),
        }),
    )
    .await;
    assert_eq!(bounded, vec![RowRecord::new(1000, vec![None])]);
    harness.cluster.shutdown().await;
}

#[tokio::test]
async fn test_last_returns_latest_point_per_series() {
    let harness = seeded().await;
    let result = rows(&harness, QueryPlan::Last(LastQueryPlan { series: both() })).await;
    assert_eq!(
        result,
        vec![
            RowRecord::new(
                40,
                vec![
                    Some(Value::Text(S1.to_string())),
                    Some(Value::Text("4".to_string())),
                ]
            ),
            RowRecord::new(
                50,
                vec![
                    Some(Value::Text(S2.to_string())),
                    Some(Value::Text("50".to_string())),
                ]
            ),
        ]
    );
    harness.cluster.shutdown().await;
}

#[tokio::test]
async fn test_resolve_series_and_type_conflicts() {
    let harness = seeded().await;
    let selection = harness
        .coordinator
        .resolve_series(&[S1.into(), S2.into()])
        .await
        .unwrap();
    assert_eq!(selection, both());

    let missing = harness
        .coordinator
        .resolve_series(&["root.sg9.d1.s1".into()])
        .await
        .unwrap_err();
    assert!(matches!(missing, Error::StorageEngine(_)));

    let conflict = harness
        .coordinator
        .write(&S1.into(), DataType::Int32, ints(&[(60, 6)]))
        .await
        .unwrap_err();
    assert!(matches!(conflict, Error::Query(_)));
    harness.cluster.shutdown().await;
}

#[tokio::test]
async fn test_strong_reads_survive_one_isolated_node() {
    let harness = seeded().await;
    let isolated = config().nodes[2].clone();
    harness.cluster.network().isolate(&isolated);
    // Leaders on the isolated node are replaced after an election timeout
    tokio::time::sleep(Duration::from_millis(600)).await;

    let result = rows(&harness, QueryPlan::RawData(RawDataQueryPlan::new(both(), None))).await;
    assert_eq!(result.len(), 5);

    harness
        .coordinator
        .write(&S1.into(), DataType::Double, doubles(&[(60, 6.0)]))
        .await
        .unwrap();
    let last = rows(
        &harness,
        QueryPlan::Last(LastQueryPlan {
            series: SeriesSelection::single(S1, DataType::Double),
        }),
    )
    .await;
    assert_eq!(last[0].timestamp, Some(60));
    harness.cluster.shutdown().await;
}
