use async_trait::async_trait;
use clusterweave::application::DummyApplication;
use clusterweave::cluster::{ClusterConfig, ClusterHandle, ClusterLauncher, LocalLauncher};
use clusterweave::endpoint::{QueryClient, RetryPolicy};
use clusterweave::error::{ClusterError, HarnessError, QueryError};
use clusterweave::harness::{Expectation, HarnessReport, Scenario, Settle};
use clusterweave::injection::{InjectionConfig, Reader, Sender, iter_generator};
use clusterweave::query::{OutputFormat, QueryKind};
use serde_json::{Value, json};
use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::Duration;
use tokio_test::assert_ok;

const INPUT_ITEMS: u8 = 10;

fn launcher() -> LocalLauncher {
  LocalLauncher::new(DummyApplication)
}

/// `A`..`J`, each encoded as a 2-byte tag and a big-endian 1.
fn letters() -> Reader {
  let keys = (0..INPUT_ITEMS).map(|i| ((b'A' + i) as char).to_string());
  Reader::new(iter_generator(keys, |key: &String| DummyApplication::encode(key, 1)))
}

fn injection() -> InjectionConfig {
  InjectionConfig::default()
    .with_batch_size(50)
    .with_interval(Duration::from_millis(50))
    .with_reconnect(true)
}

fn acknowledged() -> Settle {
  Settle::Acknowledged {
    timeout: Duration::from_secs(10),
  }
}

fn with_data(workers: usize) -> Scenario {
  Scenario::new(ClusterConfig::default().with_workers(workers))
    .with_injection(0, letters(), injection())
    .with_settle(acknowledged())
}

fn answer(report: &HarnessReport, kind: QueryKind) -> &Value {
  report.answer(kind).unwrap()
}

fn sum_per_partition(stateless: &Value) -> u64 {
  stateless
    .as_object()
    .unwrap()
    .values()
    .flat_map(|per_worker| per_worker.as_object().unwrap().values())
    .map(|count| count.as_u64().unwrap())
    .sum()
}

#[tokio::test]
async fn test_partition_query_lists_structure_before_data() {
  let report = Scenario::new(ClusterConfig::default().with_workers(3))
    .expect(Expectation::keys(
      QueryKind::Partition,
      "",
      ["state_partitions", "stateless_partitions"],
    ))
    .expect(Expectation::keys(
      QueryKind::Partition,
      "/state_partitions",
      ["DummyState", "PartitionedDummyState"],
    ))
    .expect(Expectation::keys(
      QueryKind::Partition,
      "/state_partitions/DummyState",
      ["initializer", "worker1", "worker2"],
    ))
    .expect(Expectation::cardinality(
      QueryKind::Partition,
      "/stateless_partitions",
      DummyApplication::STATELESS_PARTITIONS,
    ))
    .run(&launcher())
    .await
    .unwrap();
  assert!(report.injection.is_none());
}

#[tokio::test]
async fn test_partition_count_single_worker() {
  let report = with_data(1)
    .expect(Expectation::equals(
      QueryKind::PartitionCount,
      "/state_partitions",
      json!({
        "DummyState": {"initializer": 1},
        "PartitionedDummyState": {"initializer": INPUT_ITEMS}
      }),
    ))
    .run(&launcher())
    .await
    .unwrap();

  let stateless = &answer(&report, QueryKind::PartitionCount)["stateless_partitions"];
  for (id, per_worker) in stateless.as_object().unwrap() {
    assert!(id.parse::<u64>().unwrap() > 0);
    assert_eq!(per_worker.as_object().unwrap().keys().collect::<Vec<_>>(), ["initializer"]);
  }
  assert_eq!(sum_per_partition(stateless), u64::from(INPUT_ITEMS));
  assert_eq!(report.injection.unwrap().acknowledged, u64::from(INPUT_ITEMS));
}

#[tokio::test]
async fn test_partition_count_two_workers_totals_match_input() {
  let report = with_data(2)
    .expect(Expectation::equals(
      QueryKind::PartitionCount,
      "/state_partitions/DummyState",
      json!({"initializer": 1}),
    ))
    .expect(Expectation::total(
      QueryKind::PartitionCount,
      "/state_partitions/PartitionedDummyState",
      u64::from(INPUT_ITEMS),
    ))
    .run(&launcher())
    .await
    .unwrap();

  let stateless = &answer(&report, QueryKind::PartitionCount)["stateless_partitions"];
  assert_eq!(sum_per_partition(stateless), u64::from(INPUT_ITEMS));
}

#[tokio::test]
async fn test_fixed_settle_delay() {
  with_data(1)
    .with_settle(Settle::Fixed(Duration::from_millis(500)))
    .expect(Expectation::equals(
      QueryKind::StateEntityCount,
      "",
      json!({"DummyState": 1, "PartitionedDummyState": INPUT_ITEMS}),
    ))
    .run(&launcher())
    .await
    .unwrap();
}

#[tokio::test]
async fn test_cluster_status_on_fresh_cluster() {
  Scenario::new(ClusterConfig::default().with_workers(2))
    .expect(Expectation::equals(
      QueryKind::ClusterStatus,
      "",
      json!({
        "processing_messages": true,
        "worker_names": ["initializer", "worker1"],
        "worker_count": 2
      }),
    ))
    .run(&launcher())
    .await
    .unwrap();
}

#[tokio::test]
async fn test_source_ids() {
  let report = with_data(1)
    .expect(Expectation::keys(QueryKind::SourceIds, "", ["source_ids"]))
    .expect(Expectation::cardinality(QueryKind::SourceIds, "/source_ids", 1))
    .run(&launcher())
    .await
    .unwrap();
  let id = answer(&report, QueryKind::SourceIds)["source_ids"][0].as_str().unwrap();
  assert!(id.parse::<u64>().unwrap() > 0);
}

#[tokio::test]
async fn test_multiple_sources_have_distinct_ids() {
  let report = Scenario::new(ClusterConfig::default().with_sources(3))
    .expect(Expectation::cardinality(QueryKind::SourceIds, "/source_ids", 3))
    .run(&launcher())
    .await
    .unwrap();
  let ids = answer(&report, QueryKind::SourceIds)["source_ids"].as_array().unwrap();
  assert_ne!(ids[0], ids[1]);
  assert_ne!(ids[1], ids[2]);
}

#[tokio::test]
async fn test_state_entity_queries() {
  let report = with_data(2)
    .expect(Expectation::keys(
      QueryKind::StateEntity,
      "",
      ["DummyState", "PartitionedDummyState"],
    ))
    .expect(Expectation::equals(QueryKind::StateEntity, "/DummyState", json!(["key"])))
    .expect(Expectation::cardinality(
      QueryKind::StateEntity,
      "/PartitionedDummyState",
      usize::from(INPUT_ITEMS),
    ))
    .expect(Expectation::equals(
      QueryKind::StateEntityCount,
      "",
      json!({"DummyState": 1, "PartitionedDummyState": INPUT_ITEMS}),
    ))
    .run(&launcher())
    .await
    .unwrap();

  let keys: Vec<&str> = answer(&report, QueryKind::StateEntity)["PartitionedDummyState"]
    .as_array()
    .unwrap()
    .iter()
    .map(|key| key.as_str().unwrap())
    .collect();
  assert_eq!(keys, ["A", "B", "C", "D", "E", "F", "G", "H", "I", "J"]);
}

#[tokio::test]
async fn test_initializer_counts_after_injection() {
  let report = with_data(2)
    .query(QueryKind::StateInitializerCount)
    .run(&launcher())
    .await
    .unwrap();
  let counts = answer(&report, QueryKind::StateInitializerCount);
  assert_eq!(counts["DummyState"], json!({"key": 1}));
  let partitioned = counts["PartitionedDummyState"].as_object().unwrap();
  assert_eq!(partitioned.len(), usize::from(INPUT_ITEMS));
  assert!(partitioned.values().all(|count| count == &json!(1)));
}

#[tokio::test]
async fn test_stateless_partition_query_on_fresh_cluster() {
  let report = Scenario::new(ClusterConfig::default().with_workers(2))
    .query(QueryKind::StatelessPartition)
    .query(QueryKind::StatelessPartitionCount)
    .run(&launcher())
    .await
    .unwrap();

  let listing = answer(&report, QueryKind::StatelessPartition).as_object().unwrap();
  assert_eq!(listing.len(), DummyApplication::STATELESS_PARTITIONS);
  for (id, per_worker) in listing {
    assert!(id.parse::<u64>().unwrap() > 0);
    let per_worker = per_worker.as_object().unwrap();
    assert_eq!(per_worker.keys().collect::<Vec<_>>(), ["initializer", "worker1"]);
    for markers in per_worker.values() {
      let markers = markers.as_array().unwrap();
      assert_eq!(markers.len(), 1);
      assert!(markers[0].as_u64().unwrap() > 0);
    }
  }

  let counts = answer(&report, QueryKind::StatelessPartitionCount);
  for per_worker in counts.as_object().unwrap().values() {
    assert_eq!(per_worker, &json!({"initializer": 0, "worker1": 0}));
  }
}

#[tokio::test]
async fn test_stateless_counts_sum_to_records() {
  let report = with_data(2)
    .query(QueryKind::StatelessPartitionCount)
    .run(&launcher())
    .await
    .unwrap();
  let counts = answer(&report, QueryKind::StatelessPartitionCount);
  assert_eq!(sum_per_partition(counts), u64::from(INPUT_ITEMS));
}

#[tokio::test]
async fn test_repeated_queries_are_byte_identical() {
  let mut cluster = assert_ok!(launcher().launch(&ClusterConfig::default().with_workers(2)).await);
  let report = Sender::new(cluster.source_addrs()[0], letters(), injection())
    .run()
    .await
    .unwrap();
  assert_eq!(report.acknowledged, u64::from(INPUT_ITEMS));

  let workers = cluster.workers();
  let initializer = QueryClient::new(workers[0].control_addr);
  let worker1 = QueryClient::new(workers[1].control_addr);
  for kind in QueryKind::ALL {
    let first = initializer.query(kind.as_str(), OutputFormat::Json).await.unwrap();
    let second = initializer.query(kind.as_str(), OutputFormat::Json).await.unwrap();
    let elsewhere = worker1.query(kind.as_str(), OutputFormat::Json).await.unwrap();
    assert_eq!(first, second, "{kind}");
    assert_eq!(first, elsewhere, "{kind}");
  }
  assert_ok!(cluster.shutdown().await);
}

#[tokio::test]
async fn test_human_output() {
  let mut cluster = assert_ok!(launcher().launch(&ClusterConfig::default().with_workers(2)).await);
  let client = QueryClient::new(cluster.workers()[0].control_addr);
  let body = client
    .query("cluster-status-query", OutputFormat::Human)
    .await
    .unwrap();
  assert_eq!(
    body,
    "processing_messages: true\nworker_count: 2\nworker_names:\n  - initializer\n  - worker1\n"
  );
  assert_ok!(cluster.shutdown().await);
}

#[tokio::test]
async fn test_unknown_query_kind() {
  let mut cluster = assert_ok!(launcher().launch(&ClusterConfig::default()).await);
  let client = QueryClient::new(cluster.workers()[0].control_addr);
  let err = client.query("bogus-query", OutputFormat::Json).await.unwrap_err();
  assert!(matches!(err, QueryError::UnknownQuery(ref kind) if kind == "bogus-query"));
  assert_ok!(cluster.shutdown().await);
}

#[tokio::test]
async fn test_unreachable_control_plane() {
  let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  drop(listener);

  let err = QueryClient::new(addr)
    .with_retry(RetryPolicy::new(2, Duration::from_millis(10)))
    .query_json(QueryKind::ClusterStatus)
    .await
    .unwrap_err();
  match err {
    QueryError::QueryUnreachable { addr: got, attempts, .. } => {
      assert_eq!(got, addr);
      assert_eq!(attempts, 2);
    }
    other => panic!("unexpected error: {other:?}"),
  }
}

#[tokio::test]
async fn test_stopped_cluster_is_unreachable() {
  let mut cluster = assert_ok!(launcher().launch(&ClusterConfig::default().with_workers(2)).await);
  let workers = cluster.workers();
  assert_ok!(cluster.shutdown().await);

  // Nothing answers on the stopped control planes any more.
  let err = QueryClient::new(workers[0].control_addr)
    .with_retry(RetryPolicy::no_retry())
    .query_json(QueryKind::ClusterStatus)
    .await
    .unwrap_err();
  assert!(err.is_retryable());
}

#[tokio::test]
async fn test_shutdown_is_idempotent_and_clears_liveness() {
  let mut cluster = assert_ok!(launcher().launch(&ClusterConfig::default().with_workers(2)).await);
  assert!(cluster.workers().iter().all(|worker| worker.alive));
  assert_ok!(cluster.shutdown().await);
  assert!(cluster.workers().iter().all(|worker| !worker.alive));
  assert_ok!(cluster.shutdown().await);
}

#[tokio::test]
async fn test_cluster_without_sources_keeps_processing() {
  let mut cluster = assert_ok!(
    launcher()
      .launch(&ClusterConfig::default().with_workers(2).with_sources(0))
      .await
  );
  assert!(cluster.source_addrs().is_empty());
  // Give the worker loops a chance to observe a closed channel, if any.
  tokio::time::sleep(Duration::from_millis(100)).await;
  assert!(cluster.workers().iter().all(|worker| worker.alive));

  let client = QueryClient::new(cluster.workers()[0].control_addr);
  let status = assert_ok!(client.query_json(QueryKind::ClusterStatus).await);
  assert_eq!(status["processing_messages"], json!(true));
  let sources = assert_ok!(client.query_json(QueryKind::SourceIds).await);
  assert_eq!(sources, json!({"source_ids": []}));

  assert_ok!(cluster.shutdown().await);
  assert!(cluster.workers().iter().all(|worker| !worker.alive));
}

#[tokio::test]
async fn test_zero_workers_is_rejected() {
  let err = launcher()
    .launch(&ClusterConfig::default().with_workers(0))
    .await
    .err()
    .unwrap();
  assert!(matches!(err, ClusterError::InvalidConfig(_)));
}

/// Wraps a launcher and remembers every control-plane address it handed out.
struct RecordingLauncher {
  inner: LocalLauncher,
  control_addrs: Mutex<Vec<SocketAddr>>,
}

#[async_trait]
impl ClusterLauncher for RecordingLauncher {
  async fn launch(&self, config: &ClusterConfig) -> Result<Box<dyn ClusterHandle>, ClusterError> {
    let cluster = self.inner.launch(config).await?;
    self
      .control_addrs
      .lock()
      .unwrap()
      .extend(cluster.workers().iter().map(|worker| worker.control_addr));
    Ok(cluster)
  }
}

#[tokio::test]
async fn test_failed_assertion_reports_and_tears_down() {
  let recording = RecordingLauncher {
    inner: launcher(),
    control_addrs: Mutex::new(Vec::new()),
  };
  let err = Scenario::new(ClusterConfig::default().with_workers(2))
    .expect(Expectation::equals(QueryKind::ClusterStatus, "/worker_count", json!(3)))
    .run(&recording)
    .await
    .unwrap_err();

  match err {
    HarnessError::AssertionFailed {
      kind,
      pointer,
      expected,
      actual,
    } => {
      assert_eq!(kind, QueryKind::ClusterStatus);
      assert_eq!(pointer, "/worker_count");
      assert_eq!(expected, json!(3));
      assert_eq!(actual, json!(2));
    }
    other => panic!("unexpected error: {other:?}"),
  }

  let addrs = recording.control_addrs.lock().unwrap().clone();
  assert_eq!(addrs.len(), 2);
  for addr in addrs {
    let err = QueryClient::new(addr)
      .with_retry(RetryPolicy::no_retry())
      .query_json(QueryKind::ClusterStatus)
      .await
      .unwrap_err();
    assert!(matches!(err, QueryError::QueryUnreachable { .. }));
  }
}
