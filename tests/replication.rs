//! End-to-end replication tests: two brokers in one process, wired
//! together with an in-memory fetch transport.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};

use slatemq::{
    now_ms, AckMode, AppError, AppResult, BrokerConfig, CleanupPolicy, FetchRequest,
    FetchResponse, FetchTransport, LogManager, PartitionFetchRequest, RecordBatchBuilder,
    ReplicaManager, TopicPartition, CONSUMER_REPLICA_ID,
};

/// Routes fetch requests to the target broker's replica manager.
#[derive(Default)]
struct Cluster {
    brokers: RwLock<HashMap<i32, Arc<ReplicaManager>>>,
}

impl Cluster {
    fn register(&self, manager: Arc<ReplicaManager>) {
        self.brokers
            .write()
            .unwrap()
            .insert(manager.broker_id(), manager);
    }
}

#[async_trait]
impl FetchTransport for Cluster {
    async fn fetch(&self, leader: i32, request: FetchRequest) -> AppResult<FetchResponse> {
        let manager = self
            .brokers
            .read()
            .unwrap()
            .get(&leader)
            .cloned()
            .ok_or_else(|| AppError::DetailedIoError(format!("no route to broker {}", leader)))?;
        Ok(manager.handle_fetch(request).await)
    }
}

async fn start_broker(
    cluster: &Arc<Cluster>,
    dir: &Path,
    broker_id: i32,
    tweak: impl FnOnce(&mut BrokerConfig),
) -> Arc<ReplicaManager> {
    let mut config = BrokerConfig::default();
    config.general.id = broker_id;
    config.general.data_dir = dir
        .join(format!("broker-{}", broker_id))
        .to_string_lossy()
        .into_owned();
    config.general.metadata_db_path = dir
        .join(format!("broker-{}-meta.json", broker_id))
        .to_string_lossy()
        .into_owned();
    config.log.index_file_size = 4096;
    config.log.index_interval_bytes = 64;
    config.replication.fetch_wait_max_ms = 20;
    config.replication.fetch_backoff_ms = 20;
    config.replication.socket_timeout_ms = 2_000;
    config.replication.lag_time_max_ms = 5_000;
    tweak(&mut config);
    let config = Arc::new(config);

    let (notify_shutdown, _) = broadcast::channel(1);
    let (shutdown_complete_tx, _) = mpsc::channel(1);
    let log_manager = LogManager::new(
        config.clone(),
        notify_shutdown.clone(),
        shutdown_complete_tx.clone(),
    )
    .await
    .unwrap();
    let transport: Arc<dyn FetchTransport> = cluster.clone();
    let manager = ReplicaManager::new(
        config,
        log_manager,
        transport,
        notify_shutdown,
        shutdown_complete_tx,
    )
    .await
    .unwrap();
    manager.start_background_tasks();
    cluster.register(manager.clone());
    manager
}

fn batch(values: &[&str]) -> slatemq::MemoryRecords {
    let mut builder = RecordBatchBuilder::default();
    for value in values {
        builder.append_record(None, value.as_bytes(), now_ms());
    }
    builder.build()
}

fn consumer_fetch(tp: &TopicPartition, offset: i64) -> FetchRequest {
    FetchRequest {
        source_broker: CONSUMER_REPLICA_ID,
        max_wait_ms: 0,
        min_bytes: 0,
        partitions: vec![PartitionFetchRequest {
            topic_partition: tp.clone(),
            fetch_offset: offset,
            leader_epoch: -1,
            max_bytes: usize::MAX,
        }],
    }
}

async fn wait_until(deadline_ms: u64, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_millis(deadline_ms);
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

fn decode_values(records: &slatemq::MemoryRecords) -> Vec<String> {
    let mut values = Vec::new();
    for batch in records.batches() {
        for record in batch.unwrap().records().unwrap() {
            values.push(String::from_utf8_lossy(&record.value).into_owned());
        }
    }
    values
}

#[tokio::test]
async fn test_two_broker_replication_end_to_end() {
    let dir = tempfile::TempDir::new().unwrap();
    let cluster = Arc::new(Cluster::default());
    let leader = start_broker(&cluster, dir.path(), 0, |_| {}).await;
    let follower = start_broker(&cluster, dir.path(), 1, |_| {}).await;

    let tp = TopicPartition::new("test_topic", 0);
    leader
        .make_leader(&tp, 0, vec![0, 1], vec![0, 1], CleanupPolicy::Delete)
        .unwrap();
    follower
        .make_follower(&tp, 0, 0, CleanupPolicy::Delete)
        .unwrap();

    // acks=all resolves only after the follower holds all four records
    let info = leader
        .append_records(
            &tp,
            batch(&["test1", "test2", "test3", "test4"]),
            AckMode::All,
        )
        .await
        .unwrap();
    assert_eq!(info.first_offset, 0);
    assert_eq!(info.last_offset, 3);

    let leader_partition = leader.get_partition(&tp).unwrap();
    let follower_partition = follower.get_partition(&tp).unwrap();
    assert_eq!(leader_partition.high_watermark(), 4);
    assert!(
        wait_until(5_000, || follower_partition.high_watermark() == 4).await,
        "follower watermark stuck at {}",
        follower_partition.high_watermark()
    );

    // the replicated log is byte for byte the leader's log
    let leader_bytes = leader_partition
        .log()
        .read_records(0, usize::MAX)
        .unwrap()
        .records;
    let follower_bytes = follower_partition
        .log()
        .read_records(0, usize::MAX)
        .unwrap()
        .records;
    assert!(!leader_bytes.is_empty());
    assert_eq!(leader_bytes.buffer(), follower_bytes.buffer());

    // consumers on the leader see all four committed records
    let response = leader.handle_fetch(consumer_fetch(&tp, 0)).await;
    let data = response.partitions[0].result.as_ref().unwrap();
    assert_eq!(
        decode_values(&data.records),
        vec!["test1", "test2", "test3", "test4"]
    );
    assert_eq!(data.high_watermark, 4);
}

#[tokio::test]
async fn test_acks_all_blocked_until_follower_joins() {
    let dir = tempfile::TempDir::new().unwrap();
    let cluster = Arc::new(Cluster::default());
    let leader = start_broker(&cluster, dir.path(), 0, |config| {
        config.replication.min_insync_replicas = 2;
        config.replication.socket_timeout_ms = 1_000;
    })
    .await;
    let follower = start_broker(&cluster, dir.path(), 1, |_| {}).await;

    let tp = TopicPartition::new("critical", 0);
    // the follower is not in sync yet
    leader
        .make_leader(&tp, 0, vec![0, 1], vec![0], CleanupPolicy::Delete)
        .unwrap();

    let err = leader
        .append_records(&tp, batch(&["lost?"]), AckMode::All)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::InsufficientReplicas { .. }));

    follower
        .make_follower(&tp, 0, 0, CleanupPolicy::Delete)
        .unwrap();
    let leader_partition = leader.get_partition(&tp).unwrap();
    assert!(
        wait_until(5_000, || leader_partition.isr().len() == 2).await,
        "follower never joined the isr: {:?}",
        leader_partition.isr()
    );

    leader
        .append_records(&tp, batch(&["durable"]), AckMode::All)
        .await
        .unwrap();
    assert!(leader_partition.high_watermark() >= 1);
}

#[tokio::test]
async fn test_leadership_moves_with_epoch_fencing() {
    let dir = tempfile::TempDir::new().unwrap();
    let cluster = Arc::new(Cluster::default());
    let broker0 = start_broker(&cluster, dir.path(), 0, |_| {}).await;
    let broker1 = start_broker(&cluster, dir.path(), 1, |_| {}).await;

    let tp = TopicPartition::new("handover", 0);
    broker0
        .make_leader(&tp, 0, vec![0, 1], vec![0, 1], CleanupPolicy::Delete)
        .unwrap();
    broker1
        .make_follower(&tp, 0, 0, CleanupPolicy::Delete)
        .unwrap();

    broker0
        .append_records(&tp, batch(&["before", "failover"]), AckMode::All)
        .await
        .unwrap();

    // hand leadership to broker 1 at the next epoch
    broker1
        .make_leader(&tp, 1, vec![0, 1], vec![0, 1], CleanupPolicy::Delete)
        .unwrap();
    broker0
        .make_follower(&tp, 1, 1, CleanupPolicy::Delete)
        .unwrap();

    // the demoted broker rejects appends and old-epoch fetches
    let err = broker0
        .append_records(&tp, batch(&["stale"]), AckMode::Leader)
        .await
        .unwrap_err();
    assert!(err.is_fencing());

    broker1
        .append_records(&tp, batch(&["after"]), AckMode::All)
        .await
        .unwrap();

    let old_leader_log = broker0.get_partition(&tp).unwrap().log().clone();
    assert!(
        wait_until(5_000, || old_leader_log.next_offset() == 3).await,
        "old leader never replicated from the new one, log end {}",
        old_leader_log.next_offset()
    );

    let response = broker1.handle_fetch(consumer_fetch(&tp, 0)).await;
    let data = response.partitions[0].result.as_ref().unwrap();
    assert_eq!(decode_values(&data.records), vec!["before", "failover", "after"]);
}

#[tokio::test]
async fn test_replication_quota_shapes_not_rejects() {
    let dir = tempfile::TempDir::new().unwrap();
    let cluster = Arc::new(Cluster::default());
    let leader = start_broker(&cluster, dir.path(), 0, |config| {
        // ~5 KB/s serve rate against ~6 KB of data
        config.quota.leader_replication_rate = 5_000;
        config.quota.window_size_ms = 100;
        config.quota.window_num = 11;
    })
    .await;
    let follower = start_broker(&cluster, dir.path(), 1, |_| {}).await;

    let tp = TopicPartition::new("throttled", 0);
    leader
        .make_leader(&tp, 0, vec![0, 1], vec![0, 1], CleanupPolicy::Delete)
        .unwrap();
    follower
        .make_follower(&tp, 0, 0, CleanupPolicy::Delete)
        .unwrap();

    let payload = "x".repeat(1500);
    let values: Vec<&str> = std::iter::repeat(payload.as_str()).take(4).collect();
    let info = leader
        .append_records(&tp, batch(&values), AckMode::Leader)
        .await
        .unwrap();
    assert_eq!(info.last_offset, 3);

    let started = Instant::now();
    let follower_log = follower.get_partition(&tp).unwrap().log().clone();
    assert!(
        wait_until(10_000, || follower_log.next_offset() == 4).await,
        "throttled follower never converged, log end {}",
        follower_log.next_offset()
    );
    // over quota: the transfer was delayed, never refused
    assert!(
        started.elapsed() >= Duration::from_millis(100),
        "transfer finished implausibly fast for the configured rate"
    );
}
