// Copyright 2025 the slatemq authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Broker-wide replication coordinator: owns every replica this broker
//! hosts, serves fetches, applies leadership changes from the controller,
//! and runs the ISR maintenance and watermark checkpoint tasks.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, Notify};
use tokio::time::{interval, Instant};
use tracing::{debug, error, info, warn};

use crate::log::{CheckPointFile, CleanupPolicy, LogManager, HW_CHECKPOINT_FILE_NAME};
use crate::message::{MemoryRecords, TopicPartition};
use crate::quota::{QuotaDirection, QuotaManager};
use crate::replica::fetcher::ReplicaFetcherManager;
use crate::replica::partition::{AckMode, Partition, PartitionStatus};
use crate::replica::{FetchRequest, FetchResponse, FetchTransport, PartitionFetchResponse};
use crate::service::Shutdown;
use crate::utils::KvStore;
use crate::{AppError, AppResult, BrokerConfig, LogAppendInfo};

/// Durable per-partition replication metadata, surviving restarts so a
/// newly elected leader knows the last committed ISR.
#[derive(Debug, Serialize, Deserialize)]
struct IsrRecord {
    leader_epoch: i32,
    isr: Vec<i32>,
}

pub struct ReplicaManager {
    broker_id: i32,
    config: Arc<BrokerConfig>,
    log_manager: Arc<LogManager>,
    partitions: Arc<DashMap<TopicPartition, Arc<Partition>>>,
    fetchers: Arc<ReplicaFetcherManager>,
    quota: Arc<QuotaManager>,
    isr_store: KvStore,
    hw_checkpoint: CheckPointFile,
    /// Watermarks read from the checkpoint at startup, applied as
    /// partitions are created.
    initial_watermarks: HashMap<TopicPartition, i64>,
    /// Rung whenever any local partition gains data or advances its
    /// watermark; parked fetches wait on it.
    data_arrived: Arc<Notify>,
    notify_shutdown: broadcast::Sender<()>,
    shutdown_complete_tx: mpsc::Sender<()>,
}

impl ReplicaManager {
    pub async fn new(
        config: Arc<BrokerConfig>,
        log_manager: Arc<LogManager>,
        transport: Arc<dyn FetchTransport>,
        notify_shutdown: broadcast::Sender<()>,
        shutdown_complete_tx: mpsc::Sender<()>,
    ) -> AppResult<Arc<Self>> {
        let broker_id = config.general.id;
        let quota = Arc::new(QuotaManager::new(config.quota.clone()));
        let isr_store = KvStore::open(&config.general.metadata_db_path)?;
        let hw_checkpoint = CheckPointFile::new(
            Path::new(&config.general.data_dir).join(HW_CHECKPOINT_FILE_NAME),
        );
        let initial_watermarks = hw_checkpoint.read_checkpoints().await?;
        let fetchers = ReplicaFetcherManager::new(
            broker_id,
            config.replication.clone(),
            transport,
            quota.clone(),
            notify_shutdown.clone(),
        );

        let partitions: Arc<DashMap<TopicPartition, Arc<Partition>>> = Arc::new(DashMap::new());
        // retention must never reclaim a segment holding committed offsets
        let retention_partitions = partitions.clone();
        log_manager.set_min_retained_offset_fn(Arc::new(move |tp| {
            retention_partitions.get(tp).map(|p| p.high_watermark())
        }));

        info!(
            "replica manager for broker {} starting with {} checkpointed watermarks",
            broker_id,
            initial_watermarks.len()
        );
        Ok(Arc::new(Self {
            broker_id,
            config,
            log_manager,
            partitions,
            fetchers,
            quota,
            isr_store,
            hw_checkpoint,
            initial_watermarks,
            data_arrived: Arc::new(Notify::new()),
            notify_shutdown,
            shutdown_complete_tx,
        }))
    }

    pub fn broker_id(&self) -> i32 {
        self.broker_id
    }

    pub fn quota(&self) -> &Arc<QuotaManager> {
        &self.quota
    }

    fn get_or_create_partition(
        &self,
        topic_partition: &TopicPartition,
        cleanup_policy: CleanupPolicy,
    ) -> AppResult<Arc<Partition>> {
        match self.partitions.entry(topic_partition.clone()) {
            Entry::Occupied(entry) => Ok(entry.get().clone()),
            Entry::Vacant(entry) => {
                let log = self
                    .log_manager
                    .get_or_create_log(topic_partition, cleanup_policy)?;
                let initial_hw = self
                    .initial_watermarks
                    .get(topic_partition)
                    .copied()
                    .unwrap_or(0);
                let partition = Arc::new(Partition::new(
                    topic_partition.clone(),
                    self.broker_id,
                    log,
                    self.config.replication.clone(),
                    initial_hw,
                    self.data_arrived.clone(),
                ));
                entry.insert(partition.clone());
                Ok(partition)
            }
        }
    }

    pub fn get_partition(&self, topic_partition: &TopicPartition) -> Option<Arc<Partition>> {
        self.partitions.get(topic_partition).map(|p| p.clone())
    }

    /// Takes leadership of a partition at `leader_epoch`. When this broker
    /// was outside the last committed ISR the election would lose records,
    /// so it is refused unless unclean election is enabled.
    pub fn make_leader(
        &self,
        topic_partition: &TopicPartition,
        leader_epoch: i32,
        assignment: Vec<i32>,
        isr: Vec<i32>,
        cleanup_policy: CleanupPolicy,
    ) -> AppResult<()> {
        if let Some(stored) = self.stored_isr(topic_partition) {
            let was_in_sync = stored.isr.is_empty() || stored.isr.contains(&self.broker_id);
            if !was_in_sync && !self.config.replication.unclean_leader_election_enable {
                warn!(
                    "{}: refusing leadership, broker {} was not in the last committed isr {:?}",
                    topic_partition, self.broker_id, stored.isr
                );
                return Err(AppError::InsufficientReplicas {
                    partition: topic_partition.id(),
                    isr_size: 0,
                    min_required: 1,
                });
            }
        }

        let partition = self.get_or_create_partition(topic_partition, cleanup_policy)?;
        partition.make_leader(leader_epoch, assignment, isr)?;
        self.fetchers.remove_partition(topic_partition);
        partition.take_isr_dirty();
        self.persist_isr(&partition)?;
        partition.on_isr_persisted();
        Ok(())
    }

    /// Demotes a partition to follower of `leader` and starts fetching from
    /// the local log end offset.
    pub fn make_follower(
        &self,
        topic_partition: &TopicPartition,
        leader_epoch: i32,
        leader: i32,
        cleanup_policy: CleanupPolicy,
    ) -> AppResult<()> {
        let partition = self.get_or_create_partition(topic_partition, cleanup_policy)?;
        partition.make_follower(leader_epoch, leader)?;
        self.fetchers.remove_partition(topic_partition);
        let fetch_offset = partition.log().next_offset();
        self.fetchers
            .add_partition(leader, partition.clone(), fetch_offset);
        Ok(())
    }

    /// Leader-side produce entry point.
    pub async fn append_records(
        &self,
        topic_partition: &TopicPartition,
        records: MemoryRecords,
        ack: AckMode,
    ) -> AppResult<LogAppendInfo> {
        let partition = self.get_partition(topic_partition).ok_or_else(|| {
            AppError::NotLeader {
                partition: topic_partition.id(),
                broker: -1,
            }
        })?;
        partition.append_records(records, ack).await
    }

    /// Serves a fetch from a follower or a consumer. The response is parked
    /// until `min_bytes` accumulate or `max_wait_ms` pass; any per-partition
    /// error releases it immediately so fencing reaches followers fast.
    pub async fn handle_fetch(&self, request: FetchRequest) -> FetchResponse {
        let deadline = Instant::now() + Duration::from_millis(request.max_wait_ms);
        loop {
            let (partitions, total_bytes, any_error) = self.collect_fetch(&request);
            let now = Instant::now();
            if total_bytes >= request.min_bytes || any_error || now >= deadline {
                // only replication traffic is shaped; consumer reads are
                // outside the quota
                if request.source_broker >= 0 {
                    let client = format!("broker-{}", request.source_broker);
                    self.quota
                        .limiter(QuotaDirection::ServeFetch, Some(&client))
                        .throttle(total_bytes as u64)
                        .await;
                }
                return FetchResponse { partitions };
            }
            let _ = tokio::time::timeout(deadline - now, self.data_arrived.notified()).await;
        }
    }

    fn collect_fetch(
        &self,
        request: &FetchRequest,
    ) -> (Vec<PartitionFetchResponse>, usize, bool) {
        let mut total_bytes = 0usize;
        let mut any_error = false;
        let partitions = request
            .partitions
            .iter()
            .map(|p| {
                let result = match self.get_partition(&p.topic_partition) {
                    Some(partition) => partition.fetch_records(p, request.source_broker),
                    None => Err(AppError::NotLeader {
                        partition: p.topic_partition.id(),
                        broker: -1,
                    }),
                };
                match &result {
                    Ok(data) => total_bytes += data.records.size(),
                    Err(_) => any_error = true,
                }
                PartitionFetchResponse {
                    topic_partition: p.topic_partition.clone(),
                    result,
                }
            })
            .collect();
        (partitions, total_bytes, any_error)
    }

    /// Replication state of every hosted partition, for lag monitoring.
    pub fn partition_statuses(&self) -> Vec<PartitionStatus> {
        self.partitions
            .iter()
            .map(|entry| entry.value().status())
            .collect()
    }

    /// Spawns the ISR maintenance and watermark checkpoint tasks.
    pub fn start_background_tasks(self: &Arc<Self>) {
        let manager = self.clone();
        let shutdown = Shutdown::new(self.notify_shutdown.subscribe());
        let shutdown_complete = self.shutdown_complete_tx.clone();
        tokio::spawn(async move {
            manager.isr_maintenance_task(shutdown).await;
            drop(shutdown_complete);
        });

        let manager = self.clone();
        let shutdown = Shutdown::new(self.notify_shutdown.subscribe());
        let shutdown_complete = self.shutdown_complete_tx.clone();
        tokio::spawn(async move {
            manager.watermark_checkpoint_task(shutdown).await;
            drop(shutdown_complete);
        });
    }

    /// Periodically evicts laggards from ISRs and persists any membership
    /// change, whether from a shrink here or an expand on the fetch path.
    /// A shrink is written to the metadata store before the watermark may
    /// advance over the narrowed set; a failed write is retried next tick
    /// with the watermark still held back.
    async fn isr_maintenance_task(&self, mut shutdown: Shutdown) {
        let period = (self.config.replication.lag_time_max_ms / 2).max(1);
        let mut ticker = interval(Duration::from_millis(period));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    for entry in self.partitions.iter() {
                        let partition = entry.value();
                        partition.maybe_shrink_isr();
                        if !partition.take_isr_dirty() {
                            continue;
                        }
                        match self.persist_isr(partition) {
                            Ok(()) => partition.on_isr_persisted(),
                            Err(e) => {
                                warn!("{}: failed to persist isr: {}", entry.key(), e);
                                partition.mark_isr_dirty();
                            }
                        }
                    }
                }
                _ = shutdown.recv() => {
                    info!("isr maintenance task shutting down");
                    return;
                }
            }
        }
    }

    async fn watermark_checkpoint_task(&self, mut shutdown: Shutdown) {
        let mut ticker = interval(Duration::from_millis(
            self.config.log.high_watermark_checkpoint_interval_ms,
        ));
        while !shutdown.is_shutdown() {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.checkpoint_watermarks().await {
                        warn!("watermark checkpoint write failed: {}", e);
                    }
                }
                _ = shutdown.recv() => {
                    info!("watermark checkpoint task shutting down");
                    if let Err(e) = self.checkpoint_watermarks().await {
                        error!("final watermark checkpoint write failed: {}", e);
                    }
                }
            }
        }
    }

    /// Writes every partition's high watermark to the checkpoint file.
    pub async fn checkpoint_watermarks(&self) -> AppResult<()> {
        let watermarks: HashMap<TopicPartition, i64> = self
            .partitions
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().high_watermark()))
            .collect();
        debug!("writing {} watermark checkpoints", watermarks.len());
        self.hw_checkpoint.write_checkpoints(watermarks).await
    }

    fn persist_isr(&self, partition: &Partition) -> AppResult<()> {
        let record = IsrRecord {
            leader_epoch: partition.leader_epoch(),
            isr: partition.isr(),
        };
        let json = serde_json::to_string(&record).map_err(|e| {
            AppError::InvalidValue(format!("isr record encode: {}", e))
        })?;
        self.isr_store
            .put(partition.topic_partition().id(), json)
    }

    fn stored_isr(&self, topic_partition: &TopicPartition) -> Option<IsrRecord> {
        let json = self.isr_store.get(&topic_partition.id())?;
        match serde_json::from_str(&json) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!("{}: unreadable isr record, ignoring: {}", topic_partition, e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::RecordBatchBuilder;
    use crate::log::now_ms;
    use crate::replica::{PartitionFetchRequest, CONSUMER_REPLICA_ID};
    use async_trait::async_trait;
    use tempfile::TempDir;

    /// Transport for brokers that never issue fetches in a test.
    struct NullTransport;

    #[async_trait]
    impl FetchTransport for NullTransport {
        async fn fetch(&self, leader: i32, _request: FetchRequest) -> AppResult<FetchResponse> {
            Err(AppError::DetailedIoError(format!(
                "no route to broker {}",
                leader
            )))
        }
    }

    fn test_config(dir: &TempDir, broker_id: i32) -> Arc<BrokerConfig> {
        let mut config = BrokerConfig::default();
        config.general.id = broker_id;
        config.general.data_dir = dir
            .path()
            .join(format!("broker-{}", broker_id))
            .to_string_lossy()
            .into_owned();
        config.general.metadata_db_path = dir
            .path()
            .join(format!("broker-{}-meta.json", broker_id))
            .to_string_lossy()
            .into_owned();
        config.log.index_file_size = 1024;
        config.log.index_interval_bytes = 1;
        config.replication.fetch_wait_max_ms = 100;
        config.replication.socket_timeout_ms = 500;
        config.replication.lag_time_max_ms = 1_000;
        Arc::new(config)
    }

    async fn new_manager(config: Arc<BrokerConfig>) -> Arc<ReplicaManager> {
        let (notify_shutdown, _) = broadcast::channel(1);
        let (shutdown_complete_tx, _) = mpsc::channel(1);
        let log_manager = LogManager::new(
            config.clone(),
            notify_shutdown.clone(),
            shutdown_complete_tx.clone(),
        )
        .await
        .unwrap();
        ReplicaManager::new(
            config,
            log_manager,
            Arc::new(NullTransport),
            notify_shutdown,
            shutdown_complete_tx,
        )
        .await
        .unwrap()
    }

    fn batch(values: &[&str]) -> MemoryRecords {
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

    #[tokio::test]
    async fn test_produce_and_consume_through_manager() {
        let dir = TempDir::new().unwrap();
        let manager = new_manager(test_config(&dir, 0)).await;
        let tp = TopicPartition::new("orders", 0);
        manager
            .make_leader(&tp, 0, vec![0], vec![0], CleanupPolicy::Delete)
            .unwrap();

        let info = manager
            .append_records(&tp, batch(&["a", "b"]), AckMode::All)
            .await
            .unwrap();
        assert_eq!(info.last_offset, 1);

        let response = manager.handle_fetch(consumer_fetch(&tp, 0)).await;
        let data = response.partitions[0].result.as_ref().unwrap();
        assert_eq!(data.records.next_offset(), Some(2));
        assert_eq!(data.high_watermark, 2);
    }

    #[tokio::test]
    async fn test_fetch_parks_until_data_arrives() {
        let dir = TempDir::new().unwrap();
        let manager = new_manager(test_config(&dir, 0)).await;
        let tp = TopicPartition::new("orders", 1);
        manager
            .make_leader(&tp, 0, vec![0], vec![0], CleanupPolicy::Delete)
            .unwrap();

        let fetching = {
            let manager = manager.clone();
            let tp = tp.clone();
            tokio::spawn(async move {
                let request = FetchRequest {
                    min_bytes: 1,
                    max_wait_ms: 2_000,
                    ..consumer_fetch(&tp, 0)
                };
                manager.handle_fetch(request).await
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        manager
            .append_records(&tp, batch(&["wake"]), AckMode::Leader)
            .await
            .unwrap();

        let response = fetching.await.unwrap();
        let data = response.partitions[0].result.as_ref().unwrap();
        assert_eq!(data.records.next_offset(), Some(1));
    }

    #[tokio::test]
    async fn test_shrink_is_durable_before_watermark_advances() {
        let dir = TempDir::new().unwrap();
        let mut config = (*test_config(&dir, 0)).clone();
        config.replication.lag_time_max_ms = 100;
        config.replication.socket_timeout_ms = 50;
        config.replication.fetch_wait_max_ms = 10;
        let manager = new_manager(Arc::new(config)).await;
        manager.start_background_tasks();

        let tp = TopicPartition::new("orders", 6);
        manager
            .make_leader(&tp, 0, vec![0, 1], vec![0, 1], CleanupPolicy::Delete)
            .unwrap();
        manager
            .append_records(&tp, batch(&["a"]), AckMode::Leader)
            .await
            .unwrap();
        let partition = manager.get_partition(&tp).unwrap();
        assert_eq!(partition.high_watermark(), 0);

        // the maintenance task evicts the silent follower, persists the
        // shrink and only then lets the watermark move
        let deadline = Instant::now() + Duration::from_millis(2_000);
        while partition.high_watermark() < 1 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(partition.high_watermark(), 1);
        assert_eq!(partition.isr(), vec![0]);
        let stored = manager.stored_isr(&tp).unwrap();
        assert_eq!(stored.isr, vec![0]);
    }

    #[tokio::test]
    async fn test_consumer_fetch_outside_replication_quota() {
        let dir = TempDir::new().unwrap();
        let mut config = (*test_config(&dir, 0)).clone();
        // a rate this low would shape any counted fetch for seconds
        config.quota.leader_replication_rate = 1;
        let manager = new_manager(Arc::new(config)).await;
        let tp = TopicPartition::new("orders", 7);
        manager
            .make_leader(&tp, 0, vec![0], vec![0], CleanupPolicy::Delete)
            .unwrap();
        manager
            .append_records(&tp, batch(&["a", "b", "c"]), AckMode::All)
            .await
            .unwrap();

        let response = tokio::time::timeout(
            Duration::from_millis(500),
            manager.handle_fetch(consumer_fetch(&tp, 0)),
        )
        .await
        .expect("consumer fetch must not be shaped by the replication quota");
        let data = response.partitions[0].result.as_ref().unwrap();
        assert_eq!(data.records.next_offset(), Some(3));
    }

    #[tokio::test]
    async fn test_unclean_election_refused_by_default() {
        let dir = TempDir::new().unwrap();
        let manager = new_manager(test_config(&dir, 3)).await;
        let tp = TopicPartition::new("orders", 2);
        // the last committed ISR does not include this broker
        manager
            .isr_store
            .put(tp.id(), r#"{"leader_epoch":4,"isr":[1,2]}"#)
            .unwrap();

        let err = manager
            .make_leader(&tp, 5, vec![1, 2, 3], vec![3], CleanupPolicy::Delete)
            .unwrap_err();
        assert!(matches!(err, AppError::InsufficientReplicas { .. }));
        assert!(manager.get_partition(&tp).is_none());
    }

    #[tokio::test]
    async fn test_unclean_election_allowed_when_enabled() {
        let dir = TempDir::new().unwrap();
        let mut config = (*test_config(&dir, 3)).clone();
        config.replication.unclean_leader_election_enable = true;
        let manager = new_manager(Arc::new(config)).await;
        let tp = TopicPartition::new("orders", 3);
        manager
            .isr_store
            .put(tp.id(), r#"{"leader_epoch":4,"isr":[1,2]}"#)
            .unwrap();

        manager
            .make_leader(&tp, 5, vec![1, 2, 3], vec![3], CleanupPolicy::Delete)
            .unwrap();
        assert!(manager.get_partition(&tp).unwrap().is_leader());
    }

    #[tokio::test]
    async fn test_isr_persisted_on_leadership() {
        let dir = TempDir::new().unwrap();
        let manager = new_manager(test_config(&dir, 0)).await;
        let tp = TopicPartition::new("orders", 4);
        manager
            .make_leader(&tp, 2, vec![0, 1], vec![0, 1], CleanupPolicy::Delete)
            .unwrap();

        let stored = manager.stored_isr(&tp).unwrap();
        assert_eq!(stored.leader_epoch, 2);
        assert_eq!(stored.isr, vec![0, 1]);
    }

    #[tokio::test]
    async fn test_watermark_checkpoint_round_trip() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir, 0);
        let tp = TopicPartition::new("orders", 5);
        {
            let manager = new_manager(config.clone()).await;
            manager
                .make_leader(&tp, 0, vec![0], vec![0], CleanupPolicy::Delete)
                .unwrap();
            manager
                .append_records(&tp, batch(&["a", "b", "c"]), AckMode::All)
                .await
                .unwrap();
            manager.log_manager.flush_all().unwrap();
            manager.checkpoint_watermarks().await.unwrap();
        }

        let manager = new_manager(config).await;
        manager
            .make_leader(&tp, 1, vec![0], vec![0], CleanupPolicy::Delete)
            .unwrap();
        assert_eq!(manager.get_partition(&tp).unwrap().high_watermark(), 3);
    }
}
