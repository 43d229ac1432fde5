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

//! Follower-side replication: one fetch loop per source leader, pulling
//! records for every partition this broker follows there.
//!
//! Fetches retry indefinitely. Transport failures back off the whole loop;
//! per-partition errors back off or (for fencing errors) remove just that
//! partition, leaving the rest of the loop unaffected.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::log::now_ms;
use crate::message::TopicPartition;
use crate::quota::{QuotaDirection, QuotaManager};
use crate::replica::partition::Partition;
use crate::replica::{FetchRequest, FetchTransport, PartitionFetchRequest, PartitionFetchResponse};
use crate::service::Shutdown;
use crate::{AppError, ReplicationConfig};

struct FetchPosition {
    partition: Arc<Partition>,
    fetch_offset: i64,
    /// Partition-level backoff after a failed fetch; 0 when active.
    delay_until_ms: i64,
}

struct FetcherState {
    partitions: DashMap<TopicPartition, FetchPosition>,
}

pub struct ReplicaFetcherManager {
    broker_id: i32,
    config: ReplicationConfig,
    transport: Arc<dyn FetchTransport>,
    quota: Arc<QuotaManager>,
    fetchers: DashMap<i32, Arc<FetcherState>>,
    notify_shutdown: broadcast::Sender<()>,
}

impl ReplicaFetcherManager {
    pub fn new(
        broker_id: i32,
        config: ReplicationConfig,
        transport: Arc<dyn FetchTransport>,
        quota: Arc<QuotaManager>,
        notify_shutdown: broadcast::Sender<()>,
    ) -> Arc<Self> {
        Arc::new(Self {
            broker_id,
            config,
            transport,
            quota,
            fetchers: DashMap::new(),
            notify_shutdown,
        })
    }

    /// Starts (or joins) the fetch loop for `leader` and begins pulling the
    /// partition from `fetch_offset`.
    pub fn add_partition(
        self: &Arc<Self>,
        leader: i32,
        partition: Arc<Partition>,
        fetch_offset: i64,
    ) {
        let topic_partition = partition.topic_partition().clone();
        let state = self
            .fetchers
            .entry(leader)
            .or_insert_with(|| {
                let state = Arc::new(FetcherState {
                    partitions: DashMap::new(),
                });
                self.spawn_fetch_loop(leader, state.clone());
                state
            })
            .clone();
        info!(
            "broker {}: fetching {} from leader {} starting at {}",
            self.broker_id, topic_partition, leader, fetch_offset
        );
        state.partitions.insert(
            topic_partition,
            FetchPosition {
                partition,
                fetch_offset,
                delay_until_ms: 0,
            },
        );
    }

    /// Stops replicating the partition, wherever it is being fetched from.
    pub fn remove_partition(&self, topic_partition: &TopicPartition) {
        for entry in self.fetchers.iter() {
            entry.value().partitions.remove(topic_partition);
        }
    }

    fn spawn_fetch_loop(self: &Arc<Self>, leader: i32, state: Arc<FetcherState>) {
        let manager = self.clone();
        let mut shutdown = Shutdown::new(self.notify_shutdown.subscribe());
        tokio::spawn(async move {
            info!("replica fetcher for leader {} started", leader);
            loop {
                tokio::select! {
                    _ = manager.fetch_once(leader, &state) => {}
                    _ = shutdown.recv() => {
                        info!("replica fetcher for leader {} shutting down", leader);
                        return;
                    }
                }
            }
        });
    }

    async fn fetch_once(&self, leader: i32, state: &FetcherState) {
        let backoff = Duration::from_millis(self.config.fetch_backoff_ms);
        let now = now_ms();
        let partitions: Vec<PartitionFetchRequest> = state
            .partitions
            .iter()
            .filter(|entry| entry.value().delay_until_ms <= now)
            .map(|entry| PartitionFetchRequest {
                topic_partition: entry.key().clone(),
                fetch_offset: entry.value().fetch_offset,
                leader_epoch: entry.value().partition.leader_epoch(),
                max_bytes: self.config.fetch_max_bytes,
            })
            .collect();
        if partitions.is_empty() {
            tokio::time::sleep(backoff).await;
            return;
        }

        let request = FetchRequest {
            source_broker: self.broker_id,
            max_wait_ms: self.config.fetch_wait_max_ms,
            min_bytes: self.config.fetch_min_bytes,
            partitions,
        };
        let response = tokio::time::timeout(
            Duration::from_millis(self.config.socket_timeout_ms),
            self.transport.fetch(leader, request),
        )
        .await;

        let response = match response {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                warn!("fetch to leader {} failed: {}, backing off", leader, e);
                tokio::time::sleep(backoff).await;
                return;
            }
            Err(_) => {
                warn!("fetch to leader {} timed out, backing off", leader);
                tokio::time::sleep(backoff).await;
                return;
            }
        };

        let mut total_bytes = 0u64;
        for partition_response in response.partitions {
            total_bytes += self.apply_partition_response(state, partition_response);
        }
        // inbound replication traffic counts against the follower quota
        self.quota
            .limiter(QuotaDirection::IssueFetch, None)
            .throttle(total_bytes)
            .await;
        if total_bytes == 0 {
            // leader had nothing for us; do not spin
            tokio::time::sleep(Duration::from_millis(self.config.fetch_wait_max_ms)).await;
        }
    }

    /// Applies one partition's slice of a fetch response. Returns the bytes
    /// appended, for quota accounting.
    fn apply_partition_response(
        &self,
        state: &FetcherState,
        response: PartitionFetchResponse,
    ) -> u64 {
        let topic_partition = response.topic_partition;
        match response.result {
            Ok(data) => {
                let bytes = data.records.size() as u64;
                if let Some(mut position) = state.partitions.get_mut(&topic_partition) {
                    if !data.records.is_empty() {
                        match position.partition.append_replicated(data.records) {
                            Ok(info) => position.fetch_offset = info.last_offset + 1,
                            Err(e) => {
                                warn!(
                                    "{}: failed to append replicated records: {}",
                                    topic_partition, e
                                );
                                position.delay_until_ms =
                                    now_ms() + self.config.fetch_backoff_ms as i64;
                                return 0;
                            }
                        }
                    }
                    position
                        .partition
                        .record_leader_high_watermark(data.high_watermark);
                }
                bytes
            }
            Err(e) if e.is_fencing() => {
                info!(
                    "{}: fetch fenced by leader ({}), dropping from fetcher",
                    topic_partition, e
                );
                state.partitions.remove(&topic_partition);
                0
            }
            Err(AppError::OffsetOutOfRange { start, end, .. }) => {
                if let Some(mut position) = state.partitions.get_mut(&topic_partition) {
                    let outcome = if position.fetch_offset > end {
                        // local log runs past the new leader's: drop the
                        // divergent tail and resume at the leader log end
                        warn!(
                            "{}: local log end {} is past the leader's {}, truncating",
                            topic_partition, position.fetch_offset, end
                        );
                        position.partition.log().truncate_to(end)
                    } else {
                        // fell behind the leader's retention: restart the
                        // log at the leader's start offset
                        warn!(
                            "{}: fetch offset {} below leader log start {}, restarting there",
                            topic_partition, position.fetch_offset, start
                        );
                        position
                            .partition
                            .log()
                            .truncate_fully_and_start_at(start)
                            .map(|()| start)
                    };
                    match outcome {
                        Ok(next) => position.fetch_offset = next,
                        Err(e) => {
                            warn!("{}: truncation failed: {}", topic_partition, e);
                            position.delay_until_ms =
                                now_ms() + self.config.fetch_backoff_ms as i64;
                        }
                    }
                }
                0
            }
            Err(e) => {
                warn!("{}: partition fetch failed: {}", topic_partition, e);
                if let Some(mut position) = state.partitions.get_mut(&topic_partition) {
                    position.delay_until_ms = now_ms() + self.config.fetch_backoff_ms as i64;
                }
                0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::{CleanupPolicy, PartitionLog};
    use crate::message::RecordBatchBuilder;
    use crate::replica::{AckMode, FetchResponse};
    use crate::{AppResult, LogConfig, QuotaConfig};
    use async_trait::async_trait;
    use tempfile::TempDir;
    use tokio::sync::Notify;

    /// Serves fetches straight from a leader partition in process.
    struct LoopbackTransport {
        leader: Arc<Partition>,
    }

    #[async_trait]
    impl FetchTransport for LoopbackTransport {
        async fn fetch(&self, _leader: i32, request: FetchRequest) -> AppResult<FetchResponse> {
            let partitions = request
                .partitions
                .iter()
                .map(|p| PartitionFetchResponse {
                    topic_partition: p.topic_partition.clone(),
                    result: self.leader.fetch_records(p, request.source_broker),
                })
                .collect();
            Ok(FetchResponse { partitions })
        }
    }

    fn open_partition(dir: &TempDir, broker: i32) -> Arc<Partition> {
        let tp = TopicPartition::new("mirrored", 0);
        let log = Arc::new(
            PartitionLog::open(
                tp.clone(),
                dir.path().join(format!("broker-{}", broker)),
                LogConfig {
                    index_file_size: 1024,
                    index_interval_bytes: 1,
                    ..Default::default()
                },
                CleanupPolicy::Delete,
                -1,
            )
            .unwrap(),
        );
        Arc::new(Partition::new(
            tp,
            broker,
            log,
            test_replication_config(),
            0,
            Arc::new(Notify::new()),
        ))
    }

    fn test_replication_config() -> ReplicationConfig {
        ReplicationConfig {
            fetch_wait_max_ms: 10,
            fetch_backoff_ms: 10,
            socket_timeout_ms: 500,
            lag_time_max_ms: 1_000,
            ..Default::default()
        }
    }

    async fn wait_until(deadline_ms: u64, mut check: impl FnMut() -> bool) -> bool {
        let deadline = tokio::time::Instant::now() + Duration::from_millis(deadline_ms);
        while tokio::time::Instant::now() < deadline {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        check()
    }

    #[tokio::test]
    async fn test_follower_replicates_leader_records() {
        let dir = TempDir::new().unwrap();
        let leader = open_partition(&dir, 0);
        leader.make_leader(0, vec![0, 1], vec![0, 1]).unwrap();
        let follower = open_partition(&dir, 1);
        follower.make_follower(0, 0).unwrap();

        let mut builder = RecordBatchBuilder::default();
        for value in ["test1", "test2", "test3", "test4"] {
            builder.append_record(None, value.as_bytes(), now_ms());
        }
        leader
            .append_records(builder.build(), AckMode::Leader)
            .await
            .unwrap();

        let (notify_shutdown, _) = broadcast::channel(1);
        let fetchers = ReplicaFetcherManager::new(
            1,
            test_replication_config(),
            Arc::new(LoopbackTransport {
                leader: leader.clone(),
            }),
            Arc::new(QuotaManager::new(QuotaConfig::default())),
            notify_shutdown.clone(),
        );
        fetchers.add_partition(0, follower.clone(), 0);

        let follower_log = follower.log().clone();
        assert!(
            wait_until(2_000, || follower_log.next_offset() == 4).await,
            "follower never caught up, log end {}",
            follower_log.next_offset()
        );

        // watermark propagates to the follower once the leader commits
        assert!(wait_until(2_000, || follower.high_watermark() == 4).await);
        assert_eq!(leader.high_watermark(), 4);

        // byte-level identical logs
        let leader_bytes = leader.log().read_records(0, usize::MAX).unwrap().records;
        let follower_bytes = follower_log.read_records(0, usize::MAX).unwrap().records;
        assert_eq!(leader_bytes.buffer(), follower_bytes.buffer());

        drop(notify_shutdown);
    }

    #[tokio::test]
    async fn test_diverged_follower_truncates_and_converges() {
        let dir = TempDir::new().unwrap();
        let leader = open_partition(&dir, 0);
        leader.make_leader(1, vec![0, 1], vec![0, 1]).unwrap();
        let mut builder = RecordBatchBuilder::default();
        builder.append_record(None, b"committed", now_ms());
        leader
            .append_records(builder.build(), AckMode::Leader)
            .await
            .unwrap();

        // the follower is a deposed leader carrying an uncommitted tail
        let follower = open_partition(&dir, 1);
        for value in ["committed", "lost1", "lost2"] {
            let mut builder = RecordBatchBuilder::default();
            builder.append_record(None, value.as_bytes(), now_ms());
            follower.log().append_records(builder.build()).unwrap();
        }
        follower.make_follower(1, 0).unwrap();
        assert_eq!(follower.log().next_offset(), 3);

        let (notify_shutdown, _) = broadcast::channel(1);
        let fetchers = ReplicaFetcherManager::new(
            1,
            test_replication_config(),
            Arc::new(LoopbackTransport {
                leader: leader.clone(),
            }),
            Arc::new(QuotaManager::new(QuotaConfig::default())),
            notify_shutdown.clone(),
        );
        fetchers.add_partition(0, follower.clone(), follower.log().next_offset());

        // the tail past the leader log end is dropped instead of wedging
        // the fetch loop
        let follower_log = follower.log().clone();
        assert!(
            wait_until(2_000, || follower_log.next_offset() == 1).await,
            "follower never truncated, log end {}",
            follower_log.next_offset()
        );

        // replication resumes: new leader records land at the cut
        let mut builder = RecordBatchBuilder::default();
        builder.append_record(None, b"after", now_ms());
        builder.append_record(None, b"failover", now_ms());
        leader
            .append_records(builder.build(), AckMode::Leader)
            .await
            .unwrap();
        assert!(
            wait_until(2_000, || follower_log.next_offset() == 3).await,
            "follower never converged, log end {}",
            follower_log.next_offset()
        );

        drop(notify_shutdown);
    }

    #[tokio::test]
    async fn test_fenced_partition_is_dropped_from_fetcher() {
        let dir = TempDir::new().unwrap();
        let leader = open_partition(&dir, 0);
        leader.make_leader(5, vec![0, 1], vec![0, 1]).unwrap();
        let follower = open_partition(&dir, 1);
        // follower believes an older epoch
        follower.make_follower(4, 0).unwrap();

        let (notify_shutdown, _) = broadcast::channel(1);
        let fetchers = ReplicaFetcherManager::new(
            1,
            test_replication_config(),
            Arc::new(LoopbackTransport {
                leader: leader.clone(),
            }),
            Arc::new(QuotaManager::new(QuotaConfig::default())),
            notify_shutdown.clone(),
        );
        fetchers.add_partition(0, follower.clone(), 0);

        let state = fetchers.fetchers.get(&0).unwrap().clone();
        assert!(wait_until(2_000, || state.partitions.is_empty()).await);
        assert_eq!(follower.log().next_offset(), 0);

        drop(notify_shutdown);
    }
}
