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

//! Per-partition replica state: leadership, the in-sync replica set and
//! the high watermark.
//!
//! The high watermark is the minimum log end offset across ISR members and
//! only ever moves forward. It travels through a watch channel so produce
//! requests waiting for full acknowledgement and parked fetches wake up the
//! moment it advances.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::{watch, Notify};
use tracing::{debug, info, warn};

use crate::log::{now_ms, LogAppendInfo, PartitionLog};
use crate::message::{MemoryRecords, TopicPartition};
use crate::replica::{PartitionFetchData, PartitionFetchRequest, CONSUMER_REPLICA_ID};
use crate::{AppError, AppResult, ReplicationConfig};

/// Produce acknowledgement level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckMode {
    /// Fire and forget.
    None,
    /// Acknowledged once written to the leader log.
    Leader,
    /// Acknowledged once the high watermark passes the batch, meaning every
    /// in-sync replica holds it.
    All,
}

#[derive(Debug)]
struct FollowerState {
    log_end_offset: i64,
    /// Last instant this follower's fetch position matched the leader log
    /// end offset.
    last_caught_up_ms: i64,
}

#[derive(Debug)]
struct ReplicaState {
    leader: i32,
    leader_epoch: i32,
    assignment: Vec<i32>,
    isr: BTreeSet<i32>,
    followers: HashMap<i32, FollowerState>,
}

/// Introspection snapshot of one partition's replication state.
#[derive(Debug, Clone)]
pub struct PartitionStatus {
    pub topic_partition: TopicPartition,
    pub leader: i32,
    pub leader_epoch: i32,
    pub replicas: Vec<i32>,
    pub isr: Vec<i32>,
    pub high_watermark: i64,
    pub log_end_offset: i64,
    /// (follower broker, records behind the leader log end)
    pub follower_lag: Vec<(i32, i64)>,
}

#[derive(Debug)]
pub struct Partition {
    topic_partition: TopicPartition,
    local_broker: i32,
    log: Arc<PartitionLog>,
    config: ReplicationConfig,
    state: RwLock<ReplicaState>,
    high_watermark: watch::Sender<i64>,
    /// Broker-wide wakeup rung on appends and watermark movement so parked
    /// fetches re-evaluate.
    data_arrived: Arc<Notify>,
    /// Set whenever the ISR changes; the manager persists and clears it.
    isr_dirty: AtomicBool,
}

impl Partition {
    pub fn new(
        topic_partition: TopicPartition,
        local_broker: i32,
        log: Arc<PartitionLog>,
        config: ReplicationConfig,
        initial_high_watermark: i64,
        data_arrived: Arc<Notify>,
    ) -> Self {
        let high_watermark = initial_high_watermark
            .clamp(0, log.next_offset())
            .max(log.log_start_offset());
        let (high_watermark, _) = watch::channel(high_watermark);
        Self {
            topic_partition,
            local_broker,
            log,
            config,
            state: RwLock::new(ReplicaState {
                leader: -1,
                leader_epoch: -1,
                assignment: Vec::new(),
                isr: BTreeSet::new(),
                followers: HashMap::new(),
            }),
            high_watermark,
            data_arrived,
            isr_dirty: AtomicBool::new(false),
        }
    }

    pub fn topic_partition(&self) -> &TopicPartition {
        &self.topic_partition
    }

    pub fn log(&self) -> &Arc<PartitionLog> {
        &self.log
    }

    pub fn high_watermark(&self) -> i64 {
        *self.high_watermark.borrow()
    }

    pub fn watch_high_watermark(&self) -> watch::Receiver<i64> {
        self.high_watermark.subscribe()
    }

    pub fn is_leader(&self) -> bool {
        self.state.read().leader == self.local_broker
    }

    pub fn leader(&self) -> i32 {
        self.state.read().leader
    }

    pub fn leader_epoch(&self) -> i32 {
        self.state.read().leader_epoch
    }

    pub fn isr(&self) -> Vec<i32> {
        self.state.read().isr.iter().copied().collect()
    }

    /// True when the ISR changed since the last persistence pass.
    pub fn take_isr_dirty(&self) -> bool {
        self.isr_dirty.swap(false, Ordering::AcqRel)
    }

    /// Re-flags a membership change whose persistence failed so the next
    /// maintenance pass retries it.
    pub fn mark_isr_dirty(&self) {
        self.isr_dirty.store(true, Ordering::Release);
    }

    /// Called once an ISR change has been made durable. A shrunken committed
    /// set can unblock the watermark, which until now was held back so no
    /// acknowledgement ever depends on an unpersisted membership.
    pub fn on_isr_persisted(&self) {
        self.maybe_advance_high_watermark();
    }

    pub fn status(&self) -> PartitionStatus {
        let log_end_offset = self.log.next_offset();
        let state = self.state.read();
        PartitionStatus {
            topic_partition: self.topic_partition.clone(),
            leader: state.leader,
            leader_epoch: state.leader_epoch,
            replicas: state.assignment.clone(),
            isr: state.isr.iter().copied().collect(),
            high_watermark: self.high_watermark(),
            log_end_offset,
            follower_lag: state
                .followers
                .iter()
                .map(|(broker, f)| (*broker, log_end_offset - f.log_end_offset.max(0)))
                .collect(),
        }
    }

    /// Assumes leadership for `leader_epoch`. Followers get a full lag
    /// grace period from this instant before a shrink can evict them.
    pub fn make_leader(
        &self,
        leader_epoch: i32,
        assignment: Vec<i32>,
        isr: Vec<i32>,
    ) -> AppResult<()> {
        let now = now_ms();
        let mut state = self.state.write();
        if leader_epoch < state.leader_epoch {
            return Err(AppError::StaleEpoch {
                partition: self.topic_partition.id(),
                requested: leader_epoch,
                current: state.leader_epoch,
            });
        }
        state.leader = self.local_broker;
        state.leader_epoch = leader_epoch;
        state.isr = isr.into_iter().collect();
        state.isr.insert(self.local_broker);
        state.followers = assignment
            .iter()
            .filter(|broker| **broker != self.local_broker)
            .map(|broker| {
                (
                    *broker,
                    FollowerState {
                        log_end_offset: -1,
                        last_caught_up_ms: now,
                    },
                )
            })
            .collect();
        state.assignment = assignment;
        info!(
            "{}: became leader at epoch {}, isr {:?}",
            self.topic_partition, leader_epoch, state.isr
        );
        drop(state);
        // the watermark is not recomputed here: the caller persists the new
        // membership first and then calls on_isr_persisted
        self.isr_dirty.store(true, Ordering::Release);
        Ok(())
    }

    /// Demotes to follower of `leader` for `leader_epoch`.
    pub fn make_follower(&self, leader_epoch: i32, leader: i32) -> AppResult<()> {
        let mut state = self.state.write();
        if leader_epoch < state.leader_epoch {
            return Err(AppError::StaleEpoch {
                partition: self.topic_partition.id(),
                requested: leader_epoch,
                current: state.leader_epoch,
            });
        }
        state.leader = leader;
        state.leader_epoch = leader_epoch;
        state.followers.clear();
        info!(
            "{}: became follower of broker {} at epoch {}",
            self.topic_partition, leader, leader_epoch
        );
        Ok(())
    }

    fn require_leadership(&self, requested_epoch: i32) -> AppResult<()> {
        let state = self.state.read();
        if state.leader != self.local_broker {
            return Err(AppError::NotLeader {
                partition: self.topic_partition.id(),
                broker: state.leader,
            });
        }
        if requested_epoch >= 0 && requested_epoch != state.leader_epoch {
            return Err(AppError::StaleEpoch {
                partition: self.topic_partition.id(),
                requested: requested_epoch,
                current: state.leader_epoch,
            });
        }
        Ok(())
    }

    /// Leader-side produce. With `AckMode::All` the future resolves only
    /// once the high watermark passes the appended batch, or fails when the
    /// ISR is already below `min_insync_replicas`.
    pub async fn append_records(
        &self,
        records: MemoryRecords,
        ack: AckMode,
    ) -> AppResult<LogAppendInfo> {
        {
            let state = self.state.read();
            if state.leader != self.local_broker {
                return Err(AppError::NotLeader {
                    partition: self.topic_partition.id(),
                    broker: state.leader,
                });
            }
            if ack == AckMode::All && state.isr.len() < self.config.min_insync_replicas {
                return Err(AppError::InsufficientReplicas {
                    partition: self.topic_partition.id(),
                    isr_size: state.isr.len(),
                    min_required: self.config.min_insync_replicas,
                });
            }
        }

        let info = self.log.append_records(records)?;
        self.maybe_advance_high_watermark();
        self.data_arrived.notify_waiters();

        if ack == AckMode::All {
            self.wait_for_high_watermark(info.last_offset + 1).await?;
        }
        Ok(info)
    }

    async fn wait_for_high_watermark(&self, target: i64) -> AppResult<()> {
        let mut watermark = self.high_watermark.subscribe();
        let wait = async {
            loop {
                if *watermark.borrow_and_update() >= target {
                    return Ok(());
                }
                if watermark.changed().await.is_err() {
                    return Err(AppError::IllegalState(format!(
                        "{}: watermark channel closed",
                        self.topic_partition
                    )));
                }
            }
        };
        tokio::time::timeout(Duration::from_millis(self.config.socket_timeout_ms), wait)
            .await
            .map_err(|_| {
                AppError::IllegalState(format!(
                    "{}: timed out waiting for offset {} to be replicated",
                    self.topic_partition, target
                ))
            })?
    }

    /// Follower-side append of leader-assigned batches.
    pub fn append_replicated(&self, records: MemoryRecords) -> AppResult<LogAppendInfo> {
        let info = self.log.append_replicated(records)?;
        self.data_arrived.notify_waiters();
        Ok(info)
    }

    /// Follower-side watermark update from a fetch response: the leader's
    /// watermark capped at what is locally written, never moving backward.
    pub fn record_leader_high_watermark(&self, leader_high_watermark: i64) {
        let bounded = leader_high_watermark.min(self.log.next_offset());
        let advanced = self.high_watermark.send_if_modified(|hw| {
            if bounded > *hw {
                *hw = bounded;
                true
            } else {
                false
            }
        });
        if advanced {
            self.data_arrived.notify_waiters();
        }
    }

    /// Serves one partition's slice of a fetch. Follower fetches double as
    /// replication progress reports and may expand the ISR; consumer fetches
    /// only see records below the high watermark.
    pub fn fetch_records(
        &self,
        request: &PartitionFetchRequest,
        from_broker: i32,
    ) -> AppResult<PartitionFetchData> {
        self.require_leadership(request.leader_epoch)?;

        let high_watermark = self.high_watermark();
        let max_bytes = request.max_bytes.min(self.config.fetch_max_bytes);
        let fetch = self.log.read_records(request.fetch_offset, max_bytes)?;
        let records = if from_broker == CONSUMER_REPLICA_ID {
            bound_to_high_watermark(fetch.records, high_watermark)
        } else {
            self.record_follower_progress(from_broker, request.fetch_offset);
            fetch.records
        };

        Ok(PartitionFetchData {
            records,
            high_watermark: self.high_watermark(),
            log_start_offset: fetch.log_start_offset,
            log_end_offset: fetch.log_end_offset,
        })
    }

    /// A fetch at offset `fetch_offset` proves the follower holds every
    /// record below it.
    fn record_follower_progress(&self, follower: i32, fetch_offset: i64) {
        let leader_log_end = self.log.next_offset();
        let now = now_ms();
        let mut expanded = false;
        {
            let mut state = self.state.write();
            let Some(progress) = state.followers.get_mut(&follower) else {
                warn!(
                    "{}: fetch from broker {} outside the assignment",
                    self.topic_partition, follower
                );
                return;
            };
            progress.log_end_offset = progress.log_end_offset.max(fetch_offset);
            if fetch_offset >= leader_log_end {
                progress.last_caught_up_ms = now;
            }
            // a follower re-enters the ISR only once it holds everything
            // the leader does
            if !state.isr.contains(&follower) && fetch_offset >= leader_log_end {
                state.isr.insert(follower);
                expanded = true;
                info!(
                    "{}: broker {} caught up, isr expanded to {:?}",
                    self.topic_partition, follower, state.isr
                );
            }
        }
        if expanded {
            self.isr_dirty.store(true, Ordering::Release);
        }
        self.maybe_advance_high_watermark();
    }

    /// Drops ISR members that have not been caught up within the lag
    /// window. Returns true when the ISR changed. The watermark stays put
    /// until the caller persists the shrink and calls on_isr_persisted.
    pub fn maybe_shrink_isr(&self) -> bool {
        let now = now_ms();
        let lag_max = self.config.lag_time_max_ms as i64;
        let mut shrunk = false;
        {
            let mut state = self.state.write();
            if state.leader != self.local_broker {
                return false;
            }
            let laggards: Vec<i32> = state
                .isr
                .iter()
                .copied()
                .filter(|broker| {
                    if *broker == self.local_broker {
                        return false;
                    }
                    let caught_up_ms = state
                        .followers
                        .get(broker)
                        .map_or(0, |f| f.last_caught_up_ms);
                    now - caught_up_ms > lag_max
                })
                .collect();
            if !laggards.is_empty() {
                for broker in &laggards {
                    state.isr.remove(broker);
                }
                shrunk = true;
                info!(
                    "{}: shrunk isr to {:?}, evicted laggards {:?}",
                    self.topic_partition, state.isr, laggards
                );
            }
        }
        if shrunk {
            self.isr_dirty.store(true, Ordering::Release);
        }
        shrunk
    }

    /// Recomputes the high watermark as the minimum log end offset across
    /// ISR members. Advance-only.
    fn maybe_advance_high_watermark(&self) {
        let leader_log_end = self.log.next_offset();
        let candidate = {
            let state = self.state.read();
            if state.leader != self.local_broker {
                return;
            }
            state
                .isr
                .iter()
                .map(|broker| {
                    if *broker == self.local_broker {
                        leader_log_end
                    } else {
                        state
                            .followers
                            .get(broker)
                            .map_or(-1, |f| f.log_end_offset)
                    }
                })
                .min()
                .unwrap_or(leader_log_end)
        };
        let advanced = self.high_watermark.send_if_modified(|hw| {
            if candidate > *hw {
                debug!(
                    "{}: high watermark {} -> {}",
                    self.topic_partition, *hw, candidate
                );
                *hw = candidate;
                true
            } else {
                false
            }
        });
        if advanced {
            self.data_arrived.notify_waiters();
        }
    }
}

/// Keeps only the leading batches fully below the high watermark.
fn bound_to_high_watermark(records: MemoryRecords, high_watermark: i64) -> MemoryRecords {
    let mut end = 0usize;
    for batch in records.batches() {
        let batch = match batch {
            Ok(batch) => batch,
            Err(_) => break,
        };
        if batch.next_offset() > high_watermark {
            break;
        }
        end += batch.size();
    }
    MemoryRecords::new(records.buffer().slice(0..end))
}
