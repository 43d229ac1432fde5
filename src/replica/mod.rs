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

//! Replication: leader/follower partition state, ISR membership, high
//! watermark advancement and the follower fetch machinery.

mod fetcher;
mod partition;
mod replica_manager;

use async_trait::async_trait;

use crate::message::{MemoryRecords, TopicPartition};
use crate::AppResult;

pub use fetcher::ReplicaFetcherManager;
pub use partition::{AckMode, Partition, PartitionStatus};
pub use replica_manager::ReplicaManager;

/// Fetch issued by a follower (`source_broker >= 0`) or a consumer
/// (`source_broker == CONSUMER_REPLICA_ID`).
#[derive(Debug)]
pub struct FetchRequest {
    pub source_broker: i32,
    pub max_wait_ms: u64,
    pub min_bytes: usize,
    pub partitions: Vec<PartitionFetchRequest>,
}

/// Replica id used by consumers, which never join the ISR and only see
/// committed records.
pub const CONSUMER_REPLICA_ID: i32 = -1;

#[derive(Debug, Clone)]
pub struct PartitionFetchRequest {
    pub topic_partition: TopicPartition,
    pub fetch_offset: i64,
    pub leader_epoch: i32,
    pub max_bytes: usize,
}

#[derive(Debug)]
pub struct FetchResponse {
    pub partitions: Vec<PartitionFetchResponse>,
}

#[derive(Debug)]
pub struct PartitionFetchResponse {
    pub topic_partition: TopicPartition,
    pub result: AppResult<PartitionFetchData>,
}

#[derive(Debug)]
pub struct PartitionFetchData {
    pub records: MemoryRecords,
    pub high_watermark: i64,
    pub log_start_offset: i64,
    pub log_end_offset: i64,
}

/// How a fetch reaches a leader broker. Production wiring puts a network
/// client behind this; tests wire brokers together in process.
#[async_trait]
pub trait FetchTransport: Send + Sync {
    async fn fetch(&self, leader: i32, request: FetchRequest) -> AppResult<FetchResponse>;
}
