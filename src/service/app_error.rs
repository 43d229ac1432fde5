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

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// general errors
    #[error("illegal state: {0}")]
    IllegalState(String),

    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error("I/O error: {0}")]
    DetailedIoError(String),

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("channel send error: {0}")]
    ChannelSendError(String),

    #[error("config file error: {0}")]
    ConfigFileError(#[from] config::ConfigError),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// log errors
    #[error("corrupt record: {0}")]
    CorruptRecord(String),

    #[error("record batch of {actual} bytes exceeds maximum of {limit} bytes")]
    MessageTooLarge { actual: usize, limit: usize },

    #[error("offset {offset} out of range [{start}, {end}] for {partition}")]
    OffsetOutOfRange {
        partition: String,
        offset: i64,
        start: i64,
        end: i64,
    },

    /// replication errors
    #[error("not the leader for {partition}, current leader is broker {broker}")]
    NotLeader { partition: String, broker: i32 },

    #[error("stale leader epoch {requested} for {partition}, current epoch is {current}")]
    StaleEpoch {
        partition: String,
        requested: i32,
        current: i32,
    },

    #[error(
        "in-sync replica count {isr_size} below required minimum {min_required} for {partition}"
    )]
    InsufficientReplicas {
        partition: String,
        isr_size: usize,
        min_required: usize,
    },
}

impl AppError {
    /// Errors that force a fetcher to relinquish the partition instead of
    /// backing off and retrying against the same target.
    pub fn is_fencing(&self) -> bool {
        matches!(
            self,
            AppError::NotLeader { .. } | AppError::StaleEpoch { .. }
        )
    }
}
