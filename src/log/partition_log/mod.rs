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

//! One partition's on-disk log: an ordered set of closed segments plus the
//! single active segment, with offset assignment, rolling, retention and
//! compaction support.

mod load;
mod read;
mod write;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::log::segment::{ActiveSegment, ReadOnlySegment};
use crate::log::CleanupPolicy;
use crate::message::TopicPartition;
use crate::LogConfig;

#[derive(Debug)]
pub struct PartitionLog {
    topic_partition: TopicPartition,
    dir: PathBuf,
    log_config: LogConfig,
    cleanup_policy: CleanupPolicy,
    /// Closed, immutable segments keyed by base offset. Reads of closed
    /// segments take no per-segment lock.
    segments: RwLock<BTreeMap<i64, Arc<ReadOnlySegment>>>,
    /// The writable segment; appends and rolls serialize on this lock.
    active: RwLock<ActiveSegment>,
    /// Log end offset: the offset the next record will get.
    next_offset: AtomicI64,
    /// Earliest retained offset.
    log_start_offset: AtomicI64,
    /// Everything at or below this offset has been flushed to disk.
    recover_point: AtomicI64,
    /// Compaction progress: offsets below this are already compacted.
    first_dirty_offset: AtomicI64,
}

impl PartitionLog {
    pub fn topic_partition(&self) -> &TopicPartition {
        &self.topic_partition
    }

    pub fn cleanup_policy(&self) -> CleanupPolicy {
        self.cleanup_policy
    }

    /// Log end offset (the next offset to be assigned).
    pub fn next_offset(&self) -> i64 {
        self.next_offset.load(Ordering::Acquire)
    }

    pub fn log_start_offset(&self) -> i64 {
        self.log_start_offset.load(Ordering::Acquire)
    }

    pub fn recover_point(&self) -> i64 {
        self.recover_point.load(Ordering::Acquire)
    }

    pub fn first_dirty_offset(&self) -> i64 {
        self.first_dirty_offset.load(Ordering::Acquire)
    }

    pub fn advance_first_dirty_offset(&self, offset: i64) {
        self.first_dirty_offset.fetch_max(offset, Ordering::AcqRel);
    }

    /// Total bytes across closed segments and the active segment.
    pub fn size_bytes(&self) -> u64 {
        let active = self.active.read().size();
        let closed: u64 = self.segments.read().values().map(|s| s.size()).sum();
        active + closed
    }

    /// Ratio of not-yet-compacted bytes to total closed bytes. The active
    /// segment never participates in compaction.
    pub fn dirty_ratio(&self) -> f64 {
        let segments = self.segments.read();
        let total: u64 = segments.values().map(|s| s.size()).sum();
        if total == 0 {
            return 0.0;
        }
        let first_dirty = self.first_dirty_offset();
        let dirty: u64 = segments
            .iter()
            .filter(|(base, _)| **base >= first_dirty)
            .map(|(_, s)| s.size())
            .sum();
        dirty as f64 / total as f64
    }

    /// Snapshot of closed segments in base offset order.
    pub fn closed_segments(&self) -> Vec<Arc<ReadOnlySegment>> {
        self.segments.read().values().cloned().collect()
    }

    /// Base offset of the segment after the given one, or the active
    /// segment's base when the given segment is the newest closed one.
    /// By the contiguity invariant this equals the segment's end offset.
    /// Lock order: active before segments, same as the roll path.
    pub fn segment_end_offset(&self, base_offset: i64) -> i64 {
        let active_base = self.active.read().base_offset();
        let segments = self.segments.read();
        segments
            .range(base_offset + 1..)
            .next()
            .map(|(base, _)| *base)
            .unwrap_or(active_base)
    }
}
