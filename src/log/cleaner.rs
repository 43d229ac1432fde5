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

//! Log compaction: rewrite closed segments of compact-policy logs so only
//! the latest record per key survives. Keyless records are always retained.
//! The active segment never participates.
//!
//! Each cleaning pass builds a key to latest-offset map over the dirty
//! section, bounded by the per-thread dedupe buffer budget, then rewrites
//! every closed segment below the mapped region. Offsets of retained
//! records never change, so reads across a compacted region stay correct.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::log::segment::ReadOnlySegment;
use crate::log::{CleanupPolicy, LogManager, PartitionLog};
use crate::message::{build_batch_buffer, encode_record, MemoryRecords, TopicPartition};
use crate::quota::QuotaLimiter;
use crate::{AppResult, CleanerConfig, QuotaConfig};

/// Rough per-entry cost of the dedupe map: key bytes plus bookkeeping.
const DEDUPE_ENTRY_OVERHEAD: usize = 64;

#[derive(Debug)]
pub struct LogCleaner {
    config: CleanerConfig,
    /// Aggregate read+write throughput cap shared by all cleaner threads.
    io_throttle: QuotaLimiter,
    /// Partitions currently being cleaned, so threads never race on one log.
    in_progress: DashMap<TopicPartition, ()>,
}

impl LogCleaner {
    pub fn new(config: CleanerConfig, quota: &QuotaConfig) -> Arc<Self> {
        let io_throttle = QuotaLimiter::new(
            config.io_max_bytes_per_second,
            quota.window_size_ms,
            quota.window_num,
        );
        Arc::new(Self {
            config,
            io_throttle,
            in_progress: DashMap::new(),
        })
    }

    /// Spawns the configured number of cleaner tasks. A no-op when the
    /// cleaner is disabled.
    pub fn start(
        self: &Arc<Self>,
        log_manager: Arc<LogManager>,
        notify_shutdown: &broadcast::Sender<()>,
        shutdown_complete_tx: &mpsc::Sender<()>,
    ) {
        if !self.config.enable {
            info!("log cleaner disabled");
            return;
        }
        for thread in 0..self.config.num_threads {
            let cleaner = self.clone();
            let manager = log_manager.clone();
            let mut shutdown = crate::service::Shutdown::new(notify_shutdown.subscribe());
            let shutdown_complete = shutdown_complete_tx.clone();
            tokio::spawn(async move {
                info!("log cleaner thread {} started", thread);
                loop {
                    tokio::select! {
                        _ = cleaner.clean_pass(&manager) => {}
                        _ = shutdown.recv() => {
                            info!("log cleaner thread {} shutting down", thread);
                            break;
                        }
                    }
                }
                drop(shutdown_complete);
            });
        }
    }

    /// Cleans the dirtiest eligible log, or backs off when none qualifies.
    async fn clean_pass(&self, log_manager: &LogManager) {
        let log = match self.pick_dirtiest(log_manager) {
            Some(log) => log,
            None => {
                tokio::time::sleep(Duration::from_millis(self.config.backoff_ms)).await;
                return;
            }
        };
        let topic_partition = log.topic_partition().clone();
        match self.clean_log(&log).await {
            Ok(reclaimed) => {
                debug!("{}: compaction reclaimed {} bytes", topic_partition, reclaimed)
            }
            Err(e) => warn!("{}: compaction pass failed: {}", topic_partition, e),
        }
        self.in_progress.remove(&topic_partition);
    }

    /// Picks the compact-policy log with the highest dirty ratio at or above
    /// the eligibility threshold, marking it in progress.
    fn pick_dirtiest(&self, log_manager: &LogManager) -> Option<Arc<PartitionLog>> {
        let mut best: Option<(f64, Arc<PartitionLog>)> = None;
        for log in log_manager.all_logs() {
            if log.cleanup_policy() != CleanupPolicy::Compact {
                continue;
            }
            if self.in_progress.contains_key(log.topic_partition()) {
                continue;
            }
            let ratio = log.dirty_ratio();
            if ratio < self.config.min_cleanable_ratio || ratio == 0.0 {
                continue;
            }
            if best.as_ref().map_or(true, |(r, _)| ratio > *r) {
                best = Some((ratio, log));
            }
        }
        let (_, log) = best?;
        self.in_progress.insert(log.topic_partition().clone(), ());
        Some(log)
    }

    /// One full compaction of a partition log's closed segments. Returns
    /// the number of bytes reclaimed.
    pub async fn clean_log(&self, log: &PartitionLog) -> AppResult<u64> {
        let segments = log.closed_segments();
        let last = match segments.last() {
            Some(last) => last,
            None => return Ok(0),
        };
        let first_dirty = log.first_dirty_offset();
        let closed_end = last.next_offset()?;
        if first_dirty >= closed_end {
            return Ok(0);
        }

        let (latest_by_key, clean_until) =
            self.build_offset_map(&segments, first_dirty, closed_end).await?;
        debug!(
            "{}: compacting [{}, {}) with {} mapped keys",
            log.topic_partition(),
            first_dirty,
            clean_until,
            latest_by_key.len()
        );

        let mut reclaimed = 0u64;
        for segment in &segments {
            if segment.base_offset() >= clean_until {
                break;
            }
            // a bad segment is skipped, not fatal to the whole pass
            match self
                .clean_segment(log, segment, &latest_by_key, clean_until)
                .await
            {
                Ok(bytes) => reclaimed += bytes,
                Err(e) => warn!(
                    "{}: failed to compact segment {}: {}",
                    log.topic_partition(),
                    segment.base_offset(),
                    e
                ),
            }
        }
        log.advance_first_dirty_offset(clean_until);
        Ok(reclaimed)
    }

    /// First pass: latest offset per key over the dirty section. When the
    /// map hits the memory budget the pass is capped at the first unmapped
    /// offset; everything past it stays dirty for the next round.
    async fn build_offset_map(
        &self,
        segments: &[Arc<ReadOnlySegment>],
        first_dirty: i64,
        closed_end: i64,
    ) -> AppResult<(HashMap<Bytes, i64>, i64)> {
        let max_entries =
            (self.config.dedupe_buffer_size / self.config.num_threads) / DEDUPE_ENTRY_OVERHEAD;
        let mut latest_by_key: HashMap<Bytes, i64> = HashMap::new();

        for segment in segments {
            if segment.next_offset()? <= first_dirty {
                continue;
            }
            let records = segment.read(segment.base_offset(), usize::MAX)?;
            self.io_throttle.throttle(records.size() as u64).await;
            for batch in records.batches() {
                let batch = batch?;
                for record in batch.records()? {
                    if record.offset < first_dirty {
                        continue;
                    }
                    let key = match record.key {
                        Some(key) => key,
                        None => continue,
                    };
                    if !latest_by_key.contains_key(&key) && latest_by_key.len() >= max_entries {
                        // budget exhausted: cap the cleanable region here
                        return Ok((latest_by_key, record.offset));
                    }
                    latest_by_key.insert(key, record.offset);
                }
            }
        }
        Ok((latest_by_key, closed_end))
    }

    /// Second pass over one segment: drop every keyed record superseded by a
    /// later offset and swap in the rewritten file. Batch grouping and the
    /// offsets of retained records are preserved.
    async fn clean_segment(
        &self,
        log: &PartitionLog,
        segment: &ReadOnlySegment,
        latest_by_key: &HashMap<Bytes, i64>,
        clean_until: i64,
    ) -> AppResult<u64> {
        let records = segment.read(segment.base_offset(), usize::MAX)?;
        self.io_throttle.throttle(records.size() as u64).await;

        let mut out = BytesMut::new();
        for batch in records.batches() {
            let batch = batch?;
            let base_offset = batch.base_offset();
            let mut kept_bodies = BytesMut::new();
            let mut kept_count = 0u32;
            let mut last_delta = 0u32;
            for record in batch.records()? {
                let retain = record.offset >= clean_until
                    || match &record.key {
                        None => true,
                        Some(key) => latest_by_key
                            .get(key)
                            .map_or(true, |latest| *latest <= record.offset),
                    };
                if !retain {
                    continue;
                }
                let delta = (record.offset - base_offset) as u32;
                encode_record(
                    &mut kept_bodies,
                    delta,
                    record.timestamp,
                    record.key.as_deref(),
                    &record.value,
                );
                last_delta = delta;
                kept_count += 1;
            }
            if kept_count > 0 {
                let cleaned = build_batch_buffer(base_offset, kept_count, last_delta, &kept_bodies);
                out.extend_from_slice(cleaned.buffer());
            }
        }

        let cleaned = MemoryRecords::new(out.freeze());
        self.io_throttle.throttle(cleaned.size() as u64).await;
        let reclaimed = segment.size().saturating_sub(cleaned.size() as u64);
        log.replace_with_cleaned(segment.base_offset(), &cleaned)?;
        Ok(reclaimed)
    }
}
