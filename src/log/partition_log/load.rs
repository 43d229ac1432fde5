//! Startup recovery: rebuild segment maps and indexes from the partition
//! directory and restore offsets from the recovery checkpoint.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::AtomicI64;

use parking_lot::RwLock;
use tracing::info;

use crate::log::segment::ActiveSegment;
use crate::log::{CleanupPolicy, LOG_FILE_SUFFIX};
use crate::message::TopicPartition;
use crate::{AppResult, LogConfig};

use super::PartitionLog;

impl PartitionLog {
    /// Opens (or creates) the log for one partition. `recover_point` is the
    /// last flushed offset from the recovery checkpoint file; segments past
    /// it are re-validated by scanning.
    pub fn open(
        topic_partition: TopicPartition,
        data_dir: impl AsRef<Path>,
        log_config: LogConfig,
        cleanup_policy: CleanupPolicy,
        recover_point: i64,
    ) -> AppResult<Self> {
        let dir = topic_partition.partition_dir(data_dir);
        std::fs::create_dir_all(&dir)?;
        Self::remove_stray_files(&dir)?;

        let mut base_offsets = list_segment_base_offsets(&dir)?;
        let active_base = base_offsets.pop().unwrap_or(0);

        let mut segments = BTreeMap::new();
        for base_offset in &base_offsets {
            let segment = Self::validate_or_rebuild_index(
                &dir,
                *base_offset,
                log_config.index_file_size,
                log_config.index_interval_bytes,
            )?;
            segments.insert(*base_offset, segment);
        }

        let mut active = ActiveSegment::create(
            &dir,
            active_base,
            log_config.index_file_size,
            log_config.segment_roll_jitter_ms,
        )?;
        let next_offset = active.recover(log_config.index_interval_bytes)?;

        let log_start_offset = segments
            .keys()
            .next()
            .copied()
            .unwrap_or(active_base);
        let recover_point = recover_point.clamp(log_start_offset - 1, next_offset - 1);

        info!(
            "{}: loaded {} closed segments, active base {}, log range [{}, {})",
            topic_partition,
            segments.len(),
            active_base,
            log_start_offset,
            next_offset
        );

        Ok(Self {
            topic_partition,
            dir,
            log_config,
            cleanup_policy,
            segments: RwLock::new(segments),
            active: RwLock::new(active),
            next_offset: AtomicI64::new(next_offset),
            log_start_offset: AtomicI64::new(log_start_offset),
            recover_point: AtomicI64::new(recover_point),
            first_dirty_offset: AtomicI64::new(log_start_offset),
        })
    }
}

fn list_segment_base_offsets(dir: &Path) -> AppResult<Vec<i64>> {
    let mut base_offsets = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some(LOG_FILE_SUFFIX) {
            continue;
        }
        if let Some(base) = path
            .file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| s.parse::<i64>().ok())
        {
            base_offsets.push(base);
        }
    }
    base_offsets.sort_unstable();
    Ok(base_offsets)
}
