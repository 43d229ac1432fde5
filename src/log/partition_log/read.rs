//! Read path, retention sweep support and compacted-segment swap.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::log::segment::{
    self, log_file_name, mark_for_deletion, now_ms, rebuild_index, ReadOnlySegment,
};
use crate::log::{LogFetchInfo, CLEANED_FILE_SUFFIX, DELETED_FILE_SUFFIX};
use crate::message::MemoryRecords;
use crate::{AppError, AppResult};

use super::PartitionLog;

impl PartitionLog {
    /// Reads up to `max_bytes` of complete batches starting at the first
    /// record with offset >= `offset`. An empty result means the caller is
    /// at the log end (or the byte budget is smaller than one batch).
    pub fn read_records(&self, offset: i64, max_bytes: usize) -> AppResult<LogFetchInfo> {
        let log_start_offset = self.log_start_offset.load(Ordering::Acquire);
        let log_end_offset = self.next_offset.load(Ordering::Acquire);

        if offset < log_start_offset || offset > log_end_offset {
            return Err(AppError::OffsetOutOfRange {
                partition: self.topic_partition.id(),
                offset,
                start: log_start_offset,
                end: log_end_offset,
            });
        }

        let fetch_info = |records| LogFetchInfo {
            records,
            log_start_offset,
            log_end_offset,
        };
        if offset == log_end_offset || max_bytes == 0 {
            return Ok(fetch_info(MemoryRecords::empty()));
        }

        // serve from the active segment when the offset falls inside it,
        // otherwise from the closed segment covering the offset
        let records = {
            let active = self.active.read();
            if offset >= active.base_offset() {
                active.read(offset, max_bytes)?
            } else {
                drop(active);
                self.read_closed_segments(offset, max_bytes, log_end_offset)?
            }
        };
        Ok(fetch_info(records))
    }

    /// Reads from the closed segment covering `offset`. Compaction can leave
    /// a segment with every record removed, so an empty result moves on to
    /// the next segment (and finally the active one) instead of reporting a
    /// false log end.
    fn read_closed_segments(
        &self,
        offset: i64,
        max_bytes: usize,
        log_end_offset: i64,
    ) -> AppResult<MemoryRecords> {
        let mut from = offset;
        loop {
            let segment = {
                let segments = self.segments.read();
                segments
                    .range(..=from)
                    .next_back()
                    .map(|(_, segment)| segment.clone())
            };
            let segment = match segment {
                Some(segment) => segment,
                // retention removed it between the bounds check and here
                None => {
                    return Err(AppError::OffsetOutOfRange {
                        partition: self.topic_partition.id(),
                        offset,
                        start: self.log_start_offset.load(Ordering::Acquire),
                        end: log_end_offset,
                    })
                }
            };
            let records = segment.read(from.max(segment.base_offset()), max_bytes)?;
            if !records.is_empty() {
                return Ok(records);
            }
            let next_base = {
                let segments = self.segments.read();
                segments
                    .range(segment.base_offset() + 1..)
                    .next()
                    .map(|(base, _)| *base)
            };
            match next_base {
                Some(base) => from = base,
                None => {
                    let active = self.active.read();
                    let start = from.max(active.base_offset());
                    return active.read(start, max_bytes);
                }
            }
        }
    }

    /// Removes closed segments past the retention limits, oldest first.
    /// A segment is only deletable when every offset it holds is below
    /// `min_retained_offset` (the high watermark). Returns the number of
    /// segments scheduled for deletion.
    pub fn delete_old_segments(&self, min_retained_offset: i64) -> AppResult<usize> {
        let retention_ms = self.log_config.retention_ms;
        let retention_bytes = self.log_config.retention_bytes;
        let now = now_ms();

        let mut total_size = self.size_bytes() as i64;
        let active_base = self.active.read().base_offset();
        let mut deletable = Vec::new();
        {
            let segments = self.segments.read();
            let mut iter = segments.iter().peekable();
            while let Some((base_offset, segment)) = iter.next() {
                let end_offset = iter
                    .peek()
                    .map(|(next_base, _)| **next_base)
                    .unwrap_or(active_base);
                if end_offset > min_retained_offset {
                    break;
                }
                let expired = now.saturating_sub(segment.last_modified_ms()) as u64 > retention_ms;
                let oversized = retention_bytes >= 0 && total_size > retention_bytes;
                if !expired && !oversized {
                    break;
                }
                total_size -= segment.size() as i64;
                deletable.push(*base_offset);
            }
        }

        for base_offset in &deletable {
            self.delete_segment(*base_offset)?;
        }
        if let Some(last) = deletable.last() {
            let new_start = self.segment_end_offset(*last).max(self.log_start_offset());
            self.log_start_offset.store(new_start, Ordering::Release);
            self.first_dirty_offset.fetch_max(new_start, Ordering::AcqRel);
            info!(
                "{}: deleted {} segments, log start offset now {}",
                self.topic_partition,
                deletable.len(),
                new_start
            );
        }
        Ok(deletable.len())
    }

    /// Marks the segment's files deleted and schedules the physical unlink
    /// after the configured grace period so in-flight readers holding open
    /// handles are not broken.
    fn delete_segment(&self, base_offset: i64) -> AppResult<()> {
        self.segments.write().remove(&base_offset);
        self.schedule_file_removal(base_offset)
    }

    /// Renames a segment's files out of the way and unlinks them after the
    /// grace period. The caller has already dropped the segment from the map.
    pub(super) fn schedule_file_removal(&self, base_offset: i64) -> AppResult<()> {
        let (log_renamed, index_renamed) =
            mark_for_deletion(&self.dir, base_offset, DELETED_FILE_SUFFIX)?;
        let delay = Duration::from_millis(self.log_config.file_delete_delay_ms);
        let partition = self.topic_partition.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            for path in [log_renamed, index_renamed] {
                if let Err(e) = std::fs::remove_file(&path) {
                    warn!("{}: failed to remove {:?}: {}", partition, path, e);
                }
            }
        });
        debug!("{}: segment {} marked deleted", self.topic_partition, base_offset);
        Ok(())
    }

    /// Swaps a closed segment's contents for its compacted rewrite. The
    /// cleaned data is written to a temporary file first so a crash in the
    /// middle leaves the original segment intact.
    pub fn replace_with_cleaned(
        &self,
        base_offset: i64,
        cleaned: &MemoryRecords,
    ) -> AppResult<()> {
        let log_path = log_file_name(&self.dir, base_offset);
        let tmp_path = log_path.with_extension(format!("log.{}", CLEANED_FILE_SUFFIX));
        std::fs::write(&tmp_path, cleaned.buffer())?;

        {
            // readers keep serving the old mmap/file handles until the swap
            let mut segments = self.segments.write();
            std::fs::rename(&tmp_path, &log_path)?;
            rebuild_index(
                &self.dir,
                base_offset,
                self.log_config.index_file_size,
                self.log_config.index_interval_bytes,
            )?;
            let segment = ReadOnlySegment::open(&self.dir, base_offset)?;
            segments.insert(base_offset, Arc::new(segment));
        }
        debug!(
            "{}: segment {} swapped for cleaned copy ({} bytes)",
            self.topic_partition,
            base_offset,
            cleaned.size()
        );
        Ok(())
    }

    /// Drops crash leftovers (`.deleted`, `.cleaned`) in the partition dir.
    pub(super) fn remove_stray_files(dir: &std::path::Path) -> AppResult<()> {
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
            if name.ends_with(DELETED_FILE_SUFFIX) || name.ends_with(CLEANED_FILE_SUFFIX) {
                warn!("removing stray file {:?}", path);
                let _ = std::fs::remove_file(&path);
            }
        }
        Ok(())
    }

    /// Consistency check used on startup: a closed segment whose index does
    /// not match its data gets its index rebuilt by scanning.
    pub(super) fn validate_or_rebuild_index(
        dir: &std::path::Path,
        base_offset: i64,
        index_file_size: usize,
        index_interval_bytes: usize,
    ) -> AppResult<Arc<ReadOnlySegment>> {
        match ReadOnlySegment::open(dir, base_offset) {
            Ok(seg) if segment::index_is_consistent(seg.index(), seg.size()) => Ok(Arc::new(seg)),
            Ok(_) | Err(_) => {
                warn!(
                    "segment {} in {:?}: index missing or inconsistent, rebuilding",
                    base_offset, dir
                );
                rebuild_index(dir, base_offset, index_file_size, index_interval_bytes)?;
                Ok(Arc::new(ReadOnlySegment::open(dir, base_offset)?))
            }
        }
    }
}
