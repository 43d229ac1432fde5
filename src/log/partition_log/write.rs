//! Append path: offset assignment, segment rolling and flushing.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use parking_lot::RwLockWriteGuard;
use tracing::{debug, info, trace};

use crate::log::segment::ActiveSegment;
use crate::log::LogAppendInfo;
use crate::message::MemoryRecords;
use crate::{AppError, AppResult};

use super::PartitionLog;

impl PartitionLog {
    /// Appends producer batches, assigning contiguous offsets starting at
    /// the current log end offset.
    pub fn append_records(&self, mut records: MemoryRecords) -> AppResult<LogAppendInfo> {
        let records_count = records.validate(self.log_config.max_record_batch_size)?;
        if records_count == 0 {
            return Err(AppError::CorruptRecord("append without records".into()));
        }

        let mut active = self.active.write();
        self.maybe_roll(&mut active, records.size())?;

        let first_offset = self.next_offset.load(Ordering::Acquire);
        let next = records.assign_offsets(first_offset)?;
        active.append(
            &records,
            first_offset,
            self.log_config.index_interval_bytes,
        )?;
        self.next_offset.store(next, Ordering::Release);

        trace!(
            "appended {} records to {} at [{}, {}]",
            records_count,
            self.topic_partition,
            first_offset,
            next - 1
        );
        Ok(LogAppendInfo {
            first_offset,
            last_offset: next - 1,
            records_count,
        })
    }

    /// Appends batches replicated from the leader. Offsets are already
    /// assigned and must continue exactly at the local log end offset.
    pub fn append_replicated(&self, records: MemoryRecords) -> AppResult<LogAppendInfo> {
        let records_count = records.validate(self.log_config.max_record_batch_size)?;
        if records_count == 0 {
            return Err(AppError::CorruptRecord("append without records".into()));
        }

        let mut active = self.active.write();
        let expected = self.next_offset.load(Ordering::Acquire);
        let first_offset = records.first_base_offset().ok_or_else(|| {
            AppError::CorruptRecord("replicated batch without a base offset".into())
        })?;
        if first_offset != expected {
            return Err(AppError::IllegalState(format!(
                "replicated batch for {} starts at {} but local log end offset is {}",
                self.topic_partition, first_offset, expected
            )));
        }
        let next = records
            .next_offset()
            .ok_or_else(|| AppError::CorruptRecord("replicated batch truncated".into()))?;

        self.maybe_roll(&mut active, records.size())?;
        active.append(
            &records,
            first_offset,
            self.log_config.index_interval_bytes,
        )?;
        self.next_offset.store(next, Ordering::Release);

        Ok(LogAppendInfo {
            first_offset,
            last_offset: next - 1,
            records_count,
        })
    }

    /// Rolls the active segment when it hit its size cap, its index filled
    /// up, or it exceeded the jittered maximum age. The new segment's base
    /// offset is the current log end offset.
    fn maybe_roll(
        &self,
        active: &mut RwLockWriteGuard<'_, ActiveSegment>,
        incoming_bytes: usize,
    ) -> AppResult<()> {
        if active.size() == 0 {
            return Ok(());
        }
        let size_exceeded =
            active.size() + incoming_bytes as u64 >= self.log_config.segment_size;
        let age_exceeded = active.reached_max_age(self.log_config.segment_roll_ms);
        if !size_exceeded && !age_exceeded && !active.is_index_full() {
            return Ok(());
        }

        let new_base_offset = self.next_offset.load(Ordering::Acquire);
        debug!(
            "rolling segment for {}: old base {}, new base {}",
            self.topic_partition,
            active.base_offset(),
            new_base_offset
        );

        active.flush()?;
        self.recover_point
            .store(new_base_offset - 1, Ordering::Release);

        let new_segment = ActiveSegment::create(
            &self.dir,
            new_base_offset,
            self.log_config.index_file_size,
            self.log_config.segment_roll_jitter_ms,
        )?;
        let old_segment = std::mem::replace(&mut **active, new_segment);
        let old_base_offset = old_segment.base_offset();
        let readonly = old_segment.into_readonly()?;
        self.segments
            .write()
            .insert(old_base_offset, Arc::new(readonly));
        Ok(())
    }

    /// Forces a roll regardless of thresholds. Only used by tests and the
    /// cleaner's eligibility paths via the manager.
    pub fn roll_active_segment(&self) -> AppResult<()> {
        let mut active = self.active.write();
        if active.size() == 0 {
            return Ok(());
        }
        let new_base_offset = self.next_offset.load(Ordering::Acquire);
        active.flush()?;
        let new_segment = ActiveSegment::create(
            &self.dir,
            new_base_offset,
            self.log_config.index_file_size,
            self.log_config.segment_roll_jitter_ms,
        )?;
        let old_segment = std::mem::replace(&mut *active, new_segment);
        let old_base_offset = old_segment.base_offset();
        let readonly = old_segment.into_readonly()?;
        self.segments
            .write()
            .insert(old_base_offset, Arc::new(readonly));
        Ok(())
    }

    /// Flushes the active segment and advances the recovery point to the
    /// log end offset.
    pub fn flush(&self) -> AppResult<()> {
        self.active.write().flush()?;
        self.recover_point
            .store(self.next_offset.load(Ordering::Acquire) - 1, Ordering::Release);
        Ok(())
    }

    /// Discards records at and above `target`. The cut lands on a batch
    /// boundary, so the returned new log end offset may be below `target`.
    /// Used by a follower whose log runs past a newly elected leader's.
    pub fn truncate_to(&self, target: i64) -> AppResult<i64> {
        let mut active = self.active.write();
        let current_end = self.next_offset.load(Ordering::Acquire);
        if target >= current_end {
            return Ok(current_end);
        }
        let target = target.max(self.log_start_offset());

        if target < active.base_offset() {
            // the cut falls in a closed segment: make it active again and
            // drop everything newer
            let mut segments = self.segments.write();
            let reopen_base = segments
                .range(..=target)
                .next_back()
                .map(|(base, _)| *base)
                .ok_or_else(|| {
                    AppError::IllegalState(format!(
                        "{}: no segment covers offset {}",
                        self.topic_partition, target
                    ))
                })?;
            let reopened = ActiveSegment::reopen(
                &self.dir,
                reopen_base,
                self.log_config.index_file_size,
                self.log_config.segment_roll_jitter_ms,
                self.log_config.index_interval_bytes,
            )?;
            segments.remove(&reopen_base);
            let doomed: Vec<i64> = segments.range(reopen_base + 1..).map(|(b, _)| *b).collect();
            for base in doomed {
                segments.remove(&base);
                self.schedule_file_removal(base)?;
            }
            let old = std::mem::replace(&mut *active, reopened);
            let old_base = old.base_offset();
            drop(old);
            self.schedule_file_removal(old_base)?;
        }

        let next = active.truncate_to(target, self.log_config.index_interval_bytes)?;
        self.next_offset.store(next, Ordering::Release);
        self.recover_point.fetch_min(next - 1, Ordering::AcqRel);
        self.first_dirty_offset.fetch_min(next, Ordering::AcqRel);
        info!(
            "{}: truncated from {} to {}",
            self.topic_partition, current_end, next
        );
        Ok(next)
    }

    /// Discards the whole log and restarts it at `new_start`. Used when the
    /// leader no longer holds this replica's next offset.
    pub fn truncate_fully_and_start_at(&self, new_start: i64) -> AppResult<()> {
        let mut active = self.active.write();
        let mut segments = self.segments.write();
        let doomed: Vec<i64> = segments.keys().copied().collect();
        for base in doomed {
            segments.remove(&base);
            self.schedule_file_removal(base)?;
        }
        // rename the old active files first so a fresh segment can reuse
        // the name when the base offset is unchanged
        let old_base = active.base_offset();
        self.schedule_file_removal(old_base)?;
        *active = ActiveSegment::create(
            &self.dir,
            new_start,
            self.log_config.index_file_size,
            self.log_config.segment_roll_jitter_ms,
        )?;
        self.next_offset.store(new_start, Ordering::Release);
        self.log_start_offset.store(new_start, Ordering::Release);
        self.recover_point.store(new_start - 1, Ordering::Release);
        self.first_dirty_offset.store(new_start, Ordering::Release);
        info!(
            "{}: log discarded, restarting at {}",
            self.topic_partition, new_start
        );
        Ok(())
    }
}
