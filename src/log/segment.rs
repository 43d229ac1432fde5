//! Log segments: one append-only data file plus a sparse offset index.
//!
//! At most one segment per partition log is active. Closed segments are
//! immutable and served through positioned reads without locking.

use std::fs::File;
use std::io::Write;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{Buf, Bytes, BytesMut};
use rand::Rng;
use tracing::{trace, warn};

use crate::log::index_file::{ReadOnlyIndexFile, WritableIndexFile};
use crate::message::{MemoryRecords, LOG_OVERHEAD, RECORD_BATCH_HEADER_SIZE};
use crate::{AppError, AppResult};

use super::{INDEX_FILE_SUFFIX, LOG_FILE_SUFFIX};

pub fn log_file_name(dir: impl AsRef<Path>, base_offset: i64) -> PathBuf {
    dir.as_ref()
        .join(format!("{:020}.{}", base_offset, LOG_FILE_SUFFIX))
}

pub fn index_file_name(dir: impl AsRef<Path>, base_offset: i64) -> PathBuf {
    dir.as_ref()
        .join(format!("{:020}.{}", base_offset, INDEX_FILE_SUFFIX))
}

pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// The writable segment with the highest base offset.
#[derive(Debug)]
pub struct ActiveSegment {
    base_offset: i64,
    file: File,
    index: WritableIndexFile,
    size: u64,
    bytes_since_last_index_entry: usize,
    created_ms: i64,
    /// Random subtraction from the configured max age so partitions do not
    /// roll in lockstep.
    roll_jitter_ms: u64,
}

impl ActiveSegment {
    pub fn create(
        dir: impl AsRef<Path>,
        base_offset: i64,
        index_file_size: usize,
        max_jitter_ms: u64,
    ) -> AppResult<Self> {
        let file = File::options()
            .read(true)
            .append(true)
            .create(true)
            .open(log_file_name(&dir, base_offset))?;
        let size = file.metadata()?.len();
        let index = WritableIndexFile::new(index_file_name(&dir, base_offset), index_file_size)?;
        let roll_jitter_ms = if max_jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=max_jitter_ms)
        };
        Ok(Self {
            base_offset,
            file,
            index,
            size,
            bytes_since_last_index_entry: 0,
            created_ms: now_ms(),
            roll_jitter_ms,
        })
    }

    /// Reopens a closed segment for writing, rebuilding its index from the
    /// data file. Used when a follower truncates back into an older segment.
    pub fn reopen(
        dir: impl AsRef<Path>,
        base_offset: i64,
        index_file_size: usize,
        max_jitter_ms: u64,
        index_interval_bytes: usize,
    ) -> AppResult<Self> {
        let mut segment = Self::create(dir, base_offset, index_file_size, max_jitter_ms)?;
        segment.recover(index_interval_bytes)?;
        Ok(segment)
    }

    pub fn base_offset(&self) -> i64 {
        self.base_offset
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn is_index_full(&self) -> bool {
        self.index.is_full()
    }

    /// Age-based roll check, jittered downward by a bounded random amount.
    pub fn reached_max_age(&self, max_age_ms: u64) -> bool {
        let age = now_ms().saturating_sub(self.created_ms) as u64;
        age >= max_age_ms.saturating_sub(self.roll_jitter_ms)
    }

    pub fn append(
        &mut self,
        records: &MemoryRecords,
        first_offset: i64,
        index_interval_bytes: usize,
    ) -> AppResult<()> {
        if self.bytes_since_last_index_entry >= index_interval_bytes {
            let relative_offset = (first_offset - self.base_offset) as u32;
            self.index.add_entry(relative_offset, self.size as u32)?;
            trace!(
                "segment {} wrote index entry {} -> {}",
                self.base_offset,
                relative_offset,
                self.size
            );
            self.bytes_since_last_index_entry = 0;
        }

        self.file.write_all(records.buffer())?;
        self.size += records.size() as u64;
        self.bytes_since_last_index_entry += records.size();
        Ok(())
    }

    pub fn read(&self, start_offset: i64, max_bytes: usize) -> AppResult<MemoryRecords> {
        let floor = self
            .index
            .lookup((start_offset - self.base_offset) as u32)
            .map(|(_, position)| position as u64)
            .unwrap_or(0);
        read_records_from(&self.file, self.size, floor, start_offset, max_bytes)
    }

    pub fn flush(&mut self) -> AppResult<()> {
        self.file.sync_data()?;
        self.index.flush()?;
        Ok(())
    }

    /// Rebuilds the sparse index by scanning the data file and truncates any
    /// partial batch left by a crash. Returns the offset after the last
    /// valid record.
    pub fn recover(&mut self, index_interval_bytes: usize) -> AppResult<i64> {
        let scan = scan_segment(&self.file, self.size, self.base_offset)?;
        if scan.valid_bytes < self.size {
            warn!(
                "segment {} truncating {} bytes of partial tail",
                self.base_offset,
                self.size - scan.valid_bytes
            );
            self.file.set_len(scan.valid_bytes)?;
            self.size = scan.valid_bytes;
        }

        self.index.reset();
        let mut since_last_entry = 0usize;
        for batch in scan.batch_positions {
            if since_last_entry >= index_interval_bytes {
                self.index.add_entry(batch.relative_offset, batch.position)?;
                since_last_entry = 0;
            }
            since_last_entry += batch.frame;
        }
        self.bytes_since_last_index_entry = since_last_entry;
        Ok(scan.next_offset)
    }

    /// Drops every batch whose records reach at or past `target`, cutting at
    /// the containing batch boundary, and rebuilds the index over what is
    /// left. Returns the new next offset, which may be below `target`.
    pub fn truncate_to(&mut self, target: i64, index_interval_bytes: usize) -> AppResult<i64> {
        let scan = scan_segment(&self.file, self.size, self.base_offset)?;
        let mut cut = 0u64;
        for batch in &scan.batch_positions {
            if batch.next_offset > target {
                break;
            }
            cut = batch.position as u64 + batch.frame as u64;
        }
        self.file.set_len(cut)?;
        self.size = cut;
        self.recover(index_interval_bytes)
    }

    pub fn into_readonly(self) -> AppResult<ReadOnlySegment> {
        self.file.sync_data()?;
        let index = self.index.into_readonly()?;
        Ok(ReadOnlySegment {
            base_offset: self.base_offset,
            next_offset_cache: AtomicI64::new(i64::MIN),
            file: self.file,
            index,
            size: self.size,
            last_modified_ms: now_ms(),
        })
    }
}

/// A closed, immutable segment.
#[derive(Debug)]
pub struct ReadOnlySegment {
    base_offset: i64,
    /// Offset after the last record, `i64::MIN` until first computed.
    next_offset_cache: AtomicI64,
    file: File,
    index: ReadOnlyIndexFile,
    size: u64,
    last_modified_ms: i64,
}

impl ReadOnlySegment {
    pub fn open(dir: impl AsRef<Path>, base_offset: i64) -> AppResult<Self> {
        let path = log_file_name(&dir, base_offset);
        let file = File::options().read(true).open(&path)?;
        let metadata = file.metadata()?;
        let last_modified_ms = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as i64)
            .unwrap_or_else(now_ms);
        let index = ReadOnlyIndexFile::open(index_file_name(&dir, base_offset))?;
        Ok(Self {
            base_offset,
            next_offset_cache: AtomicI64::new(i64::MIN),
            file,
            index,
            size: metadata.len(),
            last_modified_ms,
        })
    }

    pub fn base_offset(&self) -> i64 {
        self.base_offset
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn last_modified_ms(&self) -> i64 {
        self.last_modified_ms
    }

    pub fn index(&self) -> &ReadOnlyIndexFile {
        &self.index
    }

    pub fn read(&self, start_offset: i64, max_bytes: usize) -> AppResult<MemoryRecords> {
        let floor = self
            .index
            .lookup((start_offset - self.base_offset) as u32)
            .map(|(_, position)| position as u64)
            .unwrap_or(0);
        read_records_from(&self.file, self.size, floor, start_offset, max_bytes)
    }

    /// Offset after this segment's last record, scanning once and caching.
    pub fn next_offset(&self) -> AppResult<i64> {
        let cached = self.next_offset_cache.load(Ordering::Acquire);
        if cached != i64::MIN {
            return Ok(cached);
        }
        let scan = scan_segment(&self.file, self.size, self.base_offset)?;
        self.next_offset_cache
            .store(scan.next_offset, Ordering::Release);
        Ok(scan.next_offset)
    }
}

struct BatchPosition {
    relative_offset: u32,
    position: u32,
    frame: usize,
    /// Offset after the batch's last record.
    next_offset: i64,
}

struct SegmentScan {
    batch_positions: Vec<BatchPosition>,
    next_offset: i64,
    valid_bytes: u64,
}

/// Walks batch frames from the start of a segment file. Stops at the first
/// partial or unparsable frame, reporting only the valid prefix.
fn scan_segment(file: &File, size: u64, base_offset: i64) -> AppResult<SegmentScan> {
    let mut pos = 0u64;
    let mut next_offset = base_offset;
    let mut batch_positions = Vec::new();
    let mut header = [0u8; RECORD_BATCH_HEADER_SIZE];

    while pos + RECORD_BATCH_HEADER_SIZE as u64 <= size {
        file.read_exact_at(&mut header, pos)?;
        let batch_base = (&header[0..8]).get_i64();
        let batch_len = (&header[8..12]).get_u32() as u64;
        let last_delta = (&header[20..24]).get_u32();
        let frame = LOG_OVERHEAD as u64 + batch_len;
        if pos + frame > size || batch_base < base_offset {
            break;
        }
        next_offset = batch_base + last_delta as i64 + 1;
        batch_positions.push(BatchPosition {
            relative_offset: (batch_base - base_offset) as u32,
            position: pos as u32,
            frame: frame as usize,
            next_offset,
        });
        pos += frame;
    }

    Ok(SegmentScan {
        batch_positions,
        next_offset,
        valid_bytes: pos,
    })
}

/// Serves a read: skips whole batches that end before `start_offset`, then
/// returns up to `max_bytes` of complete batch frames.
fn read_records_from(
    file: &File,
    size: u64,
    mut pos: u64,
    start_offset: i64,
    max_bytes: usize,
) -> AppResult<MemoryRecords> {
    let mut header = [0u8; RECORD_BATCH_HEADER_SIZE];
    while pos + RECORD_BATCH_HEADER_SIZE as u64 <= size {
        file.read_exact_at(&mut header, pos)?;
        let batch_base = (&header[0..8]).get_i64();
        let batch_len = (&header[8..12]).get_u32() as u64;
        let last_delta = (&header[20..24]).get_u32();
        let frame = LOG_OVERHEAD as u64 + batch_len;
        if pos + frame > size {
            // partial tail still being written
            return Ok(MemoryRecords::empty());
        }
        if batch_base + last_delta as i64 + 1 > start_offset {
            break;
        }
        pos += frame;
    }
    if pos >= size {
        return Ok(MemoryRecords::empty());
    }

    let len = max_bytes.min((size - pos) as usize);
    if len < LOG_OVERHEAD {
        return Ok(MemoryRecords::empty());
    }
    let mut buf = BytesMut::zeroed(len);
    file.read_exact_at(&mut buf, pos)?;
    Ok(MemoryRecords::trim_to_complete_batches(Bytes::from(buf)))
}

/// Rewrites a closed segment's index from its data file. Used on recovery
/// when an index is missing or fails validation.
pub fn rebuild_index(
    dir: impl AsRef<Path>,
    base_offset: i64,
    index_file_size: usize,
    index_interval_bytes: usize,
) -> AppResult<()> {
    let file = File::options()
        .read(true)
        .open(log_file_name(&dir, base_offset))?;
    let size = file.metadata()?.len();
    let scan = scan_segment(&file, size, base_offset)?;

    let index_path = index_file_name(&dir, base_offset);
    let _ = std::fs::remove_file(&index_path);
    let mut index = WritableIndexFile::new(&index_path, index_file_size)?;
    let mut since_last_entry = 0usize;
    for batch in scan.batch_positions {
        if since_last_entry >= index_interval_bytes {
            index.add_entry(batch.relative_offset, batch.position)?;
            since_last_entry = 0;
        }
        since_last_entry += batch.frame;
    }
    index.into_readonly()?;
    Ok(())
}

/// Cheap consistency check of an index against its segment: every entry
/// must point inside the file at a plausible batch boundary.
pub fn index_is_consistent(index: &ReadOnlyIndexFile, segment_size: u64) -> bool {
    if index.entry_count() == 0 {
        return true;
    }
    match index.lookup(u32::MAX) {
        Some((_, position)) => (position as u64) < segment_size,
        None => false,
    }
}

/// Renames a segment's files with the given suffix, used to mark deletion
/// candidates before the delayed physical removal.
pub fn mark_for_deletion(dir: impl AsRef<Path>, base_offset: i64, suffix: &str) -> AppResult<(PathBuf, PathBuf)> {
    let log = log_file_name(&dir, base_offset);
    let index = index_file_name(&dir, base_offset);
    let log_renamed = log.with_extension(format!("{}.{}", LOG_FILE_SUFFIX, suffix));
    let index_renamed = index.with_extension(format!("{}.{}", INDEX_FILE_SUFFIX, suffix));
    std::fs::rename(&log, &log_renamed)
        .map_err(|e| AppError::DetailedIoError(format!("rename {:?} error: {}", log, e)))?;
    std::fs::rename(&index, &index_renamed)
        .map_err(|e| AppError::DetailedIoError(format!("rename {:?} error: {}", index, e)))?;
    Ok((log_renamed, index_renamed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::RecordBatchBuilder;
    use tempfile::TempDir;

    fn batch_at(offset: i64, payloads: &[&str]) -> MemoryRecords {
        let mut builder = RecordBatchBuilder::default();
        for payload in payloads {
            builder.append_record(None, payload.as_bytes(), now_ms());
        }
        let mut records = builder.build();
        records.assign_offsets(offset).unwrap();
        records
    }

    #[test]
    fn test_append_then_read_back() {
        let dir = TempDir::new().unwrap();
        let mut segment = ActiveSegment::create(dir.path(), 0, 1024, 0).unwrap();

        segment.append(&batch_at(0, &["a", "b"]), 0, 4096).unwrap();
        segment.append(&batch_at(2, &["c"]), 2, 4096).unwrap();

        let records = segment.read(0, usize::MAX).unwrap();
        assert_eq!(records.first_base_offset(), Some(0));
        assert_eq!(records.next_offset(), Some(3));

        // a read from the middle skips the first batch entirely
        let records = segment.read(2, usize::MAX).unwrap();
        assert_eq!(records.first_base_offset(), Some(2));
    }

    #[test]
    fn test_read_at_end_is_empty() {
        let dir = TempDir::new().unwrap();
        let mut segment = ActiveSegment::create(dir.path(), 0, 1024, 0).unwrap();
        segment.append(&batch_at(0, &["a"]), 0, 4096).unwrap();

        let records = segment.read(1, usize::MAX).unwrap();
        assert!(records.is_empty());
    }

    #[test]
    fn test_recover_truncates_partial_tail() {
        let dir = TempDir::new().unwrap();
        let mut segment = ActiveSegment::create(dir.path(), 0, 1024, 0).unwrap();
        segment.append(&batch_at(0, &["a", "b"]), 0, 4096).unwrap();
        let valid_size = segment.size();
        // simulate a torn write
        segment.file.write_all(&[1, 2, 3, 4, 5]).unwrap();
        segment.size += 5;

        let next = segment.recover(4096).unwrap();
        assert_eq!(next, 2);
        assert_eq!(segment.size(), valid_size);
    }

    #[test]
    fn test_truncate_cuts_at_batch_boundary() {
        let dir = TempDir::new().unwrap();
        let mut segment = ActiveSegment::create(dir.path(), 0, 1024, 0).unwrap();
        segment.append(&batch_at(0, &["a", "b"]), 0, 4096).unwrap();
        segment.append(&batch_at(2, &["c"]), 2, 4096).unwrap();
        segment.append(&batch_at(3, &["d", "e"]), 3, 4096).unwrap();

        // a target inside the last batch drops that whole batch
        assert_eq!(segment.truncate_to(4, 4096).unwrap(), 3);
        let records = segment.read(0, usize::MAX).unwrap();
        assert_eq!(records.next_offset(), Some(3));

        assert_eq!(segment.truncate_to(1, 4096).unwrap(), 0);
        assert_eq!(segment.size(), 0);
    }

    #[test]
    fn test_readonly_segment_read_and_next_offset() {
        let dir = TempDir::new().unwrap();
        let mut segment = ActiveSegment::create(dir.path(), 10, 1024, 0).unwrap();
        segment
            .append(&batch_at(10, &["x", "y", "z"]), 10, 4096)
            .unwrap();
        segment.into_readonly().unwrap();

        let readonly = ReadOnlySegment::open(dir.path(), 10).unwrap();
        assert_eq!(readonly.next_offset().unwrap(), 13);
        let records = readonly.read(11, usize::MAX).unwrap();
        assert_eq!(records.first_base_offset(), Some(10));
    }
}
