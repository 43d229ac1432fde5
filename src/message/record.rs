//! Record batch framing.
//!
//! A partition log is a sequence of batches. Each batch carries a fixed
//! header followed by varint-framed records:
//!
//! ```text
//! base_offset: i64 | batch_len: u32 | crc: u32 | records_count: u32 |
//! last_offset_delta: u32 | records...
//! ```
//!
//! `batch_len` counts everything after itself. The CRC covers everything
//! after the crc field, deliberately excluding `base_offset` so the leader
//! can assign offsets without recomputing checksums. Offset deltas inside a
//! batch are relative to `base_offset`; compaction may leave gaps, so
//! `last_offset_delta` is stored explicitly.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use integer_encoding::VarInt;

use crate::{AppError, AppResult};

/// base_offset(8) + batch_len(4)
pub const LOG_OVERHEAD: usize = 12;
/// crc(4) + records_count(4) + last_offset_delta(4)
pub const BATCH_HEADER_AFTER_LEN: usize = 12;
/// Smallest possible batch frame.
pub const RECORD_BATCH_HEADER_SIZE: usize = LOG_OVERHEAD + BATCH_HEADER_AFTER_LEN;

const CRC_COVER_START: usize = LOG_OVERHEAD + 4;

/// One decoded record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub offset: i64,
    pub timestamp: i64,
    pub key: Option<Bytes>,
    pub value: Bytes,
}

/// A single batch backed by a contiguous buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordBatch {
    buffer: Bytes,
}

impl RecordBatch {
    pub(crate) fn new(buffer: Bytes) -> Self {
        Self { buffer }
    }

    pub fn base_offset(&self) -> i64 {
        (&self.buffer[0..8]).get_i64()
    }

    pub fn batch_len(&self) -> usize {
        (&self.buffer[8..12]).get_u32() as usize
    }

    pub fn crc(&self) -> u32 {
        (&self.buffer[12..16]).get_u32()
    }

    pub fn records_count(&self) -> u32 {
        (&self.buffer[16..20]).get_u32()
    }

    pub fn last_offset_delta(&self) -> u32 {
        (&self.buffer[20..24]).get_u32()
    }

    /// Offset right after the last record of this batch.
    pub fn next_offset(&self) -> i64 {
        self.base_offset() + self.last_offset_delta() as i64 + 1
    }

    pub fn size(&self) -> usize {
        self.buffer.len()
    }

    pub fn buffer(&self) -> &Bytes {
        &self.buffer
    }

    pub fn validate_crc(&self) -> AppResult<()> {
        let expected = self.crc();
        let actual = crc32c::crc32c(&self.buffer[CRC_COVER_START..]);
        if expected != actual {
            return Err(AppError::CorruptRecord(format!(
                "crc mismatch at base offset {}: stored {:#x}, computed {:#x}",
                self.base_offset(),
                expected,
                actual
            )));
        }
        Ok(())
    }

    /// Decodes all records of the batch. Framing errors surface as
    /// `CorruptRecord`.
    pub fn records(&self) -> AppResult<Vec<Record>> {
        let base_offset = self.base_offset();
        let count = self.records_count() as usize;
        let mut records = Vec::with_capacity(count);
        let mut slice = &self.buffer[RECORD_BATCH_HEADER_SIZE..];

        for _ in 0..count {
            let (record_len, n): (u32, usize) = decode_varint(slice)?;
            slice = &slice[n..];
            if record_len as usize > slice.len() {
                return Err(AppError::CorruptRecord(format!(
                    "record length {} exceeds remaining batch bytes {}",
                    record_len,
                    slice.len()
                )));
            }
            let (mut body, rest) = slice.split_at(record_len as usize);
            slice = rest;

            let (offset_delta, n): (u32, usize) = decode_varint(body)?;
            body = &body[n..];
            let (timestamp, n): (i64, usize) = decode_varint(body)?;
            body = &body[n..];
            let (key_len, n): (i32, usize) = decode_varint(body)?;
            body = &body[n..];
            let key = if key_len < 0 {
                None
            } else {
                if key_len as usize > body.len() {
                    return Err(AppError::CorruptRecord("key length overruns record".into()));
                }
                let (key, rest) = body.split_at(key_len as usize);
                body = rest;
                Some(Bytes::copy_from_slice(key))
            };
            let (value_len, n): (u32, usize) = decode_varint(body)?;
            body = &body[n..];
            if value_len as usize != body.len() {
                return Err(AppError::CorruptRecord(format!(
                    "value length {} does not match remaining record bytes {}",
                    value_len,
                    body.len()
                )));
            }

            records.push(Record {
                offset: base_offset + offset_delta as i64,
                timestamp,
                key,
                value: Bytes::copy_from_slice(body),
            });
        }
        Ok(records)
    }
}

fn decode_varint<V: VarInt>(slice: &[u8]) -> AppResult<(V, usize)> {
    V::decode_var(slice).ok_or_else(|| AppError::CorruptRecord("truncated varint".into()))
}

/// A buffer of zero or more consecutive batches, as read from or written to
/// a segment file.
#[derive(Clone, PartialEq, Eq, Default)]
pub struct MemoryRecords {
    buffer: Bytes,
}

impl std::fmt::Debug for MemoryRecords {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryRecords")
            .field("buffer length", &self.buffer.len())
            .finish()
    }
}

impl MemoryRecords {
    pub fn new(buffer: Bytes) -> Self {
        Self { buffer }
    }

    pub fn empty() -> Self {
        Self {
            buffer: Bytes::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn size(&self) -> usize {
        self.buffer.len()
    }

    pub fn buffer(&self) -> &Bytes {
        &self.buffer
    }

    /// Drops a trailing partial batch, keeping only frames that are fully
    /// present. Used when slicing a byte range out of a segment file.
    pub fn trim_to_complete_batches(buffer: Bytes) -> Self {
        let mut end = 0usize;
        loop {
            let remaining = &buffer[end..];
            if remaining.len() < LOG_OVERHEAD {
                break;
            }
            let batch_len = (&remaining[8..12]).get_u32() as usize;
            let frame = LOG_OVERHEAD + batch_len;
            if frame > remaining.len() {
                break;
            }
            end += frame;
        }
        Self {
            buffer: buffer.slice(0..end),
        }
    }

    /// Walks the buffer and checks framing, per-batch size cap and CRCs.
    /// Returns the total record count.
    pub fn validate(&self, max_batch_size: usize) -> AppResult<u32> {
        let mut total = 0u32;
        for batch in self.batches() {
            let batch = batch?;
            if batch.size() > max_batch_size {
                return Err(AppError::MessageTooLarge {
                    actual: batch.size(),
                    limit: max_batch_size,
                });
            }
            batch.validate_crc()?;
            if batch.records_count() == 0 {
                return Err(AppError::CorruptRecord("empty record batch".into()));
            }
            total += batch.records_count();
        }
        Ok(total)
    }

    /// Rewrites every batch's base offset so the first record lands at
    /// `base_offset`. Returns the offset after the last record. Only valid
    /// for freshly produced batches whose deltas are contiguous.
    pub fn assign_offsets(&mut self, base_offset: i64) -> AppResult<i64> {
        let mut buf = BytesMut::from(&self.buffer[..]);
        let mut next = base_offset;
        let mut pos = 0usize;
        while pos + LOG_OVERHEAD <= buf.len() {
            let batch_len = (&buf[pos + 8..pos + 12]).get_u32() as usize;
            let frame = LOG_OVERHEAD + batch_len;
            if pos + frame > buf.len() {
                return Err(AppError::CorruptRecord("truncated record batch".into()));
            }
            let count = (&buf[pos + 16..pos + 20]).get_u32() as i64;
            buf[pos..pos + 8].copy_from_slice(&next.to_be_bytes());
            next += count;
            pos += frame;
        }
        self.buffer = buf.freeze();
        Ok(next)
    }

    pub fn first_base_offset(&self) -> Option<i64> {
        if self.buffer.len() >= 8 {
            Some((&self.buffer[0..8]).get_i64())
        } else {
            None
        }
    }

    /// Offset right after the last record, or `None` on an empty buffer.
    pub fn next_offset(&self) -> Option<i64> {
        let mut last = None;
        for batch in self.batches() {
            match batch {
                Ok(batch) => last = Some(batch.next_offset()),
                Err(_) => break,
            }
        }
        last
    }

    pub fn batches(&self) -> BatchIter<'_> {
        BatchIter {
            records: self,
            pos: 0,
        }
    }
}

pub struct BatchIter<'a> {
    records: &'a MemoryRecords,
    pos: usize,
}

impl Iterator for BatchIter<'_> {
    type Item = AppResult<RecordBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        let buffer = &self.records.buffer;
        if self.pos >= buffer.len() {
            return None;
        }
        let remaining = buffer.len() - self.pos;
        if remaining < RECORD_BATCH_HEADER_SIZE {
            return Some(Err(AppError::CorruptRecord(format!(
                "dangling {} bytes are smaller than a batch header",
                remaining
            ))));
        }
        let batch_len = (&buffer[self.pos + 8..self.pos + 12]).get_u32() as usize;
        let frame = LOG_OVERHEAD + batch_len;
        if frame > remaining {
            return Some(Err(AppError::CorruptRecord(format!(
                "batch frame of {} bytes overruns buffer ({} remaining)",
                frame, remaining
            ))));
        }
        let batch = RecordBatch::new(buffer.slice(self.pos..self.pos + frame));
        self.pos += frame;
        Some(Ok(batch))
    }
}

/// Builds a single batch. Offset deltas are assigned contiguously from
/// zero; the leader rewrites the base offset on append.
#[derive(Default)]
pub struct RecordBatchBuilder {
    records: BytesMut,
    count: u32,
}

impl RecordBatchBuilder {
    pub fn append_record(&mut self, key: Option<&[u8]>, value: &[u8], timestamp: i64) {
        encode_record(&mut self.records, self.count, timestamp, key, value);
        self.count += 1;
    }

    pub fn records_count(&self) -> u32 {
        self.count
    }

    pub fn build(self) -> MemoryRecords {
        build_batch_buffer(0, self.count, self.count.saturating_sub(1), &self.records)
    }
}

/// Encodes one length-prefixed record body into `records`.
pub(crate) fn encode_record(
    records: &mut BytesMut,
    offset_delta: u32,
    timestamp: i64,
    key: Option<&[u8]>,
    value: &[u8],
) {
    let mut body = Vec::with_capacity(value.len() + key.map_or(0, |k| k.len()) + 24);
    body.extend(offset_delta.encode_var_vec());
    body.extend(timestamp.encode_var_vec());
    match key {
        Some(key) => {
            body.extend((key.len() as i32).encode_var_vec());
            body.extend_from_slice(key);
        }
        None => body.extend((-1i32).encode_var_vec()),
    }
    body.extend((value.len() as u32).encode_var_vec());
    body.extend_from_slice(value);

    records.extend((body.len() as u32).encode_var_vec());
    records.extend_from_slice(&body);
}

/// Assembles a full batch frame around already-encoded record bodies.
/// Shared by the builder and the log cleaner's segment rewrite.
pub(crate) fn build_batch_buffer(
    base_offset: i64,
    records_count: u32,
    last_offset_delta: u32,
    records: &[u8],
) -> MemoryRecords {
    let batch_len = BATCH_HEADER_AFTER_LEN + records.len();
    let mut buf = BytesMut::with_capacity(LOG_OVERHEAD + batch_len);
    buf.put_i64(base_offset);
    buf.put_u32(batch_len as u32);
    buf.put_u32(0); // crc placeholder
    buf.put_u32(records_count);
    buf.put_u32(last_offset_delta);
    buf.extend_from_slice(records);

    let crc = crc32c::crc32c(&buf[CRC_COVER_START..]);
    buf[12..16].copy_from_slice(&crc.to_be_bytes());
    MemoryRecords::new(buf.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_records() -> MemoryRecords {
        let mut builder = RecordBatchBuilder::default();
        builder.append_record(Some(b"key1"), b"value1", 1000);
        builder.append_record(None, b"value2", 1001);
        builder.build()
    }

    #[test]
    fn test_build_and_decode_round_trip() {
        let records = sample_records();
        assert_eq!(records.validate(1024).unwrap(), 2);

        let batch = records.batches().next().unwrap().unwrap();
        assert_eq!(batch.records_count(), 2);
        assert_eq!(batch.last_offset_delta(), 1);

        let decoded = batch.records().unwrap();
        assert_eq!(decoded[0].key.as_deref(), Some(b"key1".as_ref()));
        assert_eq!(decoded[0].value.as_ref(), b"value1");
        assert_eq!(decoded[0].timestamp, 1000);
        assert_eq!(decoded[1].key, None);
        assert_eq!(decoded[1].offset, 1);
    }

    #[test]
    fn test_assign_offsets_rewrites_base_without_breaking_crc() {
        let mut records = sample_records();
        let next = records.assign_offsets(40).unwrap();
        assert_eq!(next, 42);
        assert_eq!(records.first_base_offset(), Some(40));
        assert_eq!(records.next_offset(), Some(42));
        // crc excludes the base offset on purpose
        records.validate(1024).unwrap();
    }

    #[test]
    fn test_corrupted_payload_fails_crc() {
        let records = sample_records();
        let mut raw = BytesMut::from(&records.buffer()[..]);
        let last = raw.len() - 1;
        raw[last] ^= 0xff;
        let corrupted = MemoryRecords::new(raw.freeze());
        let err = corrupted.validate(1024).unwrap_err();
        assert!(matches!(err, AppError::CorruptRecord(_)));
    }

    #[test]
    fn test_oversized_batch_rejected() {
        let records = sample_records();
        let err = records.validate(8).unwrap_err();
        assert!(matches!(err, AppError::MessageTooLarge { .. }));
    }

    #[test]
    fn test_trim_drops_partial_tail() {
        let records = sample_records();
        let size = records.size();
        let mut raw = BytesMut::from(&records.buffer()[..]);
        raw.extend_from_slice(&records.buffer()[..size / 2]);
        let trimmed = MemoryRecords::trim_to_complete_batches(raw.freeze());
        assert_eq!(trimmed.size(), size);
        assert_eq!(trimmed.batches().count(), 1);
    }
}
