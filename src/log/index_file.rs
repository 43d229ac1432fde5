use std::fs::File;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

use memmap2::{Mmap, MmapMut, MmapOptions};

use crate::{AppError, AppResult};

/// relative_offset(4) + position(4), both big-endian
pub const INDEX_ENTRY_SIZE: usize = 8;

/// Immutable index of a closed segment.
#[derive(Debug)]
pub struct ReadOnlyIndexFile {
    mmap: Mmap,
    entries: usize,
}

/// Index of the active segment, preallocated to its maximum size and
/// truncated down to the written entries when the segment is closed.
#[derive(Debug)]
pub struct WritableIndexFile {
    file: File,
    mmap: MmapMut,
    entries: AtomicUsize,
    max_entry_count: usize,
}

impl ReadOnlyIndexFile {
    pub fn open<P: AsRef<Path>>(path: P) -> std::io::Result<Self> {
        let file = File::options().read(true).open(path.as_ref())?;
        let len = file.metadata()?.len() as usize;
        let entries = len / INDEX_ENTRY_SIZE;

        let mmap = unsafe { MmapOptions::new().map(&file)? };

        Ok(Self { mmap, entries })
    }

    /// Largest indexed entry at or below `target_offset`, as
    /// `(relative_offset, file_position)`. `Some((0, 0))` means "scan the
    /// segment from the start".
    pub fn lookup(&self, target_offset: u32) -> Option<(u32, u32)> {
        binary_search_index(&self.mmap[..], self.entries, target_offset)
    }

    pub fn entry_count(&self) -> usize {
        self.entries
    }
}

impl WritableIndexFile {
    pub fn new<P: AsRef<Path>>(file_name: P, max_size: usize) -> std::io::Result<Self> {
        let file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .open(file_name.as_ref())?;

        file.set_len(max_size as u64)?;

        let mmap = unsafe { MmapOptions::new().map_mut(&file)? };

        Ok(Self {
            file,
            mmap,
            entries: AtomicUsize::new(0),
            max_entry_count: max_size / INDEX_ENTRY_SIZE,
        })
    }

    pub fn add_entry(&mut self, relative_offset: u32, position: u32) -> AppResult<()> {
        let entries = self.entries.load(Ordering::Acquire);

        if entries + 1 > self.max_entry_count {
            return Err(AppError::IllegalState("index file is full".into()));
        }

        let offset = entries * INDEX_ENTRY_SIZE;
        self.mmap[offset..offset + 4].copy_from_slice(&relative_offset.to_be_bytes());
        self.mmap[offset + 4..offset + 8].copy_from_slice(&position.to_be_bytes());
        self.entries.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    pub fn lookup(&self, target_offset: u32) -> Option<(u32, u32)> {
        let entries = self.entries.load(Ordering::Acquire);
        binary_search_index(&self.mmap[..], entries, target_offset)
    }

    pub fn is_full(&self) -> bool {
        self.entries.load(Ordering::Acquire) + 1 > self.max_entry_count
    }

    /// Drops all entries. Used when an index is rebuilt from its segment
    /// during recovery.
    pub fn reset(&mut self) {
        self.entries.store(0, Ordering::Release);
    }

    pub fn flush(&self) -> AppResult<()> {
        self.mmap
            .flush()
            .map_err(|e| AppError::DetailedIoError(format!("flush index file error: {}", e)))
    }

    /// Truncates the preallocated file to the written entries and converts
    /// it into the read-only form used for closed segments.
    pub fn into_readonly(self) -> std::io::Result<ReadOnlyIndexFile> {
        let entries = self.entries.load(Ordering::Acquire);

        self.mmap.flush()?;
        drop(self.mmap);
        self.file.set_len((entries * INDEX_ENTRY_SIZE) as u64)?;

        let readonly_mmap = unsafe { MmapOptions::new().map(&self.file)? };

        Ok(ReadOnlyIndexFile {
            mmap: readonly_mmap,
            entries,
        })
    }
}

fn binary_search_index(slice: &[u8], entries: usize, target_offset: u32) -> Option<(u32, u32)> {
    if entries == 0 {
        return Some((0, 0));
    }

    let read_offset =
        |i: usize| u32::from_be_bytes(slice[i * 8..i * 8 + 4].try_into().unwrap());
    let read_position =
        |i: usize| u32::from_be_bytes(slice[i * 8 + 4..i * 8 + 8].try_into().unwrap());

    if target_offset < read_offset(0) {
        return Some((0, 0));
    }

    let mut left = 0;
    let mut right = entries - 1;
    while left < right {
        // bias towards the upper half so the loop converges on the largest
        // entry <= target
        let mid = (left + right + 1) / 2;
        if read_offset(mid) > target_offset {
            right = mid - 1;
        } else {
            left = mid;
        }
    }
    Some((read_offset(left), read_position(left)))
}
