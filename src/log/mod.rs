//! Segment store: per-partition on-disk logs.
//!
//! This module provides functionality for:
//! - Log segment management and rolling
//! - Sparse offset index files
//! - Checkpoint handling
//! - Retention sweeps and log compaction

mod checkpoint;
mod cleaner;
mod index_file;
mod log_manager;
mod partition_log;
mod segment;

pub use checkpoint::CheckPointFile;
pub use cleaner::LogCleaner;
pub use log_manager::{LogManager, MinRetainedOffsetFn};
pub use partition_log::PartitionLog;
pub use segment::now_ms;

// File name constants
const RECOVERY_POINT_FILE_NAME: &str = ".recovery_checkpoints";
pub(crate) const HW_CHECKPOINT_FILE_NAME: &str = ".high_watermark_checkpoints";
const INDEX_FILE_SUFFIX: &str = "index";
const LOG_FILE_SUFFIX: &str = "log";
const DELETED_FILE_SUFFIX: &str = "deleted";
const CLEANED_FILE_SUFFIX: &str = "cleaned";

/// How a partition log reclaims space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CleanupPolicy {
    /// Drop whole segments past the retention limits.
    Delete,
    /// Keep only the latest record per key.
    Compact,
}

/// Information about a log append operation.
#[derive(Debug, Clone)]
pub struct LogAppendInfo {
    /// First offset assigned to the batch
    pub first_offset: i64,
    /// Last offset assigned to the batch
    pub last_offset: i64,
    /// Number of records in the batch
    pub records_count: u32,
}

/// Result of a log read.
#[derive(Debug)]
pub struct LogFetchInfo {
    pub records: crate::message::MemoryRecords,
    pub log_start_offset: i64,
    pub log_end_offset: i64,
}
