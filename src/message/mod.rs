//! Record framing and per-partition key types.

mod record;
mod topic_partition;

pub use record::{
    MemoryRecords, Record, RecordBatch, RecordBatchBuilder, LOG_OVERHEAD, RECORD_BATCH_HEADER_SIZE,
};
pub(crate) use record::{build_batch_buffer, encode_record};
pub use topic_partition::TopicPartition;
