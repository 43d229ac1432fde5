mod log;
mod message;
mod quota;
mod replica;
mod service;
mod utils;

pub use log::now_ms;
pub use log::{
    CheckPointFile, CleanupPolicy, LogAppendInfo, LogCleaner, LogFetchInfo, LogManager,
    MinRetainedOffsetFn, PartitionLog,
};
pub use message::{MemoryRecords, Record, RecordBatch, RecordBatchBuilder, TopicPartition};
pub use quota::{QuotaDirection, QuotaLimiter, QuotaManager};
pub use replica::{
    AckMode, FetchRequest, FetchResponse, FetchTransport, Partition, PartitionFetchData,
    PartitionFetchRequest, PartitionFetchResponse, PartitionStatus, ReplicaFetcherManager,
    ReplicaManager, CONSUMER_REPLICA_ID,
};
pub use service::{
    setup_local_tracing, setup_tracing, AppError, AppResult, BrokerConfig, CleanerConfig,
    GeneralConfig, LogConfig, QuotaConfig, ReplicationConfig, Shutdown,
};
pub use utils::KvStore;
