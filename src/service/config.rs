use std::path::Path;

use serde::{Deserialize, Serialize};

use super::{AppError, AppResult};

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct GeneralConfig {
    /// broker id of the local replica
    pub id: i32,
    pub data_dir: String,
    pub metadata_db_path: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            id: 0,
            data_dir: "data".to_string(),
            metadata_db_path: "data/metadata.db".to_string(),
        }
    }
}

/// Segment store tunables for every partition log on this broker.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LogConfig {
    /// The byte cap of a single segment file.
    pub segment_size: u64,
    /// Maximum age of the active segment before it is rolled, in ms.
    pub segment_roll_ms: u64,
    /// Upper bound of the random subtraction applied to `segment_roll_ms`
    /// so partitions do not roll in lockstep.
    pub segment_roll_jitter_ms: u64,
    /// The size of each sparse offset index file.
    pub index_file_size: usize,
    /// The interval in bytes at which index entries are written.
    pub index_interval_bytes: usize,
    /// Largest accepted record batch.
    pub max_record_batch_size: usize,
    /// Time-based retention, in ms.
    pub retention_ms: u64,
    /// Size-based retention over the whole partition log; -1 disables it.
    pub retention_bytes: i64,
    /// Grace period between marking a segment deleted and unlinking it.
    pub file_delete_delay_ms: u64,
    /// The interval at which the retention sweep runs.
    pub retention_check_interval_ms: u64,
    /// The interval at which recovery checkpoints are written.
    pub recovery_checkpoint_interval_ms: u64,
    /// The interval at which high watermark checkpoints are written.
    pub high_watermark_checkpoint_interval_ms: u64,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            segment_size: 1024 * 1024 * 1024,
            segment_roll_ms: 7 * 24 * 60 * 60 * 1000,
            segment_roll_jitter_ms: 0,
            index_file_size: 10 * 1024 * 1024,
            index_interval_bytes: 4096,
            max_record_batch_size: 1024 * 1024,
            retention_ms: 7 * 24 * 60 * 60 * 1000,
            retention_bytes: -1,
            file_delete_delay_ms: 60_000,
            retention_check_interval_ms: 300_000,
            recovery_checkpoint_interval_ms: 60_000,
            high_watermark_checkpoint_interval_ms: 5_000,
        }
    }
}

/// Log compaction tunables, shared by all cleaner threads.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CleanerConfig {
    pub enable: bool,
    pub num_threads: usize,
    /// Total memory budget for the key -> offset dedupe maps, split across
    /// the cleaner threads.
    pub dedupe_buffer_size: usize,
    /// A log is only eligible once dirty bytes / total bytes exceeds this.
    pub min_cleanable_ratio: f64,
    /// Aggregate throughput cap across all cleaner threads, bytes/sec.
    pub io_max_bytes_per_second: u64,
    /// Pause between cleaning passes when nothing was eligible.
    pub backoff_ms: u64,
}

impl Default for CleanerConfig {
    fn default() -> Self {
        Self {
            enable: true,
            num_threads: num_cpus::get(),
            dedupe_buffer_size: 128 * 1024 * 1024,
            min_cleanable_ratio: 0.5,
            io_max_bytes_per_second: u64::MAX,
            backoff_ms: 15_000,
        }
    }
}

/// Follower fetch protocol and ISR membership tunables.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// A follower that has not caught up within this window leaves the ISR.
    pub lag_time_max_ms: u64,
    /// How long the leader may park a fetch waiting for min bytes.
    pub fetch_wait_max_ms: u64,
    /// The leader accumulates at least this many bytes before responding,
    /// up to the wait cap.
    pub fetch_min_bytes: usize,
    /// Byte budget per partition in one fetch request.
    pub fetch_max_bytes: usize,
    /// Backoff applied to a partition after a failed fetch.
    pub fetch_backoff_ms: u64,
    /// Transport-level timeout an issued fetch must stay under.
    pub socket_timeout_ms: u64,
    /// Minimum ISR size for acks=all produces to succeed.
    pub min_insync_replicas: usize,
    /// Whether a replica outside the last known ISR may be elected leader.
    pub unclean_leader_election_enable: bool,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            lag_time_max_ms: 30_000,
            fetch_wait_max_ms: 500,
            fetch_min_bytes: 1,
            fetch_max_bytes: 1024 * 1024,
            fetch_backoff_ms: 1_000,
            socket_timeout_ms: 30_000,
            min_insync_replicas: 1,
            unclean_leader_election_enable: false,
        }
    }
}

/// Replication quota tunables. Rates are bytes/sec sampled over
/// `window_num` rolling windows of `window_size_ms`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QuotaConfig {
    /// Default rate for serving follower fetches (leader side).
    pub leader_replication_rate: u64,
    /// Default rate for issuing fetches (follower side).
    pub follower_replication_rate: u64,
    pub window_num: usize,
    pub window_size_ms: u64,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            leader_replication_rate: u64::MAX,
            follower_replication_rate: u64::MAX,
            window_num: 11,
            window_size_ms: 1_000,
        }
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    pub general: GeneralConfig,
    pub log: LogConfig,
    pub cleaner: CleanerConfig,
    pub replication: ReplicationConfig,
    pub quota: QuotaConfig,
}

impl BrokerConfig {
    /// Loads and validates a broker config from a TOML file.
    pub fn set_up_config<P: AsRef<Path>>(path: P) -> AppResult<BrokerConfig> {
        let path_str = path
            .as_ref()
            .to_str()
            .ok_or_else(|| {
                AppError::InvalidValue(format!(
                    "config file path: {}",
                    path.as_ref().to_string_lossy()
                ))
            })?;
        let config = config::Config::builder()
            .add_source(config::File::with_name(path_str))
            .build()?;

        let broker_config: BrokerConfig = config.try_deserialize()?;
        broker_config.validate()?;
        Ok(broker_config)
    }

    /// Checks numeric bounds and cross-field constraints. Invalid
    /// combinations fail fast instead of silently picking a default.
    pub fn validate(&self) -> AppResult<()> {
        let invalid = |msg: String| Err(AppError::InvalidConfig(msg));

        if self.log.segment_size == 0 {
            return invalid("log.segment_size must be positive".into());
        }
        if self.log.index_interval_bytes == 0 {
            return invalid("log.index_interval_bytes must be positive".into());
        }
        if self.log.segment_roll_jitter_ms > self.log.segment_roll_ms {
            return invalid(format!(
                "log.segment_roll_jitter_ms ({}) must not exceed log.segment_roll_ms ({})",
                self.log.segment_roll_jitter_ms, self.log.segment_roll_ms
            ));
        }
        if self.log.max_record_batch_size as u64 > self.log.segment_size {
            return invalid(format!(
                "log.max_record_batch_size ({}) must not exceed log.segment_size ({})",
                self.log.max_record_batch_size, self.log.segment_size
            ));
        }

        let repl = &self.replication;
        if repl.fetch_wait_max_ms > repl.socket_timeout_ms {
            return invalid(format!(
                "replication.fetch_wait_max_ms ({}) must not exceed replication.socket_timeout_ms ({})",
                repl.fetch_wait_max_ms, repl.socket_timeout_ms
            ));
        }
        if repl.socket_timeout_ms > repl.lag_time_max_ms {
            return invalid(format!(
                "replication.socket_timeout_ms ({}) must not exceed replication.lag_time_max_ms ({})",
                repl.socket_timeout_ms, repl.lag_time_max_ms
            ));
        }
        if repl.min_insync_replicas == 0 {
            return invalid("replication.min_insync_replicas must be at least 1".into());
        }
        if repl.fetch_max_bytes == 0 {
            return invalid("replication.fetch_max_bytes must be positive".into());
        }

        const MIN_DEDUPE_BUFFER_PER_THREAD: usize = 1024 * 1024;
        let cleaner = &self.cleaner;
        if cleaner.num_threads == 0 {
            return invalid("cleaner.num_threads must be at least 1".into());
        }
        if cleaner.dedupe_buffer_size / cleaner.num_threads < MIN_DEDUPE_BUFFER_PER_THREAD {
            return invalid(format!(
                "cleaner.dedupe_buffer_size ({}) split over {} threads is below the {} bytes per-thread floor",
                cleaner.dedupe_buffer_size, cleaner.num_threads, MIN_DEDUPE_BUFFER_PER_THREAD
            ));
        }
        if !(0.0..=1.0).contains(&cleaner.min_cleanable_ratio) {
            return invalid(format!(
                "cleaner.min_cleanable_ratio ({}) must be within [0.0, 1.0]",
                cleaner.min_cleanable_ratio
            ));
        }

        if self.quota.window_num == 0 || self.quota.window_size_ms == 0 {
            return invalid("quota windows must be positive".into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = BrokerConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_fetch_wait_must_not_exceed_socket_timeout() {
        let mut config = BrokerConfig::default();
        config.replication.fetch_wait_max_ms = 60_000;
        let err = config.validate().unwrap_err();
        assert!(matches!(err, AppError::InvalidConfig(_)));
    }

    #[test]
    fn test_socket_timeout_must_not_exceed_lag_time() {
        let mut config = BrokerConfig::default();
        config.replication.socket_timeout_ms = 60_000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_dedupe_buffer_per_thread_floor() {
        let mut config = BrokerConfig::default();
        config.cleaner.num_threads = 4;
        config.cleaner.dedupe_buffer_size = 2 * 1024 * 1024;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_jitter_bounded_by_roll_time() {
        let mut config = BrokerConfig::default();
        config.log.segment_roll_ms = 1_000;
        config.log.segment_roll_jitter_ms = 2_000;
        assert!(config.validate().is_err());
    }
}
