// Copyright 2025 the slatemq authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Broker-wide registry of partition logs plus the periodic background
//! tasks that keep them durable and bounded: recovery checkpointing and
//! the retention sweep.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::{broadcast, mpsc};
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use crate::log::{
    CheckPointFile, CleanupPolicy, PartitionLog, RECOVERY_POINT_FILE_NAME,
};
use crate::message::TopicPartition;
use crate::service::Shutdown;
use crate::{AppResult, BrokerConfig};

/// Supplies the lowest offset that must stay readable for a partition.
/// The replica layer plugs in the high watermark here; without it the
/// whole log is considered safe to reclaim.
pub type MinRetainedOffsetFn = dyn Fn(&TopicPartition) -> Option<i64> + Send + Sync;

pub struct LogManager {
    config: Arc<BrokerConfig>,
    logs: DashMap<TopicPartition, Arc<PartitionLog>>,
    recovery_checkpoint: CheckPointFile,
    /// Recovery points read once at startup, consumed as logs are opened.
    recovered_points: HashMap<TopicPartition, i64>,
    min_retained_offset_fn: RwLock<Option<Arc<MinRetainedOffsetFn>>>,
    notify_shutdown: broadcast::Sender<()>,
    shutdown_complete_tx: mpsc::Sender<()>,
}

impl LogManager {
    pub async fn new(
        config: Arc<BrokerConfig>,
        notify_shutdown: broadcast::Sender<()>,
        shutdown_complete_tx: mpsc::Sender<()>,
    ) -> AppResult<Arc<Self>> {
        let data_dir = Path::new(&config.general.data_dir);
        std::fs::create_dir_all(data_dir)?;

        let recovery_checkpoint = CheckPointFile::new(data_dir.join(RECOVERY_POINT_FILE_NAME));
        let recovered_points = recovery_checkpoint.read_checkpoints().await?;
        info!(
            "log manager starting with {} recovery points from {:?}",
            recovered_points.len(),
            recovery_checkpoint.path()
        );

        Ok(Arc::new(Self {
            config,
            logs: DashMap::new(),
            recovery_checkpoint,
            recovered_points,
            min_retained_offset_fn: RwLock::new(None),
            notify_shutdown,
            shutdown_complete_tx,
        }))
    }

    /// Opens the partition log, creating it on first use. Subsequent calls
    /// return the same instance.
    pub fn get_or_create_log(
        &self,
        topic_partition: &TopicPartition,
        cleanup_policy: CleanupPolicy,
    ) -> AppResult<Arc<PartitionLog>> {
        match self.logs.entry(topic_partition.clone()) {
            Entry::Occupied(entry) => Ok(entry.get().clone()),
            Entry::Vacant(entry) => {
                let recover_point = self
                    .recovered_points
                    .get(topic_partition)
                    .copied()
                    .unwrap_or(-1);
                let log = Arc::new(PartitionLog::open(
                    topic_partition.clone(),
                    &self.config.general.data_dir,
                    self.config.log.clone(),
                    cleanup_policy,
                    recover_point,
                )?);
                entry.insert(log.clone());
                Ok(log)
            }
        }
    }

    pub fn get_log(&self, topic_partition: &TopicPartition) -> Option<Arc<PartitionLog>> {
        self.logs.get(topic_partition).map(|log| log.clone())
    }

    /// Snapshot of all open logs.
    pub fn all_logs(&self) -> Vec<Arc<PartitionLog>> {
        self.logs.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn set_min_retained_offset_fn(&self, f: Arc<MinRetainedOffsetFn>) {
        *self.min_retained_offset_fn.write() = Some(f);
    }

    fn min_retained_offset(&self, log: &PartitionLog) -> i64 {
        let source = self.min_retained_offset_fn.read().clone();
        source
            .and_then(|f| f(log.topic_partition()))
            .unwrap_or_else(|| log.next_offset())
    }

    /// Spawns the recovery checkpoint writer and the retention sweep. Both
    /// run until the shutdown broadcast fires.
    pub fn start_background_tasks(self: &Arc<Self>) {
        let manager = self.clone();
        let shutdown = Shutdown::new(self.notify_shutdown.subscribe());
        let shutdown_complete = self.shutdown_complete_tx.clone();
        tokio::spawn(async move {
            manager.recovery_checkpoint_task(shutdown).await;
            drop(shutdown_complete);
        });

        let manager = self.clone();
        let shutdown = Shutdown::new(self.notify_shutdown.subscribe());
        let shutdown_complete = self.shutdown_complete_tx.clone();
        tokio::spawn(async move {
            manager.retention_task(shutdown).await;
            drop(shutdown_complete);
        });
    }

    async fn recovery_checkpoint_task(&self, mut shutdown: Shutdown) {
        let mut ticker = interval(Duration::from_millis(
            self.config.log.recovery_checkpoint_interval_ms,
        ));
        while !shutdown.is_shutdown() {
            tokio::select! {
                _ = ticker.tick() => {
                    // failures are retried on the next tick
                    if let Err(e) = self.checkpoint_recovery_points().await {
                        warn!("recovery checkpoint write failed: {}", e);
                    }
                }
                _ = shutdown.recv() => {
                    info!("recovery checkpoint task shutting down");
                    if let Err(e) = self.flush_all() {
                        error!("flush on shutdown failed: {}", e);
                    }
                    if let Err(e) = self.checkpoint_recovery_points().await {
                        error!("final recovery checkpoint write failed: {}", e);
                    }
                }
            }
        }
    }

    /// Writes every open log's recovery point to the checkpoint file.
    pub async fn checkpoint_recovery_points(&self) -> AppResult<()> {
        let points: HashMap<TopicPartition, i64> = self
            .logs
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().recover_point()))
            .collect();
        debug!("writing {} recovery checkpoints", points.len());
        self.recovery_checkpoint.write_checkpoints(points).await
    }

    /// Flushes every open log to disk.
    pub fn flush_all(&self) -> AppResult<()> {
        for entry in self.logs.iter() {
            entry.value().flush()?;
        }
        Ok(())
    }

    async fn retention_task(&self, mut shutdown: Shutdown) {
        let mut ticker = interval(Duration::from_millis(
            self.config.log.retention_check_interval_ms,
        ));
        loop {
            tokio::select! {
                _ = ticker.tick() => self.retention_sweep(),
                _ = shutdown.recv() => {
                    info!("retention task shutting down");
                    return;
                }
            }
        }
    }

    /// One pass over all delete-policy logs, reclaiming segments past the
    /// retention limits. Per-log failures are logged and skipped so one bad
    /// partition cannot stall the sweep.
    fn retention_sweep(&self) {
        for entry in self.logs.iter() {
            let log = entry.value();
            if log.cleanup_policy() != CleanupPolicy::Delete {
                continue;
            }
            let min_retained = self.min_retained_offset(log);
            match log.delete_old_segments(min_retained) {
                Ok(0) => {}
                Ok(n) => debug!("{}: retention reclaimed {} segments", entry.key(), n),
                Err(e) => warn!("{}: retention sweep failed: {}", entry.key(), e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::now_ms;
    use crate::message::RecordBatchBuilder;
    use tempfile::TempDir;

    fn test_manager_config(dir: &TempDir) -> Arc<BrokerConfig> {
        let mut config = BrokerConfig::default();
        config.general.data_dir = dir.path().to_string_lossy().into_owned();
        config.log.segment_size = 200;
        config.log.index_file_size = 1024;
        config.log.index_interval_bytes = 1;
        config.log.retention_bytes = 0;
        config.log.file_delete_delay_ms = 0;
        Arc::new(config)
    }

    async fn new_manager(config: Arc<BrokerConfig>) -> Arc<LogManager> {
        let (notify_shutdown, _) = broadcast::channel(1);
        let (shutdown_complete_tx, _) = mpsc::channel(1);
        LogManager::new(config, notify_shutdown, shutdown_complete_tx)
            .await
            .unwrap()
    }

    fn produce(log: &PartitionLog, payloads: &[&str]) {
        let mut builder = RecordBatchBuilder::default();
        for payload in payloads {
            builder.append_record(None, payload.as_bytes(), now_ms());
        }
        log.append_records(builder.build()).unwrap();
    }

    #[tokio::test]
    async fn test_get_or_create_returns_same_log() {
        let dir = TempDir::new().unwrap();
        let manager = new_manager(test_manager_config(&dir)).await;
        let tp = TopicPartition::new("orders", 0);

        let first = manager.get_or_create_log(&tp, CleanupPolicy::Delete).unwrap();
        let second = manager.get_or_create_log(&tp, CleanupPolicy::Delete).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(manager.get_log(&tp).is_some());
    }

    #[tokio::test]
    async fn test_recovery_points_survive_restart() {
        let dir = TempDir::new().unwrap();
        let config = test_manager_config(&dir);
        let tp = TopicPartition::new("orders", 0);

        {
            let manager = new_manager(config.clone()).await;
            let log = manager.get_or_create_log(&tp, CleanupPolicy::Delete).unwrap();
            produce(&log, &["a", "b", "c"]);
            log.flush().unwrap();
            assert_eq!(log.recover_point(), 2);
            manager.checkpoint_recovery_points().await.unwrap();
        }

        let manager = new_manager(config).await;
        let log = manager.get_or_create_log(&tp, CleanupPolicy::Delete).unwrap();
        assert_eq!(log.recover_point(), 2);
        assert_eq!(log.next_offset(), 3);
    }

    #[tokio::test]
    async fn test_retention_sweep_respects_min_retained_offset() {
        let dir = TempDir::new().unwrap();
        let manager = new_manager(test_manager_config(&dir)).await;
        let tp = TopicPartition::new("orders", 1);
        let log = manager.get_or_create_log(&tp, CleanupPolicy::Delete).unwrap();

        for i in 0..20 {
            produce(&log, &[format!("payload-{}", i).as_str()]);
        }
        log.roll_active_segment().unwrap();
        assert!(!log.closed_segments().is_empty());

        // nothing at or above the floor may be reclaimed
        manager.set_min_retained_offset_fn(Arc::new(|_| Some(0)));
        manager.retention_sweep();
        assert_eq!(log.log_start_offset(), 0);

        // with the floor at the log end, everything closed is fair game
        manager.set_min_retained_offset_fn(Arc::new(|_| Some(i64::MAX)));
        manager.retention_sweep();
        assert!(log.closed_segments().is_empty());
        assert_eq!(log.log_start_offset(), log.next_offset());
    }
}
