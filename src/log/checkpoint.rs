use std::borrow::Cow;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tokio::fs::OpenOptions;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tracing::warn;

use crate::message::TopicPartition;
use crate::{AppError, AppResult};

/// Versioned per-partition offset checkpoint file. Format:
///
/// ```text
/// <version>
/// <topic>-<partition> <offset>
/// ...
/// ```
///
/// Writes go to a temporary file which is renamed over the target, so a
/// crash mid-write never loses the previous recovery point.
#[derive(Debug)]
pub struct CheckPointFile {
    path: PathBuf,
    version: i8,
}

impl CheckPointFile {
    pub const VERSION_1: i8 = 1;

    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            version: Self::VERSION_1,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn write_checkpoints(&self, points: HashMap<TopicPartition, i64>) -> AppResult<()> {
        let tmp_path = self.path.with_extension("tmp");
        let write_file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&tmp_path)
            .await?;
        let mut writer = BufWriter::new(write_file);
        writer
            .write_all(format!("{}\n", self.version).as_bytes())
            .await?;
        for (topic_partition, offset) in points {
            writer
                .write_all(format!("{} {}\n", topic_partition.id(), offset).as_bytes())
                .await?;
        }
        writer.flush().await?;
        writer.get_ref().sync_all().await?;
        tokio::fs::rename(&tmp_path, &self.path).await?;
        Ok(())
    }

    pub async fn read_checkpoints(&self) -> AppResult<HashMap<TopicPartition, i64>> {
        let malformed =
            |line: &str| AppError::InvalidValue(format!("checkpoint line: {}", line));
        let open_file = OpenOptions::new().read(true).open(&self.path).await;
        let file = match open_file {
            Ok(file) => file,
            Err(_) => {
                warn!(
                    "checkpoint file {:?} not found, starting from an empty checkpoint",
                    self.path
                );
                return Ok(HashMap::new());
            }
        };

        let mut reader = BufReader::new(file);
        let mut line = String::new();
        reader.read_line(&mut line).await?;
        let version = line
            .trim()
            .parse::<i8>()
            .map_err(|_| malformed(&line))?;
        if version != self.version {
            return Err(AppError::InvalidValue(format!(
                "unsupported checkpoint version: {}",
                version
            )));
        }

        let mut points = HashMap::new();
        line.clear();
        while reader.read_line(&mut line).await? > 0 {
            let mut parts = line.split_whitespace();
            let (tp_str, offset_str) = match (parts.next(), parts.next(), parts.next()) {
                (Some(tp), Some(offset), None) => (tp, offset),
                _ => return Err(malformed(&line)),
            };
            let topic_partition = TopicPartition::from_string(Cow::Borrowed(tp_str))?;
            let offset = offset_str.parse().map_err(|_| malformed(&line))?;
            points.insert(topic_partition, offset);
            line.clear();
        }
        Ok(points)
    }
}
