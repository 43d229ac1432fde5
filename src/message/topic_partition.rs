use std::borrow::Cow;
use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{AppError, AppResult};

/// Key identifying one partition of one topic. Used as the index into every
/// per-partition map in the engine.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct TopicPartition {
    topic: String,
    partition: i32,
}

impl TopicPartition {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition(&self) -> i32 {
        self.partition
    }

    /// `topic-partition` form used in checkpoint files and directory names.
    pub fn id(&self) -> String {
        format!("{}-{}", self.topic, self.partition)
    }

    /// Directory holding this partition's segments under a broker data dir.
    pub fn partition_dir(&self, data_dir: impl AsRef<Path>) -> PathBuf {
        data_dir.as_ref().join(self.id())
    }

    pub fn from_string(s: Cow<str>) -> AppResult<TopicPartition> {
        let index = s.rfind('-').ok_or_else(|| {
            AppError::InvalidValue(format!("invalid topic partition name: {}", s))
        })?;
        let partition = s[index + 1..]
            .parse()
            .map_err(|_| AppError::InvalidValue(format!("invalid partition number: {}", s)))?;
        Ok(TopicPartition {
            topic: s[..index].to_string(),
            partition,
        })
    }
}

impl Display for TopicPartition {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.topic, self.partition)
    }
}
