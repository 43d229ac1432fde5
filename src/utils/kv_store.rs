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

use std::collections::HashMap;
use std::path::PathBuf;

use parking_lot::RwLock;
use tracing::debug;

use crate::AppResult;

/// A small durable string map backed by one JSON file. Every mutation
/// rewrites the file through a temporary and a rename, so readers never
/// observe a torn write. Intended for low-churn broker metadata, not data.
#[derive(Debug)]
pub struct KvStore {
    path: PathBuf,
    map: RwLock<HashMap<String, String>>,
}

impl KvStore {
    pub fn open(path: impl Into<PathBuf>) -> AppResult<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let map = match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| crate::AppError::InvalidValue(format!("kv store {:?}: {}", path, e)))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };
        debug!("kv store {:?} loaded with {} entries", path, map.len());
        Ok(Self {
            path,
            map: RwLock::new(map),
        })
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.map.read().get(key).cloned()
    }

    pub fn put(&self, key: impl Into<String>, value: impl Into<String>) -> AppResult<()> {
        let mut map = self.map.write();
        map.insert(key.into(), value.into());
        self.persist(&map)
    }

    pub fn delete(&self, key: &str) -> AppResult<()> {
        let mut map = self.map.write();
        if map.remove(key).is_none() {
            return Ok(());
        }
        self.persist(&map)
    }

    fn persist(&self, map: &HashMap<String, String>) -> AppResult<()> {
        let tmp_path = self.path.with_extension("tmp");
        let json = serde_json::to_vec_pretty(map)
            .map_err(|e| crate::AppError::InvalidValue(format!("kv store encode: {}", e)))?;
        std::fs::write(&tmp_path, json)?;
        std::fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }
}
