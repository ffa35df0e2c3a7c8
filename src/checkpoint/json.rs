//! Flat-file checkpoint backend
//!
//! The whole map lives in memory and is rewritten on every change:
//! serialize to `<file>.tmp`, flush, then rename over `<file>`. A crash leaves
//! either the old or the new file, never a torn one.

use super::{CheckpointRecord, checkpoint_key};
use crate::Result;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

/// JSON object file keyed by URL hash
pub struct JsonCheckpoint {
    path: PathBuf,
    records: Mutex<BTreeMap<String, CheckpointRecord>>,
}

impl JsonCheckpoint {
    /// Load the file if present, otherwise start empty
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let records = match tokio::fs::read(path).await {
            Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => BTreeMap::new(),
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };

        tracing::debug!(path = %path.display(), records = records.len(), "Loaded JSON checkpoint");

        Ok(Self {
            path: path.to_path_buf(),
            records: Mutex::new(records),
        })
    }

    /// Record a URL; true iff new or changed
    pub async fn upsert(&self, record: &CheckpointRecord) -> Result<bool> {
        let key = record.key();
        let mut records = self.records.lock().await;

        let previous = records.get(&key).cloned();
        let merged = match &previous {
            None => record.clone(),
            Some(existing) if existing.changed_by(record) => {
                let mut merged = existing.clone();
                merged.merge(record);
                merged
            }
            Some(_) => return Ok(false),
        };
        records.insert(key.clone(), merged);

        // The lock is held across the write so file order matches map order
        if let Err(e) = self.flush(&records).await {
            match previous {
                Some(previous) => records.insert(key, previous),
                None => records.remove(&key),
            };
            return Err(e);
        }
        Ok(true)
    }

    /// Fetch the stored record for a URL
    pub async fn get(&self, url: &str) -> Option<CheckpointRecord> {
        self.records.lock().await.get(&checkpoint_key(url)).cloned()
    }

    /// Number of stored URLs
    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }

    async fn flush(&self, records: &BTreeMap<String, CheckpointRecord>) -> Result<()> {
        let mut tmp_name = self.path.as_os_str().to_owned();
        tmp_name.push(".tmp");
        let tmp_path = PathBuf::from(tmp_name);

        let bytes = serde_json::to_vec(records)?;
        let mut file = tokio::fs::File::create(&tmp_path).await?;
        file.write_all(&bytes).await?;
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&tmp_path, &self.path).await?;
        Ok(())
    }
}
