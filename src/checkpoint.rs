//! Checkpoint persistence. Keyed by (database, index); nothing else
//! about the pipeline's state survives a restart.
//!
//! The checkpoint itself — the highest xid whose effect is durably
//! applied — lives in the coordinator as an atomic for fast, lock-free
//! reads: a single writer with multiple readers via an atomic load.
//! This module only owns getting that value on/off disk so a restart
//! resumes from it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::SyncError;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct CheckpointFile {
    #[serde(flatten)]
    entries: HashMap<String, i64>,
}

fn key(database: &str, index: &str) -> String {
    format!("{database}/{index}")
}

/// Where the checkpoint for one (database, index) pair is persisted and
/// loaded from.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn load(&self, database: &str, index: &str) -> Result<Option<i64>, SyncError>;
    async fn persist(&self, database: &str, index: &str, checkpoint: i64) -> Result<(), SyncError>;
}

/// JSON file on disk, one entry per (database, index) key — the
/// simplest persistence that needs no external dependency.
pub struct FileCheckpointStore {
    path: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self { path: path.as_ref().to_path_buf() }
    }

    async fn read_all(&self) -> Result<CheckpointFile, SyncError> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => serde_json::from_str(&raw)
                .map_err(|e| SyncError::Fatal(format!("checkpoint file {} is corrupt: {e}", self.path.display()))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(CheckpointFile::default()),
            Err(e) => Err(SyncError::Fatal(format!("reading checkpoint file {} failed: {e}", self.path.display()))),
        }
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn load(&self, database: &str, index: &str) -> Result<Option<i64>, SyncError> {
        let file = self.read_all().await?;
        Ok(file.entries.get(&key(database, index)).copied())
    }

    async fn persist(&self, database: &str, index: &str, checkpoint: i64) -> Result<(), SyncError> {
        let mut file = self.read_all().await?;
        file.entries.insert(key(database, index), checkpoint);

        let encoded = serde_json::to_string_pretty(&file)
            .map_err(|e| SyncError::Fatal(format!("encoding checkpoint file failed: {e}")))?;

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| SyncError::Fatal(format!("creating checkpoint directory failed: {e}")))?;
        }
        tokio::fs::write(&self.path, encoded)
            .await
            .map_err(|e| SyncError::Fatal(format!("writing checkpoint file {} failed: {e}", self.path.display())))
    }
}

/// In-memory store used by tests and by callers that don't need restart
/// durability (e.g. `bootstrap`'s one-shot invocations).
#[derive(Default)]
pub struct InMemoryCheckpointStore {
    inner: tokio::sync::Mutex<HashMap<String, i64>>,
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn load(&self, database: &str, index: &str) -> Result<Option<i64>, SyncError> {
        Ok(self.inner.lock().await.get(&key(database, index)).copied())
    }

    async fn persist(&self, database: &str, index: &str, checkpoint: i64) -> Result<(), SyncError> {
        self.inner.lock().await.insert(key(database, index), checkpoint);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_memory_store_round_trips() {
        let store = InMemoryCheckpointStore::default();
        assert_eq!(store.load("testdb", "testdb").await.unwrap(), None);
        store.persist("testdb", "testdb", 42).await.unwrap();
        assert_eq!(store.load("testdb", "testdb").await.unwrap(), Some(42));
    }

    #[tokio::test]
    async fn file_store_persists_across_instances() {
        let dir = std::env::temp_dir().join(format!("pgsync-checkpoint-test-{}", std::process::id()));
        let path = dir.join("checkpoint.json");

        let store = FileCheckpointStore::new(&path);
        store.persist("testdb", "testdb", 7).await.unwrap();

        let reopened = FileCheckpointStore::new(&path);
        assert_eq!(reopened.load("testdb", "testdb").await.unwrap(), Some(7));

        let _ = tokio::fs::remove_dir_all(&dir).await;
    }

    #[tokio::test]
    async fn file_store_keys_by_database_and_index() {
        let dir = std::env::temp_dir().join(format!("pgsync-checkpoint-test2-{}", std::process::id()));
        let path = dir.join("checkpoint.json");
        let store = FileCheckpointStore::new(&path);

        store.persist("db_a", "idx", 1).await.unwrap();
        store.persist("db_b", "idx", 2).await.unwrap();

        assert_eq!(store.load("db_a", "idx").await.unwrap(), Some(1));
        assert_eq!(store.load("db_b", "idx").await.unwrap(), Some(2));

        let _ = tokio::fs::remove_dir_all(&dir).await;
    }
}
