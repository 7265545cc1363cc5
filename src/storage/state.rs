//! Small mutable state behind the task ledger
//!
//! ## Table of Contents
//! - **StateStore**: Byte-valued key space with ordered prefix scans
//! - **MemoryStore**: Process-local map, lost on exit
//! - **FileStore**: One JSON document on disk, flushed after every change
//! - **keys**: Ledger key layout

use crate::error::{FanoutError, Result};
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

type Entries = BTreeMap<String, Vec<u8>>;

/// Durable home of the task ledger
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Bytes stored under `key`
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Insert or overwrite `key`
    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()>;

    /// Remove `key`; absent keys are not an error
    async fn delete(&self, key: &str) -> Result<()>;

    /// Keys starting with `prefix`, in ascending order
    async fn list_prefix(&self, prefix: &str) -> Result<Vec<String>>;

    /// Short label used in logs
    fn name(&self) -> &str;
}

/// Read `key` as JSON
pub async fn store_get_json<T: DeserializeOwned>(
    store: &dyn StateStore,
    key: &str,
) -> Result<Option<T>> {
    store
        .get(key)
        .await?
        .map(|raw| serde_json::from_slice(&raw).map_err(FanoutError::from))
        .transpose()
}

/// Write `value` under `key` as JSON
pub async fn store_set_json<T: Serialize>(store: &dyn StateStore, key: &str, value: &T) -> Result<()> {
    store.set(key, serde_json::to_vec(value)?).await
}

fn scan(entries: &Entries, prefix: &str) -> Vec<String> {
    entries
        .range(prefix.to_string()..)
        .map(|(k, _)| k)
        .take_while(|k| k.starts_with(prefix))
        .cloned()
        .collect()
}

/// Ledger kept in process memory
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<Entries>,
}

impl MemoryStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.entries.write().await.insert(key.to_owned(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.write().await.remove(key);
        Ok(())
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(scan(&*self.entries.read().await, prefix))
    }

    fn name(&self) -> &str {
        "memory"
    }
}

/// Ledger persisted as a single JSON file
///
/// Every mutation rewrites the file, so a restarted submitter sees each
/// accepted task.
pub struct FileStore {
    path: PathBuf,
    entries: RwLock<Entries>,
}

impl FileStore {
    /// Load `path`, or start empty when it does not exist yet
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let entries: Entries = match std::fs::read(&path) {
            Ok(raw) => serde_json::from_slice(&raw)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Entries::new(),
            Err(e) => {
                return Err(FanoutError::storage(format!(
                    "cannot read ledger file {}: {}",
                    path.display(),
                    e
                )))
            }
        };

        info!(path = %path.display(), entries = entries.len(), "Ledger file loaded");
        Ok(Self {
            path,
            entries: RwLock::new(entries),
        })
    }

    /// Ledger file location
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn flush(&self, entries: &Entries) -> Result<()> {
        let io_err = |what: &str, e: std::io::Error| {
            FanoutError::storage(format!("{} {}: {}", what, self.path.display(), e))
        };

        if let Some(dir) = self.path.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| io_err("cannot create parent of", e))?;
        }

        // the old file stays whole until the rename lands
        let staging = self.path.with_extension("json.partial");
        tokio::fs::write(&staging, serde_json::to_vec(entries)?)
            .await
            .map_err(|e| io_err("cannot stage", e))?;
        tokio::fs::rename(&staging, &self.path)
            .await
            .map_err(|e| io_err("cannot replace", e))?;

        debug!(path = %self.path.display(), entries = entries.len(), "Ledger file flushed");
        Ok(())
    }
}

#[async_trait]
impl StateStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
        let mut entries = self.entries.write().await;
        if entries.get(key) == Some(&value) {
            return Ok(());
        }
        entries.insert(key.to_owned(), value);
        self.flush(&entries).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut entries = self.entries.write().await;
        match entries.remove(key) {
            Some(_) => self.flush(&entries).await,
            None => Ok(()),
        }
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(scan(&*self.entries.read().await, prefix))
    }

    fn name(&self) -> &str {
        "file"
    }
}

/// Shared state store
pub type BoxedStateStore = Arc<dyn StateStore>;

/// Fresh in-memory ledger store
pub fn memory_store() -> BoxedStateStore {
    Arc::new(MemoryStore::new())
}

/// Ledger key layout
pub mod keys {
    /// Root of every task record
    pub const TASKS: &str = "fanout/tasks";

    /// Prefix holding every task of a run
    pub fn run_tasks(run: &str) -> String {
        format!("{}/{}/", TASKS, run)
    }

    /// Key of one branch's task; zero-padded so keys sort by index
    pub fn task(run: &str, branch_index: usize) -> String {
        format!("{}{:06}", run_tasks(run), branch_index)
    }
}
