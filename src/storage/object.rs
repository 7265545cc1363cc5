//! Durable object storage for experiment artifacts
//!
//! ## Table of Contents
//! - **ObjectStore**: Trait with create-if-absent writes, reads and prefix listing
//! - **MemoryObjectStore**: In-process store (tests, local runs)
//! - **LocalObjectStore**: Filesystem store rooted at a directory
//!
//! Object paths are `/`-separated and relative; `..` and empty segments are
//! rejected.

use crate::error::{FanoutError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Trait for durable object storage
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Write an object only if nothing exists at `path`
    ///
    /// Fails with `VersionCollision` when the path is already taken.
    async fn write_object(&self, path: &str, bytes: Bytes) -> Result<()>;

    /// Read an object, `NotFound` if absent
    async fn read_object(&self, path: &str) -> Result<Bytes>;

    /// List object paths starting with `prefix`, sorted
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Whether an object exists
    async fn exists(&self, path: &str) -> Result<bool> {
        match self.read_object(path).await {
            Ok(_) => Ok(true),
            Err(FanoutError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Store name for logging
    fn name(&self) -> &str;
}

/// Shared object store
pub type BoxedObjectStore = Arc<dyn ObjectStore>;

/// Join path segments with `/`, skipping empty ones
pub fn join_path<'a>(segments: impl IntoIterator<Item = &'a str>) -> String {
    segments
        .into_iter()
        .map(|s| s.trim_matches('/'))
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

fn validate_path(path: &str) -> Result<()> {
    if path.is_empty() || path.split('/').any(|s| s.is_empty() || s == "." || s == "..") {
        return Err(FanoutError::storage(format!("invalid object path '{}'", path)));
    }
    Ok(())
}

/// In-memory object store
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    objects: DashMap<String, Bytes>,
}

impl MemoryObjectStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored objects
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// Whether the store is empty
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn write_object(&self, path: &str, bytes: Bytes) -> Result<()> {
        validate_path(path)?;
        match self.objects.entry(path.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(FanoutError::VersionCollision {
                path: path.to_string(),
            }),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(bytes);
                Ok(())
            }
        }
    }

    async fn read_object(&self, path: &str) -> Result<Bytes> {
        self.objects
            .get(path)
            .map(|b| b.value().clone())
            .ok_or_else(|| FanoutError::not_found(format!("object '{}'", path)))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut paths: Vec<String> = self
            .objects
            .iter()
            .filter(|e| e.key().starts_with(prefix))
            .map(|e| e.key().clone())
            .collect();
        paths.sort();
        Ok(paths)
    }

    fn name(&self) -> &str {
        "memory"
    }
}

/// Filesystem object store
///
/// Writes go to a temporary file that is then hard-linked into place, so an
/// object is either absent or complete and two writers cannot both win.
#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    root: PathBuf,
}

const TMP_PREFIX: &str = ".tmp-";

impl LocalObjectStore {
    /// Open a store rooted at `root`, creating the directory
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;
        info!(root = %root.display(), "Object store opened");
        Ok(Self { root })
    }

    /// Root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> Result<PathBuf> {
        validate_path(path)?;
        Ok(path.split('/').fold(self.root.clone(), |acc, s| acc.join(s)))
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn write_object(&self, path: &str, bytes: Bytes) -> Result<()> {
        let target = self.resolve(path)?;
        let parent = target
            .parent()
            .ok_or_else(|| FanoutError::storage(format!("invalid object path '{}'", path)))?;
        tokio::fs::create_dir_all(parent).await?;

        let tmp = parent.join(format!("{}{}", TMP_PREFIX, uuid::Uuid::new_v4()));
        tokio::fs::write(&tmp, &bytes).await?;

        let linked = tokio::fs::hard_link(&tmp, &target).await;
        let _ = tokio::fs::remove_file(&tmp).await;
        match linked {
            Ok(()) => {
                debug!(path, bytes = bytes.len(), "Object written");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Err(FanoutError::VersionCollision {
                path: path.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn read_object(&self, path: &str) -> Result<Bytes> {
        let target = self.resolve(path)?;
        match tokio::fs::read(&target).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(FanoutError::not_found(format!("object '{}'", path)))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut paths = Vec::new();
        let mut pending = vec![(self.root.clone(), String::new())];

        while let Some((dir, rel)) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let name = entry.file_name().to_string_lossy().into_owned();
                if name.starts_with(TMP_PREFIX) {
                    continue;
                }
                let child = if rel.is_empty() {
                    name
                } else {
                    format!("{}/{}", rel, name)
                };
                // prune subtrees that cannot match
                if !child.starts_with(prefix) && !prefix.starts_with(&child) {
                    continue;
                }
                if entry.file_type().await?.is_dir() {
                    pending.push((entry.path(), child));
                } else if child.starts_with(prefix) {
                    paths.push(child);
                }
            }
        }

        paths.sort();
        Ok(paths)
    }

    fn name(&self) -> &str {
        "local"
    }
}
