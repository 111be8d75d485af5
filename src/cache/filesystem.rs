//! Shared-filesystem cache backend.
//!
//! Mirrors the bucket/object hierarchy as empty files under a base directory
//! on an externally-mounted filesystem, so a cluster of processes can agree
//! on which just-written objects must appear in listings. A bucket is a
//! directory, a file object is an empty file, and a directory object
//! (trailing delimiter) is a directory. The node's modification time is the
//! entry creation time; item info is never stored.

use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use async_trait::async_trait;
use tokio::fs;

use crate::cache::{CacheConfig, CacheEntry, CacheError, DirectoryListCache, now_ms};
use crate::model::ItemInfo;
use crate::resource::{PATH_DELIMITER, ResourceId};

pub struct FilesystemListCache {
    config: CacheConfig,
    base: PathBuf,
}

impl FilesystemListCache {
    pub fn new(config: CacheConfig, base: impl Into<PathBuf>) -> FilesystemListCache {
        FilesystemListCache { config, base: base.into() }
    }

    fn mirror_path(&self, id: &ResourceId) -> Result<(PathBuf, bool), CacheError> {
        match id {
            ResourceId::Root => {
                Err(CacheError::InvalidResource("the root cannot be cached".to_string()))
            }
            ResourceId::Bucket(name) => Ok((self.base.join(name), true)),
            ResourceId::Object { bucket, name } => {
                let is_directory = name.ends_with(PATH_DELIMITER);
                let trimmed = name.strip_suffix(PATH_DELIMITER).unwrap_or(name);
                Ok((self.base.join(bucket).join(trimmed), is_directory))
            }
        }
    }

    async fn node_age_ms(path: &Path) -> Result<Option<(u64, bool)>, CacheError> {
        match fs::metadata(path).await {
            Ok(meta) => {
                let modified = meta.modified()?;
                let millis = modified
                    .duration_since(UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_millis() as u64;
                Ok(Some((millis, meta.is_dir())))
            }
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(error) => Err(error.into()),
        }
    }

    fn entry_for(&self, id: ResourceId, created_ms: u64) -> CacheEntry {
        CacheEntry { resource_id: id, item_info: None, creation_time_ms: created_ms, info_update_time_ms: 0 }
    }

    /// Walks a bucket mirror, yielding `(relative object name, mtime)` for
    /// every node, unlinking hard-expired files on the way.
    async fn walk_bucket(
        &self,
        bucket: &str,
        collect: bool,
        now: u64,
    ) -> Result<Vec<CacheEntry>, CacheError> {
        let root = self.base.join(bucket);
        let mut collected = Vec::new();
        let mut stack = vec![(root.clone(), String::new())];
        while let Some((dir, relative)) = stack.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(error) if error.kind() == std::io::ErrorKind::NotFound => continue,
                Err(error) => return Err(error.into()),
            };
            while let Some(node) = entries.next_entry().await? {
                let file_name = node.file_name();
                let name = file_name.to_string_lossy().into_owned();
                let path = node.path();
                let Some((created, is_dir)) = Self::node_age_ms(&path).await? else {
                    continue;
                };
                let object_name = if is_dir {
                    format!("{relative}{name}{PATH_DELIMITER}")
                } else {
                    format!("{relative}{name}")
                };
                let expired = now.saturating_sub(created) > self.config.max_entry_age_ms;
                if is_dir {
                    stack.push((path.clone(), object_name.clone()));
                } else if expired {
                    // Lazy eviction during traversal.
                    let _ = fs::remove_file(&path).await;
                    continue;
                }
                if collect && !expired {
                    let id = ResourceId::Object {
                        bucket: bucket.to_string(),
                        name: object_name,
                    };
                    collected.push(self.entry_for(id, created));
                }
            }
        }
        Ok(collected)
    }

    /// Removes directories that are empty after expired files were unlinked,
    /// deepest first.
    async fn prune_empty_dirs(&self, bucket_dir: &Path, now: u64) -> Result<(), CacheError> {
        let mut dirs = Vec::new();
        let mut stack = vec![bucket_dir.to_path_buf()];
        while let Some(dir) = stack.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(error) if error.kind() == std::io::ErrorKind::NotFound => continue,
                Err(error) => return Err(error.into()),
            };
            while let Some(node) = entries.next_entry().await? {
                if node.file_type().await?.is_dir() {
                    stack.push(node.path());
                }
            }
            dirs.push(dir);
        }
        dirs.sort_by_key(|dir| std::cmp::Reverse(dir.components().count()));
        for dir in dirs {
            if let Some((created, _)) = Self::node_age_ms(&dir).await?
                && now.saturating_sub(created) > self.config.max_entry_age_ms
            {
                // Fails while non-empty, which is exactly the guard we want.
                let _ = fs::remove_dir(&dir).await;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl DirectoryListCache for FilesystemListCache {
    async fn put_resource(&self, id: &ResourceId) -> Result<(), CacheError> {
        let (path, is_directory) = self.mirror_path(id)?;
        if is_directory {
            fs::create_dir_all(&path).await?;
        } else {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).await?;
            }
            // Touch: create or refresh the mtime of an existing mirror file.
            fs::write(&path, b"").await?;
        }
        Ok(())
    }

    /// This backend mirrors existence only; info is discarded.
    async fn put_resource_info(&self, id: &ResourceId, _info: &ItemInfo) -> Result<(), CacheError> {
        self.put_resource(id).await
    }

    async fn get_entry(&self, id: &ResourceId) -> Result<Option<CacheEntry>, CacheError> {
        let (path, is_directory) = self.mirror_path(id)?;
        let Some((created, is_dir)) = Self::node_age_ms(&path).await? else {
            return Ok(None);
        };
        if is_dir != is_directory {
            return Ok(None);
        }
        if now_ms().saturating_sub(created) > self.config.max_entry_age_ms {
            return Ok(None);
        }
        Ok(Some(self.entry_for(id.clone(), created)))
    }

    async fn remove_resource(&self, id: &ResourceId) -> Result<(), CacheError> {
        let (path, is_directory) = self.mirror_path(id)?;
        let result = if is_directory {
            // A directory entry with live children stays until they expire;
            // that mirrors a directory implied by its children.
            match id {
                ResourceId::Bucket(_) => fs::remove_dir_all(&path).await,
                _ => fs::remove_dir(&path).await,
            }
        } else {
            fs::remove_file(&path).await
        };
        match result {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(error) if error.kind() == std::io::ErrorKind::DirectoryNotEmpty => Ok(()),
            Err(error) => Err(error.into()),
        }
    }

    async fn bucket_list(&self) -> Result<Vec<CacheEntry>, CacheError> {
        let now = now_ms();
        let mut buckets = Vec::new();
        let mut entries = match fs::read_dir(&self.base).await {
            Ok(entries) => entries,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(buckets),
            Err(error) => return Err(error.into()),
        };
        while let Some(node) = entries.next_entry().await? {
            if !node.file_type().await?.is_dir() {
                continue;
            }
            let Some((created, _)) = Self::node_age_ms(&node.path()).await? else {
                continue;
            };
            if now.saturating_sub(created) > self.config.max_entry_age_ms {
                continue;
            }
            let name = node.file_name().to_string_lossy().into_owned();
            buckets.push(self.entry_for(ResourceId::Bucket(name), created));
        }
        Ok(buckets)
    }

    async fn object_list(&self, bucket: &str) -> Result<Vec<CacheEntry>, CacheError> {
        self.walk_bucket(bucket, true, now_ms()).await
    }

    async fn sweep(&self) -> Result<(), CacheError> {
        let now = now_ms();
        let mut entries = match fs::read_dir(&self.base).await {
            Ok(entries) => entries,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(error) => return Err(error.into()),
        };
        while let Some(node) = entries.next_entry().await? {
            if !node.file_type().await?.is_dir() {
                continue;
            }
            let bucket = node.file_name().to_string_lossy().into_owned();
            self.walk_bucket(&bucket, false, now).await?;
            self.prune_empty_dirs(&node.path(), now).await?;
        }
        Ok(())
    }

    fn supports_info(&self) -> bool {
        false
    }

    fn config(&self) -> CacheConfig {
        self.config
    }
}
