//! Directory list cache: remembers which buckets and objects were recently
//! seen or written, so listings from an eventually-consistent store can be
//! supplemented with entries the store has not started reporting yet.
//!
//! Two TTLs govern an entry: past `max_entry_age_ms` the entry itself is
//! dropped; past `max_info_age_ms` its attached item info is stale and must
//! be refetched before being trusted.

pub mod filesystem;

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use thiserror::Error;

use crate::model::ItemInfo;
use crate::resource::ResourceId;

pub use filesystem::FilesystemListCache;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("invalid resource for cache: {0}")]
    InvalidResource(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy)]
pub struct CacheConfig {
    pub max_entry_age_ms: u64,
    pub max_info_age_ms: u64,
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

/// One cached resource. An absent `item_info` means "known to exist at some
/// time" with details not yet fetched.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub resource_id: ResourceId,
    pub item_info: Option<ItemInfo>,
    pub creation_time_ms: u64,
    pub info_update_time_ms: u64,
}

impl CacheEntry {
    pub fn new(resource_id: ResourceId, now: u64) -> CacheEntry {
        CacheEntry { resource_id, item_info: None, creation_time_ms: now, info_update_time_ms: 0 }
    }

    pub fn with_info(resource_id: ResourceId, info: ItemInfo, now: u64) -> CacheEntry {
        CacheEntry {
            resource_id,
            item_info: Some(info),
            creation_time_ms: now,
            info_update_time_ms: now,
        }
    }

    pub fn is_expired(&self, now: u64, config: &CacheConfig) -> bool {
        now.saturating_sub(self.creation_time_ms) > config.max_entry_age_ms
    }

    /// Stale info means existence is still known but the attached snapshot
    /// must not back negative-existence decisions.
    pub fn info_is_fresh(&self, now: u64, config: &CacheConfig) -> bool {
        self.item_info.is_some()
            && now.saturating_sub(self.info_update_time_ms) <= config.max_info_age_ms
    }
}

/// A bucket's own entry plus an insertion-ordered map of its object entries.
#[derive(Debug)]
pub struct CachedBucket {
    entry: CacheEntry,
    entries: HashMap<String, CacheEntry>,
    insertion_order: VecDeque<String>,
}

impl CachedBucket {
    pub fn new(entry: CacheEntry) -> CachedBucket {
        CachedBucket { entry, entries: HashMap::new(), insertion_order: VecDeque::new() }
    }

    pub fn name(&self) -> &str {
        self.entry.resource_id.bucket_name().unwrap_or_default()
    }

    pub fn entry(&self) -> &CacheEntry {
        &self.entry
    }

    pub fn entry_mut(&mut self) -> &mut CacheEntry {
        &mut self.entry
    }

    /// Rejects anything that is not an object in this bucket.
    fn validate<'a>(&self, id: &'a ResourceId) -> Result<&'a str, CacheError> {
        let ResourceId::Object { bucket, name } = id else {
            return Err(CacheError::InvalidResource(format!(
                "bucket '{}' cannot hold non-object entry '{id}'",
                self.name()
            )));
        };
        if bucket != self.name() {
            return Err(CacheError::InvalidResource(format!(
                "entry '{id}' belongs to a foreign bucket, not '{}'",
                self.name()
            )));
        }
        Ok(name)
    }

    pub fn put(&mut self, entry: CacheEntry) -> Result<(), CacheError> {
        debug_assert!(
            entry.item_info.as_ref().is_none_or(|info| info.resource_id == entry.resource_id),
            "entry info must describe the entry's own resource"
        );
        let name = self.validate(&entry.resource_id)?.to_string();
        if !self.entries.contains_key(&name) {
            self.insertion_order.push_back(name.clone());
        }
        self.entries.insert(name, entry);
        Ok(())
    }

    pub fn get(&self, id: &ResourceId) -> Result<Option<&CacheEntry>, CacheError> {
        let name = self.validate(id)?;
        Ok(self.entries.get(name))
    }

    pub fn remove(&mut self, id: &ResourceId) -> Result<(), CacheError> {
        let name = self.validate(id)?;
        if self.entries.remove(name).is_some() {
            self.insertion_order.retain(|existing| existing != name);
        }
        Ok(())
    }

    pub fn entries_in_order(&self) -> Vec<CacheEntry> {
        self.insertion_order
            .iter()
            .filter_map(|name| self.entries.get(name))
            .cloned()
            .collect()
    }

    pub fn retain(&mut self, mut keep: impl FnMut(&CacheEntry) -> bool) {
        let entries = &mut self.entries;
        self.insertion_order.retain(|name| {
            let keep_entry = entries.get(name).map(&mut keep).unwrap_or(false);
            if !keep_entry {
                entries.remove(name);
            }
            keep_entry
        });
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Capability set shared by the cache backends. Switching backends is a
/// startup decision.
#[async_trait]
pub trait DirectoryListCache: Send + Sync {
    /// Records that a resource exists, without item details.
    async fn put_resource(&self, id: &ResourceId) -> Result<(), CacheError>;

    /// Records a resource together with its item info. Backends that only
    /// mirror existence degrade this to [`DirectoryListCache::put_resource`].
    async fn put_resource_info(&self, id: &ResourceId, info: &ItemInfo) -> Result<(), CacheError>;

    /// `None` when absent or hard-expired.
    async fn get_entry(&self, id: &ResourceId) -> Result<Option<CacheEntry>, CacheError>;

    async fn remove_resource(&self, id: &ResourceId) -> Result<(), CacheError>;

    async fn bucket_list(&self) -> Result<Vec<CacheEntry>, CacheError>;

    async fn object_list(&self, bucket: &str) -> Result<Vec<CacheEntry>, CacheError>;

    /// Garbage-collects expired entries in one pass. An expired bucket goes
    /// away together with all of its object entries.
    async fn sweep(&self) -> Result<(), CacheError>;

    /// Whether [`DirectoryListCache::put_resource_info`] actually retains
    /// item info.
    fn supports_info(&self) -> bool {
        true
    }

    fn config(&self) -> CacheConfig;
}

/// Process-local backend: one mutex around a map of cached buckets.
pub struct InMemoryListCache {
    config: CacheConfig,
    buckets: Mutex<HashMap<String, CachedBucket>>,
}

impl InMemoryListCache {
    pub fn new(config: CacheConfig) -> InMemoryListCache {
        InMemoryListCache { config, buckets: Mutex::new(HashMap::new()) }
    }

    fn bucket_id(id: &ResourceId) -> Result<&str, CacheError> {
        id.bucket_name().ok_or_else(|| {
            CacheError::InvalidResource("the root cannot be cached".to_string())
        })
    }

    fn insert(&self, id: &ResourceId, info: Option<&ItemInfo>) -> Result<(), CacheError> {
        let bucket_name = Self::bucket_id(id)?;
        let now = now_ms();
        let mut buckets = self.buckets.lock().expect("cache lock");
        let bucket = buckets.entry(bucket_name.to_string()).or_insert_with(|| {
            CachedBucket::new(CacheEntry::new(
                ResourceId::Bucket(bucket_name.to_string()),
                now,
            ))
        });
        match id {
            ResourceId::Bucket(_) => {
                let entry = bucket.entry_mut();
                if let Some(info) = info {
                    entry.item_info = Some(info.clone());
                    entry.info_update_time_ms = now;
                }
            }
            ResourceId::Object { .. } => {
                let entry = match (info, bucket.get(id)?) {
                    (Some(info), _) => CacheEntry::with_info(id.clone(), info.clone(), now),
                    // Re-recording existence refreshes the entry without
                    // discarding previously attached info.
                    (None, Some(existing)) => {
                        CacheEntry { creation_time_ms: now, ..existing.clone() }
                    }
                    (None, None) => CacheEntry::new(id.clone(), now),
                };
                bucket.put(entry)?;
            }
            ResourceId::Root => unreachable!("bucket_id rejects the root"),
        }
        Ok(())
    }
}

#[async_trait]
impl DirectoryListCache for InMemoryListCache {
    async fn put_resource(&self, id: &ResourceId) -> Result<(), CacheError> {
        self.insert(id, None)
    }

    async fn put_resource_info(&self, id: &ResourceId, info: &ItemInfo) -> Result<(), CacheError> {
        self.insert(id, Some(info))
    }

    async fn get_entry(&self, id: &ResourceId) -> Result<Option<CacheEntry>, CacheError> {
        let bucket_name = Self::bucket_id(id)?;
        let now = now_ms();
        let buckets = self.buckets.lock().expect("cache lock");
        let Some(bucket) = buckets.get(bucket_name) else {
            return Ok(None);
        };
        let entry = match id {
            ResourceId::Bucket(_) => Some(bucket.entry()),
            _ => bucket.get(id)?,
        };
        Ok(entry.filter(|entry| !entry.is_expired(now, &self.config)).cloned())
    }

    async fn remove_resource(&self, id: &ResourceId) -> Result<(), CacheError> {
        let bucket_name = Self::bucket_id(id)?;
        let mut buckets = self.buckets.lock().expect("cache lock");
        match id {
            ResourceId::Bucket(_) => {
                buckets.remove(bucket_name);
            }
            ResourceId::Object { .. } => {
                if let Some(bucket) = buckets.get_mut(bucket_name) {
                    bucket.remove(id)?;
                }
            }
            ResourceId::Root => {}
        }
        Ok(())
    }

    async fn bucket_list(&self) -> Result<Vec<CacheEntry>, CacheError> {
        let now = now_ms();
        let buckets = self.buckets.lock().expect("cache lock");
        Ok(buckets
            .values()
            .map(CachedBucket::entry)
            .filter(|entry| !entry.is_expired(now, &self.config))
            .cloned()
            .collect())
    }

    async fn object_list(&self, bucket: &str) -> Result<Vec<CacheEntry>, CacheError> {
        let now = now_ms();
        let buckets = self.buckets.lock().expect("cache lock");
        let Some(bucket) = buckets.get(bucket) else {
            return Ok(Vec::new());
        };
        Ok(bucket
            .entries_in_order()
            .into_iter()
            .filter(|entry| !entry.is_expired(now, &self.config))
            .collect())
    }

    async fn sweep(&self) -> Result<(), CacheError> {
        let now = now_ms();
        let mut buckets = self.buckets.lock().expect("cache lock");
        buckets.retain(|_, bucket| {
            if bucket.entry().is_expired(now, &self.config) {
                return false;
            }
            bucket.retain(|entry| !entry.is_expired(now, &self.config));
            true
        });
        Ok(())
    }

    fn config(&self) -> CacheConfig {
        self.config
    }
}
