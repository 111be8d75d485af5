//! Cache-supplemented client: layers the directory list cache onto any
//! [`Storage`] so read-your-writes holds against an eventually-consistent
//! store. Every successful mutation updates the cache before the call
//! returns; listings are unioned with fresh cache entries for the same
//! bucket and prefix. Cache failures never fail the operation.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;

use crate::cache::{CacheEntry, DirectoryListCache};
use crate::error::StoreError;
use crate::model::{CreateFileOptions, ItemInfo, ReadOptions};
use crate::paths;
use crate::resource::ResourceId;
use crate::store::client::{MetadataUpdate, Storage};
use crate::store::raw::InsertPrecondition;
use crate::store::reader::StorageReader;
use crate::store::writer::StorageWriter;

pub struct CachedStorage {
    inner: Arc<dyn Storage>,
    cache: Arc<dyn DirectoryListCache>,
}

impl CachedStorage {
    pub fn new(inner: Arc<dyn Storage>, cache: Arc<dyn DirectoryListCache>) -> CachedStorage {
        CachedStorage { inner, cache }
    }

    pub fn cache(&self) -> &Arc<dyn DirectoryListCache> {
        &self.cache
    }

    async fn record(&self, id: &ResourceId) {
        if let Err(error) = self.cache.put_resource(id).await {
            log::warn!("[cache] failed to record '{id}': {error}");
        }
    }

    async fn forget(&self, id: &ResourceId) {
        if let Err(error) = self.cache.remove_resource(id).await {
            log::warn!("[cache] failed to remove '{id}': {error}");
        }
    }

    /// Cached entries the store listing missed, resolved to infos the caller
    /// can trust: fresh attached info is used as-is, anything else is
    /// refetched. Entries the store no longer knows are dropped from the
    /// cache.
    async fn supplemental_infos(
        &self,
        entries: Vec<CacheEntry>,
        known: &HashSet<String>,
        prefix: &str,
        delimiter: Option<char>,
    ) -> Result<Vec<ItemInfo>, StoreError> {
        let config = self.cache.config();
        let now = crate::cache::now_ms();
        let mut supplements = Vec::new();
        for entry in entries {
            let Some(name) = entry.resource_id.object_name() else {
                continue;
            };
            // Only entries the listing itself would have reported at this
            // depth can supplement it.
            match paths::match_list_prefix(prefix, delimiter, name) {
                Some(listed) if listed == name => {}
                _ => continue,
            }
            if known.contains(name) {
                continue;
            }
            let info = if entry.info_is_fresh(now, &config) {
                entry.item_info.clone().unwrap_or_else(|| ItemInfo::not_found(entry.resource_id.clone()))
            } else {
                self.inner.get_info(&entry.resource_id).await?
            };
            if info.exists {
                supplements.push(info);
            } else {
                self.forget(&entry.resource_id).await;
            }
        }
        Ok(supplements)
    }
}

#[async_trait]
impl Storage for CachedStorage {
    async fn get_info(&self, id: &ResourceId) -> Result<ItemInfo, StoreError> {
        self.inner.get_info(id).await
    }

    async fn get_infos(&self, ids: &[ResourceId]) -> Result<Vec<ItemInfo>, StoreError> {
        self.inner.get_infos(ids).await
    }

    async fn list_bucket_names(&self) -> Result<Vec<String>, StoreError> {
        let mut names = self.inner.list_bucket_names().await?;
        let known: HashSet<String> = names.iter().cloned().collect();
        match self.cache.bucket_list().await {
            Ok(entries) => {
                for entry in entries {
                    if let ResourceId::Bucket(name) = &entry.resource_id
                        && !known.contains(name)
                    {
                        names.push(name.clone());
                    }
                }
            }
            Err(error) => log::warn!("[cache] bucket list unavailable: {error}"),
        }
        Ok(names)
    }

    async fn list_bucket_infos(&self) -> Result<Vec<ItemInfo>, StoreError> {
        let mut infos = self.inner.list_bucket_infos().await?;
        let known: HashSet<String> = infos
            .iter()
            .filter_map(|info| info.resource_id.bucket_name().map(str::to_owned))
            .collect();
        match self.cache.bucket_list().await {
            Ok(entries) => {
                for entry in entries {
                    let Some(name) = entry.resource_id.bucket_name() else {
                        continue;
                    };
                    if known.contains(name) {
                        continue;
                    }
                    let info = self.inner.get_info(&entry.resource_id).await?;
                    if info.exists {
                        infos.push(info);
                    } else {
                        self.forget(&entry.resource_id).await;
                    }
                }
            }
            Err(error) => log::warn!("[cache] bucket list unavailable: {error}"),
        }
        Ok(infos)
    }

    async fn list_object_names(
        &self,
        bucket: &str,
        prefix: &str,
        delimiter: Option<char>,
        max_results: Option<usize>,
    ) -> Result<Vec<String>, StoreError> {
        let mut names =
            self.inner.list_object_names(bucket, prefix, delimiter, max_results).await?;
        let known: HashSet<String> = names.iter().cloned().collect();
        match self.cache.object_list(bucket).await {
            Ok(entries) => {
                let supplements =
                    self.supplemental_infos(entries, &known, prefix, delimiter).await?;
                names.extend(
                    supplements
                        .into_iter()
                        .filter_map(|info| info.resource_id.object_name().map(str::to_owned)),
                );
            }
            Err(error) => log::warn!("[cache] object list for '{bucket}' unavailable: {error}"),
        }
        Ok(names)
    }

    async fn list_object_infos(
        &self,
        bucket: &str,
        prefix: &str,
        delimiter: Option<char>,
        max_results: Option<usize>,
    ) -> Result<Vec<ItemInfo>, StoreError> {
        let mut infos =
            self.inner.list_object_infos(bucket, prefix, delimiter, max_results).await?;
        let known: HashSet<String> = infos
            .iter()
            .filter_map(|info| info.resource_id.object_name().map(str::to_owned))
            .collect();
        match self.cache.object_list(bucket).await {
            Ok(entries) => {
                let supplements =
                    self.supplemental_infos(entries, &known, prefix, delimiter).await?;
                infos.extend(supplements);
            }
            Err(error) => log::warn!("[cache] object list for '{bucket}' unavailable: {error}"),
        }
        Ok(infos)
    }

    async fn create_empty(&self, id: &ResourceId) -> Result<(), StoreError> {
        self.inner.create_empty(id).await?;
        self.record(id).await;
        Ok(())
    }

    async fn create_empty_batch(&self, ids: &[ResourceId]) -> Result<(), StoreError> {
        let result = self.inner.create_empty_batch(ids).await;
        if result.is_ok() {
            for id in ids {
                self.record(id).await;
            }
        }
        result
    }

    async fn create_bucket(&self, name: &str) -> Result<(), StoreError> {
        self.inner.create_bucket(name).await?;
        self.record(&ResourceId::Bucket(name.to_string())).await;
        Ok(())
    }

    async fn create_writer(
        &self,
        id: &ResourceId,
        options: &CreateFileOptions,
        precondition_override: Option<InsertPrecondition>,
    ) -> Result<StorageWriter, StoreError> {
        let mut writer = self.inner.create_writer(id, options, precondition_override).await?;
        writer.attach_cache(Arc::clone(&self.cache));
        Ok(writer)
    }

    async fn open_reader(
        &self,
        id: &ResourceId,
        options: &ReadOptions,
    ) -> Result<StorageReader, StoreError> {
        self.inner.open_reader(id, options).await
    }

    async fn copy(
        &self,
        src_bucket: &str,
        src_names: &[String],
        dst_bucket: &str,
        dst_names: &[String],
    ) -> Result<(), StoreError> {
        let result = self.inner.copy(src_bucket, src_names, dst_bucket, dst_names).await;
        if result.is_ok() {
            for name in dst_names {
                self.record(&ResourceId::Object {
                    bucket: dst_bucket.to_string(),
                    name: name.clone(),
                })
                .await;
            }
        }
        result
    }

    async fn delete_objects(&self, ids: &[ResourceId]) -> Result<(), StoreError> {
        let result = self.inner.delete_objects(ids).await;
        if result.is_ok() {
            for id in ids {
                self.forget(id).await;
            }
        }
        result
    }

    async fn delete_buckets(&self, names: &[String]) -> Result<(), StoreError> {
        let result = self.inner.delete_buckets(names).await;
        if result.is_ok() {
            for name in names {
                self.forget(&ResourceId::Bucket(name.clone())).await;
            }
        }
        result
    }

    async fn wait_for_bucket_empty(&self, name: &str) -> Result<(), StoreError> {
        self.inner.wait_for_bucket_empty(name).await
    }

    async fn update_items(&self, updates: &[MetadataUpdate]) -> Result<(), StoreError> {
        self.inner.update_items(updates).await?;
        for update in updates {
            self.record(&update.id).await;
        }
        Ok(())
    }

    async fn compose(
        &self,
        bucket: &str,
        sources: &[String],
        dest: &str,
        content_type: Option<&str>,
    ) -> Result<(), StoreError> {
        self.inner.compose(bucket, sources, dest, content_type).await?;
        self.record(&ResourceId::Object { bucket: bucket.to_string(), name: dest.to_string() })
            .await;
        Ok(())
    }
}
